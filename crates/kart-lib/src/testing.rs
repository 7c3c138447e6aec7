//! Test doubles shared across module tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use kart_core::types::AudioFormat;

use crate::error::{PlaybackError, SynthError};
use crate::player::{AudioClip, AudioOutput};
use crate::synth::Synthesizer;

/// Synthesizer that counts calls and returns `audio:<text>:<call#>`.
#[derive(Default)]
pub struct FakeSynth {
    pub calls: AtomicUsize,
    pub delay: Duration,
    /// Number of leading calls that fail with a retryable error.
    pub fail_first: AtomicUsize,
    pub reject_voice: Option<String>,
}

impl FakeSynth {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn failing(times: usize) -> Self {
        Self {
            fail_first: AtomicUsize::new(times),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Synthesizer for FakeSynth {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        _format: AudioFormat,
    ) -> Result<Vec<u8>, SynthError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.reject_voice.as_deref() == Some(voice) {
            return Err(SynthError::Configuration(format!("unknown voice {voice}")));
        }
        let failed = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SynthError::Failed("provider unavailable".into()));
        }
        Ok(format!("audio:{text}:{n}").into_bytes())
    }
}

/// Output that "plays" by sleeping, recording each clip label.
#[derive(Default)]
pub struct FakeOutput {
    pub played: Mutex<Vec<String>>,
    pub duration: Duration,
    pub fail: bool,
}

impl FakeOutput {
    pub fn lasting(duration: Duration) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    pub fn broken() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }
}

impl AudioOutput for FakeOutput {
    fn play(&self, clip: &AudioClip) -> Result<Duration, PlaybackError> {
        if self.fail {
            return Err(PlaybackError::Device("no sound card".into()));
        }
        std::thread::sleep(self.duration);
        self.played.lock().unwrap().push(clip.label.clone());
        Ok(self.duration)
    }

    fn is_available(&self) -> bool {
        !self.fail
    }
}

/// Minimal 16-bit mono PCM WAV.
pub fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut buf = Vec::with_capacity(44 + data_len as usize);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    buf
}
