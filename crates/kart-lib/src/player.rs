//! Playback executor: plays one audio clip to completion.
//!
//! rodio's `OutputStream` is not `Send`, so the device lives on a dedicated
//! OS thread and clips are handed to it over a channel, each with a reply
//! channel that fires when the sink drains.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use tracing::{debug, error, info};

use kart_core::mp3;
use kart_core::types::AudioFormat;

use crate::error::PlaybackError;

/// Bitrate assumed when an MP3 stream has no readable frame header.
const MP3_FALLBACK_BITRATE: f64 = 48_000.0;

/// Encoded audio ready to play.
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// Shown in logs, e.g. the cache key or file name.
    pub label: String,
    pub bytes: Arc<[u8]>,
    pub format: Option<AudioFormat>,
}

impl AudioClip {
    /// Read an audio file fully into memory.
    pub async fn from_file(path: &Path) -> Result<Self, PlaybackError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PlaybackError::FileMissing(path.to_path_buf()));
            }
            Err(e) => return Err(PlaybackError::Decode(format!("{}: {e}", path.display()))),
        };
        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(AudioFormat::from_extension);
        Ok(Self {
            label: path.display().to_string(),
            bytes: bytes.into(),
            format,
        })
    }

    /// Play length, from the decoder when it knows, otherwise estimated from
    /// the MP3 byte count at the bitrate the first frame declares.
    pub fn duration(&self) -> Option<Duration> {
        let decoded = Decoder::new(Cursor::new(self.bytes.clone()))
            .ok()
            .and_then(|d| d.total_duration());
        decoded.or_else(|| match self.format {
            Some(AudioFormat::Mp3) => mp3::estimate_duration(&self.bytes).or_else(|| {
                Some(Duration::from_secs_f64(
                    self.bytes.len() as f64 * 8.0 / MP3_FALLBACK_BITRATE,
                ))
            }),
            _ => None,
        })
    }
}

/// Blocking audio sink. `play` returns once the clip has finished.
pub trait AudioOutput: Send + Sync {
    fn play(&self, clip: &AudioClip) -> Result<Duration, PlaybackError>;

    fn is_available(&self) -> bool;
}

// ─── rodio output ──────────────────────────────────────────────────────────

struct PlayCmd {
    label: String,
    bytes: Arc<[u8]>,
    reply: mpsc::Sender<Result<Duration, PlaybackError>>,
}

/// Default output device, driven from the `kart-playback` thread.
pub struct RodioOutput {
    cmd_tx: mpsc::Sender<PlayCmd>,
    available: Arc<AtomicBool>,
}

impl RodioOutput {
    /// Start the playback thread and wait for it to open the device. A
    /// missing device is not fatal: the output reports unavailable and every
    /// `play` fails with [`PlaybackError::Device`].
    pub fn spawn() -> Result<Self, PlaybackError> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<PlayCmd>();
        let (ready_tx, ready_rx) = mpsc::channel::<bool>();
        let available = Arc::new(AtomicBool::new(false));

        let flag = available.clone();
        std::thread::Builder::new()
            .name("kart-playback".into())
            .spawn(move || playback_thread(cmd_rx, ready_tx, flag))
            .map_err(|e| PlaybackError::Device(format!("failed to spawn playback thread: {e}")))?;

        if ready_rx.recv().unwrap_or(false) {
            info!("playback: audio output ready");
        }
        Ok(Self { cmd_tx, available })
    }
}

impl AudioOutput for RodioOutput {
    fn play(&self, clip: &AudioClip) -> Result<Duration, PlaybackError> {
        let (reply, done) = mpsc::channel();
        self.cmd_tx
            .send(PlayCmd {
                label: clip.label.clone(),
                bytes: clip.bytes.clone(),
                reply,
            })
            .map_err(|_| PlaybackError::Device("playback thread exited".into()))?;
        done.recv()
            .map_err(|_| PlaybackError::Device("playback thread exited".into()))?
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

fn playback_thread(
    cmd_rx: mpsc::Receiver<PlayCmd>,
    ready_tx: mpsc::Sender<bool>,
    available: Arc<AtomicBool>,
) {
    let (_stream, stream_handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            error!("playback: failed to open audio output: {e}");
            let _ = ready_tx.send(false);
            let reason = e.to_string();
            for cmd in cmd_rx {
                let _ = cmd.reply.send(Err(PlaybackError::Device(reason.clone())));
            }
            return;
        }
    };
    available.store(true, Ordering::SeqCst);
    let _ = ready_tx.send(true);

    for cmd in cmd_rx {
        let result = play_one(&stream_handle, &cmd.label, cmd.bytes);
        let _ = cmd.reply.send(result);
    }
    debug!("playback: command channel closed");
}

fn play_one(
    stream_handle: &OutputStreamHandle,
    label: &str,
    bytes: Arc<[u8]>,
) -> Result<Duration, PlaybackError> {
    let sink = Sink::try_new(stream_handle).map_err(|e| PlaybackError::Device(e.to_string()))?;
    let source = Decoder::new(Cursor::new(bytes))
        .map_err(|e| PlaybackError::Decode(format!("{label}: {e}")))?;
    let started = Instant::now();
    debug!("playback: playing {label}");
    sink.append(source);
    sink.sleep_until_end();
    Ok(started.elapsed())
}

// ─── Async front ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackReport {
    pub duration: Duration,
}

/// Async handle over an [`AudioOutput`]; playback runs on the blocking pool.
#[derive(Clone)]
pub struct Player {
    output: Arc<dyn AudioOutput>,
}

impl Player {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self { output }
    }

    pub fn is_available(&self) -> bool {
        self.output.is_available()
    }

    pub async fn play(&self, clip: AudioClip) -> Result<PlaybackReport, PlaybackError> {
        let output = self.output.clone();
        let duration = tokio::task::spawn_blocking(move || output.play(&clip))
            .await
            .map_err(|e| PlaybackError::Device(format!("playback task failed: {e}")))??;
        Ok(PlaybackReport { duration })
    }
}
