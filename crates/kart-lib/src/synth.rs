//! Speech synthesis provider: opaque text → audio bytes.
//!
//! The engine only needs [`Synthesizer`]. [`HttpSynthesizer`] talks to any
//! OpenAI-compatible `/v1/audio/speech` endpoint (Kokoro-FastAPI, openedai-
//! speech, an edge-tts bridge) and collects the streamed body.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use tracing::{debug, error};

use kart_core::types::AudioFormat;

use crate::config::TtsSettings;
use crate::error::SynthError;

/// Upper bound on one synthesized announcement.
const MAX_AUDIO_BYTES: usize = 16 * 1024 * 1024;

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        format: AudioFormat,
    ) -> Result<Vec<u8>, SynthError>;

    /// Cheap liveness probe for dependency checks.
    async fn is_reachable(&self) -> bool {
        true
    }
}

pub struct HttpSynthesizer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpSynthesizer {
    pub fn new(settings: &TtsSettings) -> Result<Self, SynthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| SynthError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
        })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        format: AudioFormat,
    ) -> Result<Vec<u8>, SynthError> {
        let url = format!("{}/v1/audio/speech", self.endpoint);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice,
            "response_format": format.extension(),
        });

        debug!("synth: POST {} chars, voice {voice}", text.len());

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SynthError::Failed(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            error!("synth: provider error {status}: {detail}");
            return Err(classify(status, detail));
        }

        let mut audio = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SynthError::Failed(format!("stream error: {e}")))?;
            if audio.len() + chunk.len() > MAX_AUDIO_BYTES {
                return Err(SynthError::Failed(format!(
                    "audio exceeds {MAX_AUDIO_BYTES} bytes"
                )));
            }
            audio.extend_from_slice(&chunk);
        }

        if audio.is_empty() {
            return Err(SynthError::Failed("provider returned empty audio".into()));
        }
        debug!("synth: received {} bytes", audio.len());
        Ok(audio)
    }

    async fn is_reachable(&self) -> bool {
        self.client
            .get(format!("{}/", self.endpoint))
            .timeout(Duration::from_secs(1))
            .send()
            .await
            .is_ok()
    }
}

/// Parameter problems are not worth retrying; everything else is.
fn classify(status: StatusCode, detail: String) -> SynthError {
    let msg = format!("{status}: {detail}");
    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::UNPROCESSABLE_ENTITY => SynthError::Configuration(msg),
        _ => SynthError::Failed(msg),
    }
}
