//! Error types for the announcement engine.

use std::path::PathBuf;

/// Failures reported by a synthesis provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SynthError {
    /// Transient failure (network, provider 5xx, empty audio). Retry allowed.
    #[error("speech synthesis failed: {0}")]
    Failed(String),

    /// The provider rejected the request parameters (unknown voice, bad format).
    #[error("synthesis configuration rejected: {0}")]
    Configuration(String),
}

/// Speech cache failures. `Clone` so one in-flight result can be handed to
/// every caller waiting on the same key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("speech synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("invalid synthesis configuration: {0}")]
    Configuration(String),

    #[error("cache I/O error: {0}")]
    Io(String),
}

impl From<SynthError> for CacheError {
    fn from(e: SynthError) -> Self {
        match e {
            SynthError::Failed(msg) => CacheError::SynthesisFailed(msg),
            SynthError::Configuration(msg) => CacheError::Configuration(msg),
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io(e.to_string())
    }
}

/// Claim store failures.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("claim store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("claim store task failed: {0}")]
    Task(String),
}

/// Playback executor failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlaybackError {
    #[error("audio file not found: {0}")]
    FileMissing(PathBuf),

    #[error("audio output unavailable: {0}")]
    Device(String),

    #[error("could not decode audio: {0}")]
    Decode(String),
}

/// Admission-time errors returned synchronously to whoever asked for an
/// announcement.
#[derive(Debug, thiserror::Error)]
pub enum AnnounceError {
    /// Expected, not a fault: wait `seconds_remaining` and try again.
    #[error("Another announcement is currently playing")]
    AlreadyPlaying {
        holder: Option<String>,
        elapsed_secs: f64,
        seconds_remaining: f64,
    },

    #[error("Speech synthesis unavailable: {0}")]
    SynthesisUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown announcement slot '{0}'")]
    UnknownSlot(String),

    #[error("Empty announcement text")]
    EmptyText,

    #[error("Announcement file not found: {0}")]
    FileMissing(PathBuf),

    #[error("Speech cache error: {0}")]
    Cache(String),

    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error("Announcement task failed: {0}")]
    Task(String),
}

impl From<CacheError> for AnnounceError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::SynthesisFailed(msg) => AnnounceError::SynthesisUnavailable(msg),
            CacheError::Configuration(msg) => AnnounceError::Configuration(msg),
            CacheError::Io(msg) => AnnounceError::Cache(msg),
        }
    }
}

/// Config file failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Button monitor failures.
#[derive(Debug, thiserror::Error)]
pub enum ButtonError {
    #[error("no slots have a gpio line configured")]
    NoButtons,

    #[error("failed to set up gpio line {line}: {source}")]
    Line {
        line: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start sampler for {slot}: {source}")]
    Sampler {
        slot: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesis_failures_map_to_unavailable() {
        let e: AnnounceError = CacheError::from(SynthError::Failed("timeout".into())).into();
        assert!(matches!(e, AnnounceError::SynthesisUnavailable(ref m) if m == "timeout"));
    }

    #[test]
    fn configuration_errors_stay_configuration() {
        let e: AnnounceError = CacheError::from(SynthError::Configuration("voice".into())).into();
        assert!(matches!(e, AnnounceError::Configuration(_)));
    }

    #[test]
    fn already_playing_message_is_user_facing() {
        let e = AnnounceError::AlreadyPlaying {
            holder: None,
            elapsed_secs: 1.0,
            seconds_remaining: 2.0,
        };
        assert_eq!(e.to_string(), "Another announcement is currently playing");
    }
}
