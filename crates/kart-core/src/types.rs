//! Shared types for the kart announcer.
//!
//! These types are used across kart-lib and kart-cli. Keeping them in
//! kart-core means the status and claim shapes can be consumed without
//! pulling in tokio, rodio, or axum.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ─── Trigger sources ───────────────────────────────────────────────────────

/// Who asked for an announcement. Recorded as the claim holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    /// A physical button bound to the named slot.
    Button(String),
    /// A web request: ad hoc text (`"instant"`) or a named fixed announcement.
    Web(String),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Button(slot) => write!(f, "button:{slot}"),
            Source::Web(label) => write!(f, "web:{label}"),
        }
    }
}

// ─── Announcements ─────────────────────────────────────────────────────────

/// What an admitted announcement plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    /// Text that goes through the speech cache.
    Speech { text: String },
    /// A pre-recorded file played as-is, bypassing the cache.
    File { path: PathBuf },
}

impl Announcement {
    pub fn speech(text: impl Into<String>) -> Self {
        Announcement::Speech { text: text.into() }
    }

    /// Short description for log lines.
    pub fn describe(&self) -> String {
        match self {
            Announcement::Speech { text } => {
                let head: String = text.chars().take(50).collect();
                format!("speech \"{head}\"")
            }
            Announcement::File { path } => format!("file {}", path.display()),
        }
    }
}

/// Encoded audio container produced by the synthesis provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Wav,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "mp3" => Some(AudioFormat::Mp3),
            "wav" => Some(AudioFormat::Wav),
            _ => None,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

// ─── Status ────────────────────────────────────────────────────────────────

/// Observable playback state, derived from the claim record. Never a source
/// of truth on its own.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStatus {
    pub is_playing: bool,
    pub seconds_remaining: f64,
    /// A claim record is present on disk, live or not.
    pub lock_file_exists: bool,
}

impl PlaybackStatus {
    pub const IDLE: PlaybackStatus = PlaybackStatus {
        is_playing: false,
        seconds_remaining: 0.0,
        lock_file_exists: false,
    };
}
