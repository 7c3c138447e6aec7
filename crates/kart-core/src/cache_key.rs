//! Deterministic cache keys for synthesized speech.
//!
//! A key is the SHA-256 of (normalized text, voice, format) joined with a
//! unit separator, so `("ab", "c")` and `("a", "bc")` never collide. The
//! format is kept alongside the digest because it names the file extension.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::text_prep::normalize_text;
use crate::types::AudioFormat;

const FIELD_SEP: &[u8] = b"\x1f";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    digest: String,
    format: AudioFormat,
}

impl CacheKey {
    pub fn new(text: &str, voice: &str, format: AudioFormat) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_text(text).as_bytes());
        hasher.update(FIELD_SEP);
        hasher.update(voice.trim().as_bytes());
        hasher.update(FIELD_SEP);
        hasher.update(format.extension().as_bytes());
        Self {
            digest: hex::encode(hasher.finalize()),
            format,
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// File name of the committed entry, e.g. `3fa4…e1.mp3`.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.digest, self.format.extension())
    }

    /// Recover a key from a committed entry's file name. Temp files and
    /// foreign files yield `None`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (digest, ext) = name.rsplit_once('.')?;
        let format = AudioFormat::from_extension(ext)?;
        let valid = digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self {
            digest: digest.to_string(),
            format,
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.digest[..12])
    }
}
