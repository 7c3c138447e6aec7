//! Config record: slots, voice and timing tunables.
//!
//! Loaded from a TOML file. Every section has defaults, so a file holding
//! only `[slots.*]` and `[tts] voice_id` is enough. The record is read at
//! request time through [`SharedConfig`]; changing it never touches cache
//! entries written under the old text or voice.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use kart_core::claim::ClaimPolicy;
use kart_core::debounce::DebounceTiming;
use kart_core::types::{Announcement, AudioFormat};

use crate::error::ConfigError;

// ─── Sections ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    pub voice_id: String,
    pub output_format: AudioFormat,
    /// Base URL of an OpenAI-compatible `/v1/audio/speech` provider.
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            voice_id: "en-US-GuyNeural".into(),
            output_format: AudioFormat::Mp3,
            endpoint: "http://127.0.0.1:8880".into(),
            model: "tts-1".into(),
            timeout_secs: 30,
        }
    }
}

/// One announcement slot: either text to synthesize or a fixed file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// GPIO line of the button bound to this slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpio: Option<u32>,
}

impl SlotConfig {
    pub fn is_fixed(&self) -> bool {
        self.file.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Claim record shared by every process on the host.
    pub claim_path: PathBuf,
    pub cooldown_secs: f64,
    /// Margin past a claim's estimate before it is treated as abandoned.
    /// Must cover the longest plausible overrun of a real announcement.
    pub stale_grace_secs: f64,
    /// Added to the spoken estimate while synthesis may still be running.
    pub synthesis_allowance_secs: f64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            claim_path: PathBuf::from("/tmp/announcement_playing.lock"),
            cooldown_secs: 8.0,
            stale_grace_secs: 30.0,
            synthesis_allowance_secs: 20.0,
        }
    }
}

impl PlaybackSettings {
    pub fn policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            cooldown: secs(self.cooldown_secs),
            stale_grace: secs(self.stale_grace_secs),
        }
    }

    pub fn synthesis_allowance(&self) -> Duration {
        secs(self.synthesis_allowance_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub max_bytes: u64,
    pub max_age_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp/tts_cache"),
            max_bytes: 100 * 1024 * 1024,
            max_age_secs: 30 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonSettings {
    pub debounce_ms: u64,
    pub cooldown_ms: u64,
    pub poll_ms: u64,
    /// Buttons pull the line to ground when pressed.
    pub active_low: bool,
    pub gpio_root: PathBuf,
}

impl Default for ButtonSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            cooldown_ms: 500,
            poll_ms: 5,
            active_low: true,
            gpio_root: PathBuf::from("/sys/class/gpio"),
        }
    }
}

impl ButtonSettings {
    pub fn timing(&self) -> DebounceTiming {
        DebounceTiming {
            window: Duration::from_millis(self.debounce_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
        }
    }
}

// ─── Top level ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tts: TtsSettings,
    pub slots: BTreeMap<String, SlotConfig>,
    pub playback: PlaybackSettings,
    pub cache: CacheSettings,
    pub buttons: ButtonSettings,
    pub server: ServerSettings,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&raw).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        info!("configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let body = toml::to_string_pretty(self)?;
        let tmp = path.with_extension("toml.tmp");
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        std::fs::write(&tmp, body).map_err(write_err)?;
        std::fs::rename(&tmp, path).map_err(write_err)?;
        debug!("configuration written to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, slot) in &self.slots {
            if slot.text.is_some() && slot.file.is_some() {
                return Err(ConfigError::Invalid(format!(
                    "slot '{name}' sets both text and file"
                )));
            }
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ConfigError::Invalid(format!(
                    "slot name '{name}' must be alphanumeric or '_'"
                )));
            }
        }
        let needs_voice = self
            .slots
            .values()
            .any(|s| s.text.as_deref().is_some_and(|t| !t.trim().is_empty()));
        if needs_voice && self.tts.voice_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "missing required TTS voice_id configuration".into(),
            ));
        }
        let timings = [
            ("playback.cooldown_secs", self.playback.cooldown_secs),
            ("playback.stale_grace_secs", self.playback.stale_grace_secs),
            ("playback.synthesis_allowance_secs", self.playback.synthesis_allowance_secs),
        ];
        for (name, value) in timings {
            if !(0.0..=MAX_TIMING_SECS).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 0 and {MAX_TIMING_SECS} seconds, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn slot(&self, name: &str) -> Option<&SlotConfig> {
        self.slots.get(name)
    }

    /// What the named slot plays. `None` for unknown slots; an empty
    /// announcement for slots with neither text nor file.
    pub fn announcement_for(&self, name: &str) -> Option<Announcement> {
        let slot = self.slots.get(name)?;
        Some(match (&slot.file, &slot.text) {
            (Some(path), _) => Announcement::File { path: path.clone() },
            (None, Some(text)) => Announcement::speech(text.clone()),
            (None, None) => Announcement::speech(""),
        })
    }

    /// Slot texts worth pre-generating.
    pub fn speech_texts(&self) -> Vec<(String, String)> {
        self.slots
            .iter()
            .filter_map(|(name, slot)| {
                let text = slot.text.as_deref()?.trim();
                (!text.is_empty()).then(|| (name.clone(), text.to_string()))
            })
            .collect()
    }

    /// Slots with a button line, as `(slot, line)`.
    pub fn button_lines(&self) -> Vec<(String, u32)> {
        self.slots
            .iter()
            .filter_map(|(name, slot)| slot.gpio.map(|pin| (name.clone(), pin)))
            .collect()
    }

    pub fn fixed_slots(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.is_fixed())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Upper bound for any seconds-valued tunable (one day).
const MAX_TIMING_SECS: f64 = 86_400.0;

/// Seconds to a duration, clamped to the validated range. NaN maps to zero.
fn secs(s: f64) -> Duration {
    if s.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(s.clamp(0.0, MAX_TIMING_SECS))
}

// ─── Shared handle ─────────────────────────────────────────────────────────

struct Loaded {
    config: AppConfig,
    modified: Option<SystemTime>,
}

/// Cloneable handle to the live config record, optionally backed by a file.
#[derive(Clone)]
pub struct SharedConfig {
    path: Option<PathBuf>,
    inner: Arc<RwLock<Loaded>>,
}

impl SharedConfig {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = AppConfig::load(&path)?;
        let modified = mtime(&path);
        Ok(Self {
            path: Some(path),
            inner: Arc::new(RwLock::new(Loaded { config, modified })),
        })
    }

    pub fn in_memory(config: AppConfig) -> Self {
        Self {
            path: None,
            inner: Arc::new(RwLock::new(Loaded {
                config,
                modified: None,
            })),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> AppConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .config
            .clone()
    }

    /// Re-read the file if its mtime moved. Returns the previous record when
    /// a reload happened.
    pub fn reload_if_changed(&self) -> Result<Option<AppConfig>, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let current = mtime(path);
        let known = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .modified;
        if current.is_none() || current == known {
            return Ok(None);
        }
        let config = AppConfig::load(path)?;
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut guard.config, config);
        guard.modified = current;
        Ok(Some(previous))
    }

    /// Apply an edit, validate, persist (when file-backed), then publish.
    pub fn update(&self, edit: impl FnOnce(&mut AppConfig)) -> Result<AppConfig, ConfigError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.config.clone();
        edit(&mut next);
        next.validate()?;
        if let Some(path) = &self.path {
            next.save(path)?;
            guard.modified = mtime(path);
        }
        guard.config = next.clone();
        Ok(next)
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[tts]
voice_id = "en-US-AriaNeural"

[slots.button1]
text = "Please remain seated"
gpio = 17

[slots.button2]
text = "  "
gpio = 27

[slots.yiddish]
file = "/home/tech/yiddish.mp3"
gpio = 23

[playback]
cooldown_secs = 0
"#;

    #[test]
    fn parses_with_defaults() {
        let config = AppConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.tts.voice_id, "en-US-AriaNeural");
        assert_eq!(config.tts.output_format, AudioFormat::Mp3);
        assert_eq!(config.playback.cooldown_secs, 0.0);
        assert_eq!(config.playback.stale_grace_secs, 30.0);
        assert_eq!(config.cache.dir, PathBuf::from("/tmp/tts_cache"));
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn slot_queries() {
        let config = AppConfig::parse(SAMPLE).unwrap();
        assert_eq!(
            config.speech_texts(),
            vec![("button1".to_string(), "Please remain seated".to_string())]
        );
        assert_eq!(config.fixed_slots(), vec!["yiddish".to_string()]);
        assert_eq!(config.button_lines().len(), 3);
        assert_eq!(
            config.announcement_for("yiddish"),
            Some(Announcement::File {
                path: "/home/tech/yiddish.mp3".into()
            })
        );
        assert_eq!(config.announcement_for("nope"), None);
    }

    #[test]
    fn rejects_text_and_file_together() {
        let raw = "[slots.a]\ntext = \"x\"\nfile = \"/tmp/a.mp3\"\n";
        assert!(matches!(AppConfig::parse(raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_missing_voice_when_text_configured() {
        let raw = "[tts]\nvoice_id = \"\"\n[slots.a]\ntext = \"hello\"\n";
        assert!(matches!(AppConfig::parse(raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_out_of_range_timings() {
        for raw in [
            "[playback]\nstale_grace_secs = 1e20\n",
            "[playback]\nsynthesis_allowance_secs = -1.0\n",
            "[playback]\ncooldown_secs = inf\n",
            "[playback]\ncooldown_secs = nan\n",
        ] {
            assert!(
                matches!(AppConfig::parse(raw), Err(ConfigError::Invalid(_))),
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn huge_timings_clamp_instead_of_vanishing() {
        let playback = PlaybackSettings {
            stale_grace_secs: 1e20,
            ..Default::default()
        };
        assert_eq!(playback.policy().stale_grace, Duration::from_secs(86_400));
        assert_eq!(secs(f64::NAN), Duration::ZERO);
    }

    #[test]
    fn rejects_unknown_format() {
        let raw = "[tts]\noutput_format = \"flac\"\n";
        assert!(matches!(AppConfig::parse(raw), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let shared = SharedConfig::load(&path).unwrap();
        let updated = shared
            .update(|c| {
                c.slots.entry("button2".into()).or_default().text = Some("Drivers, slow down".into());
            })
            .unwrap();
        assert_eq!(
            updated.slot("button2").and_then(|s| s.text.as_deref()),
            Some("Drivers, slow down")
        );

        let reread = AppConfig::load(&path).unwrap();
        assert_eq!(reread, updated);
    }

    #[test]
    fn invalid_update_is_not_published() {
        let shared = SharedConfig::in_memory(AppConfig::parse(SAMPLE).unwrap());
        let result = shared.update(|c| c.tts.voice_id.clear());
        assert!(result.is_err());
        assert_eq!(shared.snapshot().tts.voice_id, "en-US-AriaNeural");
    }

    #[test]
    fn reload_detects_file_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let shared = SharedConfig::load(&path).unwrap();
        assert!(shared.reload_if_changed().unwrap().is_none());

        let edited = SAMPLE.replace("Please remain seated", "Final lap");
        std::fs::write(&path, edited).unwrap();
        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let previous = shared.reload_if_changed().unwrap().unwrap();
        assert_eq!(
            previous.slot("button1").and_then(|s| s.text.as_deref()),
            Some("Please remain seated")
        );
        assert_eq!(
            shared.snapshot().slot("button1").and_then(|s| s.text.as_deref()),
            Some("Final lap")
        );
    }
}
