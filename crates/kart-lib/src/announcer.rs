//! Announcer: turns a trigger into exactly one played announcement.
//!
//! ```text
//! announce(source, announcement)
//!   ├─ validate (empty text, missing file)      nothing claimed yet
//!   ├─ coordinator.admit(estimate)              ──busy──▶ AlreadyPlaying
//!   ├─ cache.resolve(text, voice, format)       ──fail──▶ withdraw, SynthesisUnavailable
//!   ├─ coordinator.extend(audio duration)
//!   └─ spawn: player.play → coordinator.release (always)
//! ```
//!
//! Admission returns as soon as playback has been handed off; the caller
//! gets an [`Admitted`] whose `completion` resolves when the speaker is done.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use kart_core::text_prep::{estimate_speech_duration, is_speakable, normalize_text};
use kart_core::types::{Announcement, PlaybackStatus, Source};

use crate::cache::{CacheLimits, SpeechCache};
use crate::claim_store::ClaimStore;
use crate::config::{AppConfig, SharedConfig};
use crate::coordinator::{Coordinator, PlaybackClaim};
use crate::error::{AnnounceError, ClaimError, ConfigError, PlaybackError};
use crate::player::{AudioClip, AudioOutput, PlaybackReport, Player, RodioOutput};
use crate::synth::{HttpSynthesizer, Synthesizer};

/// Estimate for a fixed file whose length the decoder cannot report.
const UNKNOWN_CLIP_ESTIMATE: Duration = Duration::from_secs(10);

/// An admitted announcement.
#[derive(Debug)]
pub struct Admitted {
    pub claim: PlaybackClaim,
    /// Playback length as last recorded on the claim.
    pub estimated: Duration,
    completion: JoinHandle<Result<PlaybackReport, PlaybackError>>,
}

impl Admitted {
    /// Wait for playback to finish. The claim has been released by the time
    /// this returns.
    pub async fn finished(self) -> Result<PlaybackReport, PlaybackError> {
        self.completion
            .await
            .map_err(|e| PlaybackError::Device(format!("playback task failed: {e}")))?
    }
}

enum Prepared {
    Speech(String),
    File(AudioClip),
}

#[derive(Clone)]
pub struct Announcer {
    config: SharedConfig,
    cache: SpeechCache,
    coordinator: Coordinator,
    player: Player,
}

impl Announcer {
    pub fn new(
        config: SharedConfig,
        cache: SpeechCache,
        coordinator: Coordinator,
        player: Player,
    ) -> Self {
        Self {
            config,
            cache,
            coordinator,
            player,
        }
    }

    /// Wire up the real provider, claim file and audio device from config.
    pub fn bootstrap(config: SharedConfig) -> Result<Self, AnnounceError> {
        let snapshot = config.snapshot();
        let synth: Arc<dyn Synthesizer> = Arc::new(
            HttpSynthesizer::new(&snapshot.tts)
                .map_err(|e| AnnounceError::Configuration(e.to_string()))?,
        );
        let output: Arc<dyn AudioOutput> = Arc::new(RodioOutput::spawn()?);
        Ok(Self::from_parts(config, synth, output))
    }

    /// Same as [`Announcer::bootstrap`] with the provider and device supplied.
    pub fn from_parts(
        config: SharedConfig,
        synth: Arc<dyn Synthesizer>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        let snapshot = config.snapshot();
        let cache = SpeechCache::new(
            snapshot.cache.dir.clone(),
            synth,
            CacheLimits::from(&snapshot.cache),
        );
        let store = Arc::new(ClaimStore::new(snapshot.playback.claim_path.clone()));
        let coordinator = Coordinator::new(store, snapshot.playback.policy());
        Self::new(config, cache, coordinator, Player::new(output))
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn cache(&self) -> &SpeechCache {
        &self.cache
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    pub async fn status(&self) -> Result<PlaybackStatus, ClaimError> {
        self.coordinator.status().await
    }

    /// Speak arbitrary text.
    pub async fn announce_text(
        &self,
        source: Source,
        text: &str,
    ) -> Result<Admitted, AnnounceError> {
        self.announce(source, Announcement::speech(text)).await
    }

    /// Play whatever the named slot is configured with.
    pub async fn announce_slot(
        &self,
        source: Source,
        slot: &str,
    ) -> Result<Admitted, AnnounceError> {
        let announcement = self
            .config
            .snapshot()
            .announcement_for(slot)
            .ok_or_else(|| AnnounceError::UnknownSlot(slot.to_string()))?;
        self.announce(source, announcement).await
    }

    /// Runs on its own task, so a caller that stops waiting (an HTTP client
    /// hanging up mid-synthesis) cannot strand an admitted claim.
    pub async fn announce(
        &self,
        source: Source,
        announcement: Announcement,
    ) -> Result<Admitted, AnnounceError> {
        let this = self.clone();
        tokio::spawn(async move { this.admit_and_start(source, announcement).await })
            .await
            .map_err(|e| AnnounceError::Task(e.to_string()))?
    }

    async fn admit_and_start(
        &self,
        source: Source,
        announcement: Announcement,
    ) -> Result<Admitted, AnnounceError> {
        let config = self.config.snapshot();
        debug!("announce: {source} requested {}", announcement.describe());

        let prepared = match announcement {
            Announcement::Speech { text } => {
                let text = normalize_text(&text);
                if !is_speakable(&text) {
                    return Err(AnnounceError::EmptyText);
                }
                Prepared::Speech(text)
            }
            Announcement::File { path } => match AudioClip::from_file(&path).await {
                Ok(clip) => Prepared::File(clip),
                Err(PlaybackError::FileMissing(path)) => {
                    return Err(AnnounceError::FileMissing(path));
                }
                Err(e) => return Err(e.into()),
            },
        };

        let estimated = match &prepared {
            Prepared::Speech(text) => {
                config.playback.synthesis_allowance() + estimate_speech_duration(text)
            }
            Prepared::File(clip) => clip.duration().unwrap_or(UNKNOWN_CLIP_ESTIMATE),
        };
        let claim = self.coordinator.admit(&source, estimated).await?;

        let clip = match prepared {
            Prepared::File(clip) => clip,
            Prepared::Speech(text) => {
                let format = config.tts.output_format;
                match self.cache.resolve(&text, &config.tts.voice_id, format).await {
                    Ok(audio) => AudioClip {
                        label: format!("{} ({})", audio.key, source),
                        bytes: audio.bytes,
                        format: Some(format),
                    },
                    Err(e) => {
                        error!("announce: {source} could not be synthesized: {e}");
                        if let Err(e) = self.coordinator.withdraw(&claim).await {
                            error!("announce: failed to withdraw claim: {e}");
                        }
                        return Err(e.into());
                    }
                }
            }
        };

        let estimated = match clip.duration() {
            Some(duration) => match self.coordinator.extend(&claim, duration).await {
                Ok(true) => duration,
                Ok(false) => {
                    warn!("announce: claim {} lost before playback", claim.token());
                    estimated
                }
                Err(e) => {
                    warn!("announce: could not refine estimate: {e}");
                    estimated
                }
            },
            None => estimated,
        };

        let completion = self.spawn_playback(claim.clone(), clip);
        Ok(Admitted {
            claim,
            estimated,
            completion,
        })
    }

    fn spawn_playback(
        &self,
        claim: PlaybackClaim,
        clip: AudioClip,
    ) -> JoinHandle<Result<PlaybackReport, PlaybackError>> {
        let player = self.player.clone();
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            let label = clip.label.clone();
            let result = player.play(clip).await;
            match &result {
                Ok(report) => info!(
                    "announce: finished {label} in {:.1}s",
                    report.duration.as_secs_f64()
                ),
                Err(e) => error!("announce: playback of {label} failed: {e}"),
            }
            if let Err(e) = coordinator.release(&claim).await {
                error!("announce: failed to release claim {}: {e}", claim.token());
            }
            result
        })
    }

    /// Pre-generate every configured slot text. Returns how many are cached.
    pub async fn warm(&self) -> usize {
        let config = self.config.snapshot();
        let texts = config.speech_texts();
        if texts.is_empty() {
            return 0;
        }
        self.cache
            .warm(&texts, &config.tts.voice_id, config.tts.output_format)
            .await
    }

    /// Pick up edits to the config file. Slot texts and voice apply to the
    /// next announcement; re-warms the cache when either changed.
    pub async fn reload_config(&self) -> Result<bool, ConfigError> {
        let Some(previous) = self.config.reload_if_changed()? else {
            return Ok(false);
        };
        let current = self.config.snapshot();
        info!("config: reloaded from disk");
        warn_on_restart_only_changes(&previous, &current);
        if previous.speech_texts() != current.speech_texts() || previous.tts != current.tts {
            self.warm().await;
        }
        Ok(true)
    }
}

fn warn_on_restart_only_changes(previous: &AppConfig, current: &AppConfig) {
    let restart_only = [
        ("playback", previous.playback != current.playback),
        ("cache", previous.cache != current.cache),
        ("server", previous.server != current.server),
        ("buttons", previous.buttons != current.buttons),
        (
            "tts endpoint",
            (&previous.tts.endpoint, &previous.tts.model, previous.tts.timeout_secs)
                != (&current.tts.endpoint, &current.tts.model, current.tts.timeout_secs),
        ),
    ];
    for (section, changed) in restart_only {
        if changed {
            warn!("config: {section} changes take effect after a restart");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlotConfig;
    use crate::testing::{FakeOutput, FakeSynth, wav_bytes};

    struct Rig {
        _dir: tempfile::TempDir,
        synth: Arc<FakeSynth>,
        output: Arc<FakeOutput>,
        announcer: Announcer,
    }

    fn rig_with(synth: FakeSynth, output: FakeOutput, edit: impl FnOnce(&mut AppConfig)) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.cache.dir = dir.path().join("cache");
        config.playback.claim_path = dir.path().join("announcement_playing.lock");
        config.playback.cooldown_secs = 0.0;
        config.playback.synthesis_allowance_secs = 5.0;
        config.slots.insert(
            "button1".into(),
            SlotConfig {
                text: Some("Please remain seated".into()),
                gpio: Some(17),
                ..Default::default()
            },
        );
        edit(&mut config);

        let synth = Arc::new(synth);
        let output = Arc::new(output);
        let announcer = Announcer::from_parts(
            SharedConfig::in_memory(config),
            synth.clone(),
            output.clone(),
        );
        Rig {
            _dir: dir,
            synth,
            output,
            announcer,
        }
    }

    fn rig() -> Rig {
        rig_with(
            FakeSynth::default(),
            FakeOutput::lasting(Duration::from_millis(100)),
            |_| {},
        )
    }

    fn web() -> Source {
        Source::Web("instant".into())
    }

    #[tokio::test]
    async fn caller_giving_up_mid_synthesis_still_finishes() {
        let rig = rig_with(
            FakeSynth::slow(Duration::from_millis(500)),
            FakeOutput::lasting(Duration::from_millis(100)),
            |_| {},
        );
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            rig.announcer.announce_text(web(), "Pit lane is open"),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(!rig.announcer.status().await.unwrap().is_playing);
        assert_eq!(rig.output.played().len(), 1);

        let retry = rig.announcer.announce_text(web(), "Pit lane is open").await.unwrap();
        retry.finished().await.unwrap();
        assert_eq!(rig.output.played().len(), 2);
    }

    #[tokio::test]
    async fn plays_and_releases() {
        let rig = rig();
        let admitted = rig.announcer.announce_text(web(), "Hello  racers").await.unwrap();
        assert!(rig.announcer.status().await.unwrap().is_playing);

        admitted.finished().await.unwrap();
        assert_eq!(rig.output.played().len(), 1);
        assert!(!rig.announcer.status().await.unwrap().is_playing);
        assert_eq!(rig.synth.calls(), 1);
    }

    #[tokio::test]
    async fn button_while_web_playing_is_rejected() {
        let rig = rig();
        let first = rig.announcer.announce_text(web(), "Track is open").await.unwrap();

        let err = rig
            .announcer
            .announce_slot(Source::Button("button1".into()), "button1")
            .await
            .unwrap_err();
        assert!(matches!(err, AnnounceError::AlreadyPlaying { .. }));

        first.finished().await.unwrap();
        assert_eq!(rig.output.played().len(), 1);
    }

    #[tokio::test]
    async fn simultaneous_triggers_play_once() {
        let rig = rig();
        let a = rig.announcer.clone();
        let b = rig.announcer.clone();
        let (ra, rb) = tokio::join!(
            a.announce_slot(Source::Button("button1".into()), "button1"),
            b.announce_text(web(), "Please remain seated"),
        );
        let winners: Vec<Admitted> = [ra, rb].into_iter().filter_map(Result::ok).collect();
        assert_eq!(winners.len(), 1);
        for w in winners {
            w.finished().await.unwrap();
        }
        assert_eq!(rig.output.played().len(), 1);
    }

    #[tokio::test]
    async fn empty_text_is_rejected_before_admission() {
        let rig = rig();
        assert!(matches!(
            rig.announcer.announce_text(web(), "   \n ").await,
            Err(AnnounceError::EmptyText)
        ));
        assert!(!rig.announcer.status().await.unwrap().lock_file_exists);
        assert_eq!(rig.synth.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_slot() {
        let rig = rig();
        assert!(matches!(
            rig.announcer.announce_slot(web(), "button9").await,
            Err(AnnounceError::UnknownSlot(s)) if s == "button9"
        ));
    }

    #[tokio::test]
    async fn synthesis_failure_frees_the_claim() {
        let rig = rig_with(
            FakeSynth::failing(1),
            FakeOutput::lasting(Duration::from_millis(10)),
            |c| c.playback.cooldown_secs = 60.0,
        );
        assert!(matches!(
            rig.announcer.announce_text(web(), "Hello").await,
            Err(AnnounceError::SynthesisUnavailable(_))
        ));
        let status = rig.announcer.status().await.unwrap();
        assert!(!status.is_playing);

        // Not cached, and no cooldown: the retry goes straight through.
        rig.announcer.announce_text(web(), "Hello").await.unwrap().finished().await.unwrap();
        assert_eq!(rig.synth.calls(), 2);
    }

    #[tokio::test]
    async fn rejected_voice_is_a_configuration_error() {
        let synth = FakeSynth {
            reject_voice: Some("nobody".into()),
            ..Default::default()
        };
        let rig = rig_with(synth, FakeOutput::default(), |c| c.tts.voice_id = "nobody".into());
        assert!(matches!(
            rig.announcer.announce_text(web(), "Hello").await,
            Err(AnnounceError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn playback_failure_still_releases() {
        let rig = rig_with(FakeSynth::default(), FakeOutput::broken(), |_| {});
        let admitted = rig.announcer.announce_text(web(), "Hello").await.unwrap();
        assert!(matches!(admitted.finished().await, Err(PlaybackError::Device(_))));
        assert!(!rig.announcer.status().await.unwrap().lock_file_exists);
    }

    #[tokio::test]
    async fn file_slot_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("welcome.wav");
        std::fs::write(&path, wav_bytes(&vec![0; 8_000], 8_000)).unwrap();

        let file = path.clone();
        let rig = rig_with(FakeSynth::default(), FakeOutput::default(), move |c| {
            c.slots.insert(
                "welcome".into(),
                SlotConfig {
                    file: Some(file),
                    ..Default::default()
                },
            );
        });
        let admitted = rig.announcer.announce_slot(web(), "welcome").await.unwrap();
        assert_eq!(admitted.estimated, Duration::from_secs(1));
        admitted.finished().await.unwrap();
        assert_eq!(rig.synth.calls(), 0);
        assert_eq!(rig.output.played(), vec![path.display().to_string()]);
    }

    #[tokio::test]
    async fn missing_file_is_rejected_before_admission() {
        let rig = rig_with(FakeSynth::default(), FakeOutput::default(), |c| {
            c.slots.insert(
                "welcome".into(),
                SlotConfig {
                    file: Some("/nonexistent/welcome.mp3".into()),
                    ..Default::default()
                },
            );
        });
        assert!(matches!(
            rig.announcer.announce_slot(web(), "welcome").await,
            Err(AnnounceError::FileMissing(_))
        ));
        assert!(!rig.announcer.status().await.unwrap().lock_file_exists);
    }

    #[tokio::test]
    async fn warm_caches_slot_texts() {
        let rig = rig();
        assert_eq!(rig.announcer.warm().await, 1);
        rig.announcer
            .announce_slot(Source::Button("button1".into()), "button1")
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();
        assert_eq!(rig.synth.calls(), 1);
    }

    #[tokio::test]
    async fn reload_picks_up_new_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kart.toml");
        let mut config = AppConfig::default();
        config.cache.dir = dir.path().join("cache");
        config.playback.claim_path = dir.path().join("playing.lock");
        config.save(&path).unwrap();

        let shared = SharedConfig::load(&path).unwrap();
        let synth = Arc::new(FakeSynth::default());
        let announcer = Announcer::from_parts(shared, synth.clone(), Arc::new(FakeOutput::default()));
        assert!(!announcer.reload_config().await.unwrap());

        config.slots.insert(
            "button2".into(),
            SlotConfig {
                text: Some("Final lap".into()),
                ..Default::default()
            },
        );
        config.save(&path).unwrap();
        let later = std::time::SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert!(announcer.reload_config().await.unwrap());
        assert!(announcer.config().snapshot().slot("button2").is_some());
        assert_eq!(synth.calls(), 1);
    }
}
