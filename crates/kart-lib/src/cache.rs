//! Speech cache: (text, voice, format) → audio on disk, synthesized on miss.
//!
//! ```text
//! resolve(text) → lookup(key) ──hit──▶ bytes
//!                    │ miss
//!                    ▼
//!             in-flight map ──follower──▶ wait on the leader's watch channel
//!                    │ leader
//!                    ▼
//!       synthesize → write .tmp-<uuid> → rename to <digest>.<ext> → prune
//! ```
//!
//! Entries are immutable once renamed into place, so readers never observe a
//! partial file. Single-flight is per process; two processes missing the same
//! key at once may both synthesize, and the last rename wins with identical
//! content. Failures are handed to every waiter but never stored.
//!
//! Resolved audio is returned as shared bytes, so clearing or pruning the
//! directory never disturbs an announcement that is already playing.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use kart_core::cache_key::CacheKey;
use kart_core::text_prep::normalize_text;
use kart_core::types::AudioFormat;

use crate::config::CacheSettings;
use crate::error::CacheError;
use crate::synth::Synthesizer;

const TEMP_PREFIX: &str = ".tmp-";

/// Temp files older than this belong to a writer that died.
const TEMP_MAX_AGE: Duration = Duration::from_secs(10 * 60);

type FlightResult = Option<Result<CachedAudio, CacheError>>;

/// A resolved cache entry. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CachedAudio {
    pub key: CacheKey,
    pub path: PathBuf,
    pub bytes: Arc<[u8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_bytes: u64,
    /// Entries not accessed for this long are evicted.
    pub max_age: Duration,
}

impl From<&CacheSettings> for CacheLimits {
    fn from(s: &CacheSettings) -> Self {
        Self {
            max_bytes: s.max_bytes,
            max_age: Duration::from_secs(s.max_age_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cache_count: usize,
    pub cache_size_bytes: u64,
    pub cache_size_mb: f64,
    pub cache_location: PathBuf,
}

struct Entry {
    key: CacheKey,
    path: PathBuf,
    size: u64,
    accessed: SystemTime,
}

struct Inner {
    dir: PathBuf,
    synth: Arc<dyn Synthesizer>,
    limits: CacheLimits,
    inflight: Mutex<HashMap<CacheKey, watch::Receiver<FlightResult>>>,
}

/// Cloneable handle to the speech cache.
#[derive(Clone)]
pub struct SpeechCache {
    inner: Arc<Inner>,
}

enum Role<'a> {
    Leader(Flight<'a>),
    Follower(watch::Receiver<FlightResult>),
}

/// Held by the one caller synthesizing a key. Dropping it (normally or by
/// cancellation) removes the in-flight entry; a dropped sender wakes the
/// followers so one of them can take over.
struct Flight<'a> {
    inner: &'a Inner,
    key: CacheKey,
    tx: watch::Sender<FlightResult>,
}

impl Flight<'_> {
    fn finish(self, result: Result<CachedAudio, CacheError>) {
        let _ = self.tx.send(Some(result));
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl SpeechCache {
    pub fn new(dir: impl Into<PathBuf>, synth: Arc<dyn Synthesizer>, limits: CacheLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: dir.into(),
                synth,
                limits,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn synthesizer(&self) -> &Arc<dyn Synthesizer> {
        &self.inner.synth
    }

    /// Return the audio for `(text, voice, format)`, synthesizing it at most
    /// once per key no matter how many callers ask concurrently.
    pub async fn resolve(
        &self,
        text: &str,
        voice: &str,
        format: AudioFormat,
    ) -> Result<CachedAudio, CacheError> {
        if voice.trim().is_empty() {
            return Err(CacheError::Configuration("voice id is empty".into()));
        }
        let key = CacheKey::new(text, voice, format);

        loop {
            if let Some(hit) = self.lookup(&key).await? {
                debug!("cache: hit {key}");
                return Ok(hit);
            }

            match self.join_or_lead(&key) {
                Role::Follower(mut rx) => {
                    debug!("cache: waiting on in-flight synthesis of {key}");
                    if let Ok(value) = rx.wait_for(Option::is_some).await {
                        if let Some(result) = value.as_ref() {
                            return result.clone();
                        }
                    }
                    // Leader went away without a result; try again.
                }
                Role::Leader(flight) => {
                    let result = self.synthesize_and_commit(&key, text, voice, format).await;
                    flight.finish(result.clone());
                    return result;
                }
            }
        }
    }

    /// Read a committed entry. Zero-length files count as misses.
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedAudio>, CacheError> {
        let path = self.entry_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                touch(path.clone()).await;
                Ok(Some(CachedAudio {
                    key: key.clone(),
                    path,
                    bytes: Arc::from(bytes),
                }))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Pre-generate every `(slot, text)`. Returns how many are ready.
    pub async fn warm(&self, texts: &[(String, String)], voice: &str, format: AudioFormat) -> usize {
        info!("pre-generating {} announcement(s)", texts.len());
        let mut ready = 0;
        for (slot, text) in texts {
            match self.resolve(text, voice, format).await {
                Ok(audio) => {
                    debug!("cache: {slot} ready at {}", audio.path.display());
                    ready += 1;
                }
                Err(e) => error!("cache: failed to pre-generate {slot}: {e}"),
            }
        }
        info!("finished pre-generating: {ready}/{} ready", texts.len());
        ready
    }

    /// Delete every committed entry. In-flight writers are left alone and
    /// publish normally afterwards.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let (entries, _) = self.scan().await?;
        let mut removed = 0;
        for entry in entries {
            if remove_quietly(&entry.path).await? {
                removed += 1;
            }
        }
        info!("cache cleared: {removed} entries removed");
        Ok(removed)
    }

    /// Apply the age and size bounds. Returns how many files were deleted.
    pub async fn prune(&self) -> Result<usize, CacheError> {
        self.prune_keeping(None).await
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let (entries, _) = self.scan().await?;
        let size: u64 = entries.iter().map(|e| e.size).sum();
        Ok(CacheStats {
            cache_count: entries.len(),
            cache_size_bytes: size,
            cache_size_mb: (size as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
            cache_location: self.inner.dir.clone(),
        })
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.inner.dir.join(key.file_name())
    }

    fn join_or_lead(&self, key: &CacheKey) -> Role<'_> {
        let mut inflight = self
            .inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = inflight.get(key) {
            return Role::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        inflight.insert(key.clone(), rx);
        Role::Leader(Flight {
            inner: &self.inner,
            key: key.clone(),
            tx,
        })
    }

    async fn synthesize_and_commit(
        &self,
        key: &CacheKey,
        text: &str,
        voice: &str,
        format: AudioFormat,
    ) -> Result<CachedAudio, CacheError> {
        // A previous leader may have committed between our miss and our lead.
        if let Some(hit) = self.lookup(key).await? {
            return Ok(hit);
        }

        let text = normalize_text(text);
        info!("cache: miss {key}, synthesizing {} chars", text.len());
        let audio = self.inner.synth.synthesize(&text, voice, format).await?;
        let path = self.commit(key, &audio).await?;

        if let Err(e) = self.prune_keeping(Some(key)).await {
            warn!("cache: prune failed: {e}");
        }

        Ok(CachedAudio {
            key: key.clone(),
            path,
            bytes: Arc::from(audio),
        })
    }

    /// Write to a unique temp file, then rename into place.
    async fn commit(&self, key: &CacheKey, audio: &[u8]) -> Result<PathBuf, CacheError> {
        tokio::fs::create_dir_all(&self.inner.dir).await?;
        let tmp = self.inner.dir.join(format!(
            "{TEMP_PREFIX}{}.{}",
            uuid::Uuid::new_v4().simple(),
            key.format().extension()
        ));
        let path = self.entry_path(key);

        let written = match tokio::fs::write(&tmp, audio).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("cache: committed {} ({} bytes)", path.display(), audio.len());
        Ok(path)
    }

    async fn prune_keeping(&self, keep: Option<&CacheKey>) -> Result<usize, CacheError> {
        let now = SystemTime::now();
        let age = |t: SystemTime| now.duration_since(t).unwrap_or_default();
        let (entries, temps) = self.scan().await?;

        let (expired, mut live): (Vec<Entry>, Vec<Entry>) = entries
            .into_iter()
            .partition(|e| keep != Some(&e.key) && age(e.accessed) > self.inner.limits.max_age);

        let mut doomed: Vec<PathBuf> = expired.into_iter().map(|e| e.path).collect();
        doomed.extend(
            temps
                .into_iter()
                .filter(|(_, modified)| age(*modified) > TEMP_MAX_AGE)
                .map(|(path, _)| path),
        );

        live.sort_by_key(|e| e.accessed);
        let mut total: u64 = live.iter().map(|e| e.size).sum();
        for entry in &live {
            if total <= self.inner.limits.max_bytes {
                break;
            }
            if keep == Some(&entry.key) {
                continue;
            }
            total -= entry.size;
            doomed.push(entry.path.clone());
        }

        let mut removed = 0;
        for path in doomed {
            if remove_quietly(&path).await? {
                debug!("cache: evicted {}", path.display());
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Committed entries plus `(path, mtime)` of temp files.
    async fn scan(&self) -> Result<(Vec<Entry>, Vec<(PathBuf, SystemTime)>), CacheError> {
        let mut entries = Vec::new();
        let mut temps = Vec::new();

        let mut dir = match tokio::fs::read_dir(&self.inner.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((entries, temps)),
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(meta) = item.metadata().await else { continue };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if name.starts_with(TEMP_PREFIX) {
                temps.push((item.path(), modified));
            } else if let Some(key) = CacheKey::from_file_name(name) {
                entries.push(Entry {
                    key,
                    path: item.path(),
                    size: meta.len(),
                    accessed: modified,
                });
            }
        }
        Ok((entries, temps))
    }
}

/// Record a hit as the entry's last access (its mtime). Best effort.
async fn touch(path: PathBuf) {
    let result = tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|f| f.set_modified(SystemTime::now()))
    })
    .await;
    if let Ok(Err(e)) = result {
        debug!("cache: could not refresh access time: {e}");
    }
}

/// Remove a file; a file that is already gone is not an error.
async fn remove_quietly(path: &Path) -> Result<bool, CacheError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSynth;

    const VOICE: &str = "en-US-GuyNeural";

    fn roomy() -> CacheLimits {
        CacheLimits {
            max_bytes: u64::MAX,
            max_age: Duration::from_secs(3600),
        }
    }

    fn cache_with(synth: Arc<FakeSynth>, limits: CacheLimits) -> (tempfile::TempDir, SpeechCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = SpeechCache::new(dir.path().join("tts_cache"), synth, limits);
        (dir, cache)
    }

    #[tokio::test]
    async fn miss_then_hit_synthesizes_once() {
        let synth = Arc::new(FakeSynth::default());
        let (_dir, cache) = cache_with(synth.clone(), roomy());

        let first = cache.resolve("Please remain seated", VOICE, AudioFormat::Mp3).await.unwrap();
        let second = cache.resolve("Please remain seated", VOICE, AudioFormat::Mp3).await.unwrap();

        assert_eq!(synth.calls(), 1);
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.path, second.path);
        assert!(first.path.exists());
    }

    #[tokio::test]
    async fn whitespace_variants_hit_the_same_entry() {
        let synth = Arc::new(FakeSynth::default());
        let (_dir, cache) = cache_with(synth.clone(), roomy());

        cache.resolve("Final  lap", VOICE, AudioFormat::Mp3).await.unwrap();
        cache.resolve(" Final lap\n", VOICE, AudioFormat::Mp3).await.unwrap();
        assert_eq!(synth.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_synthesis() {
        let synth = Arc::new(FakeSynth::slow(Duration::from_millis(100)));
        let (_dir, cache) = cache_with(synth.clone(), roomy());

        let (a, b) = tokio::join!(
            cache.resolve("Please remain seated", "voiceA", AudioFormat::Mp3),
            cache.resolve("Please remain seated", "voiceA", AudioFormat::Mp3),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(synth.calls(), 1);
        assert_eq!(a.path, b.path);
        assert_eq!(a.bytes, b.bytes);
    }

    #[tokio::test]
    async fn concurrent_failure_is_shared_and_not_cached() {
        let synth = Arc::new(FakeSynth {
            delay: Duration::from_millis(50),
            ..FakeSynth::failing(1)
        });
        let (_dir, cache) = cache_with(synth.clone(), roomy());

        let (a, b) = tokio::join!(
            cache.resolve("hello", VOICE, AudioFormat::Mp3),
            cache.resolve("hello", VOICE, AudioFormat::Mp3),
        );
        assert!(matches!(a, Err(CacheError::SynthesisFailed(_))));
        assert!(matches!(b, Err(CacheError::SynthesisFailed(_))));
        assert_eq!(synth.calls(), 1);
        assert_eq!(cache.stats().await.unwrap().cache_count, 0);

        let retry = cache.resolve("hello", VOICE, AudioFormat::Mp3).await.unwrap();
        assert_eq!(&*retry.bytes, b"audio:hello:2");
        assert_eq!(synth.calls(), 2);
    }

    #[tokio::test]
    async fn configuration_errors_propagate() {
        let synth = Arc::new(FakeSynth {
            reject_voice: Some("bogus".into()),
            ..Default::default()
        });
        let (_dir, cache) = cache_with(synth.clone(), roomy());

        let err = cache.resolve("hello", "bogus", AudioFormat::Mp3).await.unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));

        let err = cache.resolve("hello", "  ", AudioFormat::Mp3).await.unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
        assert_eq!(synth.calls(), 1);
    }

    #[tokio::test]
    async fn clear_forces_resynthesis_without_touching_resolved_audio() {
        let synth = Arc::new(FakeSynth::default());
        let (_dir, cache) = cache_with(synth.clone(), roomy());

        let old = cache.resolve("hello", VOICE, AudioFormat::Mp3).await.unwrap();
        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(!old.path.exists());

        let new = cache.resolve("hello", VOICE, AudioFormat::Mp3).await.unwrap();
        assert_eq!(synth.calls(), 2);
        assert_eq!(&*old.bytes, b"audio:hello:1");
        assert_eq!(&*new.bytes, b"audio:hello:2");
        assert_eq!(new.path, old.path);
        assert_eq!(std::fs::read(&new.path).unwrap(), b"audio:hello:2");
    }

    #[tokio::test]
    async fn empty_file_counts_as_miss() {
        let synth = Arc::new(FakeSynth::default());
        let (_dir, cache) = cache_with(synth.clone(), roomy());
        let key = CacheKey::new("hello", VOICE, AudioFormat::Mp3);
        std::fs::create_dir_all(cache.dir()).unwrap();
        std::fs::write(cache.dir().join(key.file_name()), b"").unwrap();

        let audio = cache.resolve("hello", VOICE, AudioFormat::Mp3).await.unwrap();
        assert_eq!(synth.calls(), 1);
        assert!(!audio.bytes.is_empty());
    }

    #[tokio::test]
    async fn size_bound_evicts_least_recently_used() {
        let synth = Arc::new(FakeSynth::default());
        let limits = CacheLimits {
            max_bytes: 25,
            max_age: Duration::from_secs(3600),
        };
        let (_dir, cache) = cache_with(synth.clone(), limits);

        // 11 + 11 + 13 bytes
        let one = cache.resolve("one", VOICE, AudioFormat::Mp3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let two = cache.resolve("two", VOICE, AudioFormat::Mp3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let three = cache.resolve("three", VOICE, AudioFormat::Mp3).await.unwrap();

        assert!(!one.path.exists());
        assert!(two.path.exists());
        assert!(three.path.exists());
        assert_eq!(cache.stats().await.unwrap().cache_size_bytes, 24);
    }

    #[tokio::test]
    async fn age_bound_evicts_stale_entries() {
        let synth = Arc::new(FakeSynth::default());
        let (_dir, cache) = cache_with(synth.clone(), roomy());
        let audio = cache.resolve("hello", VOICE, AudioFormat::Mp3).await.unwrap();

        let old = SystemTime::now() - Duration::from_secs(2 * 3600);
        std::fs::File::options()
            .write(true)
            .open(&audio.path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        assert_eq!(cache.prune().await.unwrap(), 1);
        assert!(!audio.path.exists());
    }

    #[tokio::test]
    async fn stats_and_warm() {
        let synth = Arc::new(FakeSynth::default());
        let (_dir, cache) = cache_with(synth.clone(), roomy());
        let texts = vec![
            ("button1".to_string(), "Please remain seated".to_string()),
            ("button2".to_string(), "Final lap".to_string()),
        ];

        assert_eq!(cache.warm(&texts, VOICE, AudioFormat::Mp3).await, 2);
        assert_eq!(cache.warm(&texts, VOICE, AudioFormat::Mp3).await, 2);
        assert_eq!(synth.calls(), 2);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.cache_count, 2);
        assert!(stats.cache_size_bytes > 0);
        assert_eq!(stats.cache_location, cache.dir());
    }

    #[tokio::test]
    async fn stats_on_missing_dir_is_empty() {
        let synth = Arc::new(FakeSynth::default());
        let (_dir, cache) = cache_with(synth, roomy());
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.cache_count, 0);
        assert_eq!(cache.clear().await.unwrap(), 0);
    }
}
