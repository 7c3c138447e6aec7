//! File-backed playback claim, shared by every process on the host.
//!
//! Three files live side by side:
//!
//! ```text
//! <claim_path>           JSON ClaimRecord while an announcement is live
//! <claim_path>.released  Unix ms of the last release (cooldown marker)
//! <claim_path>.guard     empty; exclusively locked around read-check-write
//! ```
//!
//! Admission, extension and release run under an OS file lock on the guard.
//! The kernel drops that lock when its holder exits, so the guard can never
//! wedge; the claim record carries the timestamps used for stale recovery.
//! Records are written to a temp file and renamed into place, so readers
//! that skip the guard (status polling) see either no record or a whole one.
//!
//! Everything here blocks briefly on the filesystem; async callers go
//! through `spawn_blocking`.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use kart_core::claim::{ClaimPolicy, ClaimRecord, Occupancy};

use crate::error::ClaimError;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Acquired {
        claim: ClaimRecord,
        /// A stale claim that was cleared to make room.
        recovered: Option<ClaimRecord>,
    },
    Busy {
        occupancy: Occupancy,
        holder: Option<ClaimRecord>,
    },
}

#[derive(Debug, Clone)]
pub struct ClaimStore {
    path: PathBuf,
    released_path: PathBuf,
    guard_path: PathBuf,
}

impl ClaimStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            released_path: sibling(&path, "released"),
            guard_path: sibling(&path, "guard"),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current record, without taking the guard.
    pub fn read(&self) -> Result<Option<ClaimRecord>, ClaimError> {
        let Some(raw) = self.read_file(&self.path)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // Not one of ours; report it as an unreadable record that is
                // already past any estimate.
                warn!("claim: unreadable record at {}: {e}", self.path.display());
                Ok(Some(ClaimRecord {
                    token: String::new(),
                    holder: "unknown".into(),
                    started_at_ms: 0,
                    estimated_ms: 0,
                }))
            }
        }
    }

    /// Unix ms of the last release, without taking the guard.
    pub fn released_at(&self) -> Result<Option<u64>, ClaimError> {
        Ok(self
            .read_file(&self.released_path)?
            .and_then(|raw| raw.trim().parse().ok()))
    }

    /// Admit a new claim for `holder` unless a live one exists or the
    /// cooldown is running. Stale claims are cleared and reported.
    pub fn try_acquire(
        &self,
        holder: &str,
        estimated: Duration,
        policy: &ClaimPolicy,
        now_ms: u64,
    ) -> Result<Acquire, ClaimError> {
        let _guard = self.lock_guard()?;

        let existing = self.read()?;
        let released = self.released_at()?;
        let occupancy = Occupancy::evaluate(existing.as_ref(), released, policy, now_ms);
        if occupancy != Occupancy::Free {
            return Ok(Acquire::Busy {
                occupancy,
                holder: existing,
            });
        }

        let recovered = existing.filter(|c| c.is_stale(now_ms, policy.stale_grace));
        let claim = ClaimRecord {
            token: uuid::Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            started_at_ms: now_ms,
            estimated_ms: millis(estimated),
        };
        self.write_record(&claim)?;
        debug!("claim: {} acquired by {}", claim.token, claim.holder);
        Ok(Acquire::Acquired { claim, recovered })
    }

    /// Replace the estimate of the claim holding `token`, measured from its
    /// start. Returns `false` if the claim was released or superseded.
    pub fn extend(&self, token: &str, estimated: Duration) -> Result<bool, ClaimError> {
        let _guard = self.lock_guard()?;
        match self.read()? {
            Some(mut claim) if claim.token == token => {
                claim.estimated_ms = millis(estimated);
                self.write_record(&claim)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove the claim holding `token` and start the cooldown. Releasing a
    /// claim that is already gone or was superseded does nothing.
    pub fn release(&self, token: &str, now_ms: u64) -> Result<bool, ClaimError> {
        let _guard = self.lock_guard()?;
        match self.read()? {
            Some(claim) if claim.token == token => {
                write_atomic(&self.released_path, now_ms.to_string().as_bytes())?;
                remove_if_present(&self.path)?;
                debug!("claim: {token} released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove the claim holding `token` without starting the cooldown; used
    /// when an admitted announcement never reached the speaker.
    pub fn withdraw(&self, token: &str) -> Result<bool, ClaimError> {
        let _guard = self.lock_guard()?;
        match self.read()? {
            Some(claim) if claim.token == token => {
                remove_if_present(&self.path)?;
                debug!("claim: {token} withdrawn");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Drop any claim and cooldown marker, whoever holds them.
    pub fn reset(&self) -> Result<Option<ClaimRecord>, ClaimError> {
        let _guard = self.lock_guard()?;
        let existing = self.read()?;
        remove_if_present(&self.path)?;
        remove_if_present(&self.released_path)?;
        Ok(existing)
    }

    fn lock_guard(&self) -> Result<File, ClaimError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(io_err(dir))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.guard_path)
            .map_err(io_err(&self.guard_path))?;
        file.lock().map_err(io_err(&self.guard_path))?;
        Ok(file)
    }

    fn write_record(&self, claim: &ClaimRecord) -> Result<(), ClaimError> {
        let body = serde_json::to_vec(claim).map_err(|e| ClaimError::Io {
            path: self.path.clone(),
            source: std::io::Error::new(ErrorKind::InvalidData, e),
        })?;
        write_atomic(&self.path, &body)
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>, ClaimError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ClaimError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

/// Wall clock as Unix milliseconds, the time base shared across processes.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(millis)
        .unwrap_or(0)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<(), ClaimError> {
    let tmp = sibling(path, &format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    let result = std::fs::write(&tmp, body).and_then(|()| std::fs::rename(&tmp, path));
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(ClaimError::Io {
            path: path.to_path_buf(),
            source: e,
        });
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), ClaimError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ClaimError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ClaimError + '_ {
    move |source| ClaimError::Io {
        path: path.to_path_buf(),
        source,
    }
}
