//! The playback claim record and the status projection derived from it.
//!
//! Timestamps are Unix milliseconds so that separate processes agree on
//! them. Every function here takes `now_ms` explicitly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::PlaybackStatus;

/// The system-wide "an announcement is playing" record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    /// Unique per admission; release and extend only act on a matching token.
    pub token: String,
    /// Which source triggered it, e.g. `button:button1`.
    pub holder: String,
    pub started_at_ms: u64,
    pub estimated_ms: u64,
}

impl ClaimRecord {
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_at_ms)
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.estimated_ms.saturating_sub(self.elapsed_ms(now_ms))
    }

    /// Abandoned: older than its estimate plus `grace` with no release.
    pub fn is_stale(&self, now_ms: u64, grace: Duration) -> bool {
        self.elapsed_ms(now_ms) > self.estimated_ms.saturating_add(duration_ms(grace))
    }
}

/// Tunables shared by admission and status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClaimPolicy {
    /// Quiet period after a release during which admission is refused.
    pub cooldown: Duration,
    /// How far past its estimate a claim may run before it is considered stale.
    pub stale_grace: Duration,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(8),
            stale_grace: Duration::from_secs(30),
        }
    }
}

/// Milliseconds of cooldown left after a release at `released_at_ms`.
pub fn cooldown_remaining_ms(released_at_ms: Option<u64>, cooldown: Duration, now_ms: u64) -> u64 {
    match released_at_ms {
        Some(at) => duration_ms(cooldown).saturating_sub(now_ms.saturating_sub(at)),
        None => 0,
    }
}

/// Why a new admission would be refused right now, if it would be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Free,
    /// A live claim exists.
    Playing { remaining_ms: u64 },
    /// No claim, but the post-release quiet period is running.
    CoolingDown { remaining_ms: u64 },
}

impl Occupancy {
    pub fn evaluate(
        claim: Option<&ClaimRecord>,
        released_at_ms: Option<u64>,
        policy: &ClaimPolicy,
        now_ms: u64,
    ) -> Self {
        if let Some(claim) = claim {
            if !claim.is_stale(now_ms, policy.stale_grace) {
                return Occupancy::Playing {
                    remaining_ms: claim.remaining_ms(now_ms),
                };
            }
        }
        match cooldown_remaining_ms(released_at_ms, policy.cooldown, now_ms) {
            0 => Occupancy::Free,
            remaining_ms => Occupancy::CoolingDown { remaining_ms },
        }
    }

    pub fn remaining_ms(&self) -> u64 {
        match *self {
            Occupancy::Free => 0,
            Occupancy::Playing { remaining_ms } | Occupancy::CoolingDown { remaining_ms } => {
                remaining_ms
            }
        }
    }
}

/// Project the on-disk state into what pollers see.
///
/// `seconds_remaining = max(0, estimated - (now - start))` while a live claim
/// exists, otherwise whatever is left of the cooldown.
pub fn project_status(
    claim: Option<&ClaimRecord>,
    released_at_ms: Option<u64>,
    policy: &ClaimPolicy,
    now_ms: u64,
) -> PlaybackStatus {
    let occupancy = Occupancy::evaluate(claim, released_at_ms, policy, now_ms);
    PlaybackStatus {
        is_playing: occupancy != Occupancy::Free,
        seconds_remaining: occupancy.remaining_ms() as f64 / 1000.0,
        lock_file_exists: claim.is_some(),
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
