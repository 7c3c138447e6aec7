//! Playback coordinator: at most one announcement at a time, host-wide.
//!
//! Wraps the blocking [`ClaimStore`] for async callers and turns a refused
//! admission into [`AnnounceError::AlreadyPlaying`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use kart_core::claim::{ClaimPolicy, ClaimRecord, Occupancy};
use kart_core::types::{PlaybackStatus, Source};

use crate::claim_store::{Acquire, ClaimStore, unix_now_ms};
use crate::error::{AnnounceError, ClaimError};
use crate::status::StatusPublisher;

/// An admitted announcement's claim. Pass it back to
/// [`Coordinator::extend`] and [`Coordinator::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackClaim {
    record: ClaimRecord,
}

impl PlaybackClaim {
    pub fn token(&self) -> &str {
        &self.record.token
    }

    pub fn holder(&self) -> &str {
        &self.record.holder
    }
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    store: Arc<ClaimStore>,
    policy: ClaimPolicy,
}

impl Coordinator {
    pub fn new(store: Arc<ClaimStore>, policy: ClaimPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> ClaimPolicy {
        self.policy
    }

    pub fn status_publisher(&self) -> StatusPublisher {
        StatusPublisher::new(self.store.clone(), self.policy)
    }

    /// Claim the system for `source`, expecting to be done within `estimated`.
    pub async fn admit(
        &self,
        source: &Source,
        estimated: Duration,
    ) -> Result<PlaybackClaim, AnnounceError> {
        let store = self.store.clone();
        let policy = self.policy;
        let holder = source.to_string();
        let now_ms = unix_now_ms();

        let outcome = blocking(move || store.try_acquire(&holder, estimated, &policy, now_ms)).await?;
        match outcome {
            Acquire::Acquired { claim, recovered } => {
                if let Some(stale) = recovered {
                    warn!(
                        "claim: recovered stale claim from {} ({:.1}s old, estimated {:.1}s)",
                        stale.holder,
                        stale.elapsed_ms(now_ms) as f64 / 1000.0,
                        stale.estimated_ms as f64 / 1000.0,
                    );
                }
                info!("claim: admitted {} for ~{:.1}s", claim.holder, estimated.as_secs_f64());
                Ok(PlaybackClaim { record: claim })
            }
            Acquire::Busy { occupancy, holder } => {
                let elapsed_secs = holder
                    .as_ref()
                    .map(|c| c.elapsed_ms(now_ms) as f64 / 1000.0)
                    .unwrap_or(0.0);
                let seconds_remaining = occupancy.remaining_ms() as f64 / 1000.0;
                match occupancy {
                    Occupancy::CoolingDown { .. } => {
                        info!("claim: {source} refused, cooling down {seconds_remaining:.1}s")
                    }
                    _ => info!("claim: {source} refused, already playing"),
                }
                Err(AnnounceError::AlreadyPlaying {
                    holder: holder.map(|c| c.holder),
                    elapsed_secs,
                    seconds_remaining,
                })
            }
        }
    }

    /// Re-estimate an admitted claim as `from_now` beyond the current time.
    pub async fn extend(&self, claim: &PlaybackClaim, from_now: Duration) -> Result<bool, ClaimError> {
        let store = self.store.clone();
        let token = claim.record.token.clone();
        let elapsed = Duration::from_millis(claim.record.elapsed_ms(unix_now_ms()));
        blocking(move || store.extend(&token, elapsed + from_now)).await
    }

    /// Release is idempotent; a claim that was already released or taken
    /// over is left alone.
    pub async fn release(&self, claim: &PlaybackClaim) -> Result<bool, ClaimError> {
        let store = self.store.clone();
        let token = claim.record.token.clone();
        let released = blocking(move || store.release(&token, unix_now_ms())).await?;
        if !released {
            warn!("claim: {} was no longer held by {}", claim.record.token, claim.record.holder);
        }
        Ok(released)
    }

    /// Give back a claim whose announcement never started playing. No
    /// cooldown follows.
    pub async fn withdraw(&self, claim: &PlaybackClaim) -> Result<bool, ClaimError> {
        let store = self.store.clone();
        let token = claim.record.token.clone();
        blocking(move || store.withdraw(&token)).await
    }

    pub async fn status(&self) -> Result<PlaybackStatus, ClaimError> {
        self.status_publisher().current_status().await
    }

    /// Operator override: forget any claim and cooldown.
    pub async fn reset(&self) -> Result<Option<ClaimRecord>, ClaimError> {
        let store = self.store.clone();
        let cleared = blocking(move || store.reset()).await?;
        match &cleared {
            Some(c) => warn!("claim: reset cleared claim held by {}", c.holder),
            None => info!("claim: reset with no active claim"),
        }
        Ok(cleared)
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ClaimError>
where
    F: FnOnce() -> Result<T, ClaimError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ClaimError::Task(e.to_string()))?
}
