//! Read-only view of the playback claim for pollers.
//!
//! Never takes the guard lock and never writes, so any number of status
//! requests can run while an admission is in progress.

use std::sync::Arc;

use kart_core::claim::{ClaimPolicy, project_status};
use kart_core::types::PlaybackStatus;

use crate::claim_store::{ClaimStore, unix_now_ms};
use crate::error::ClaimError;

#[derive(Debug, Clone)]
pub struct StatusPublisher {
    store: Arc<ClaimStore>,
    policy: ClaimPolicy,
}

impl StatusPublisher {
    pub fn new(store: Arc<ClaimStore>, policy: ClaimPolicy) -> Self {
        Self { store, policy }
    }

    /// Snapshot at `now_ms`. Blocking; see [`StatusPublisher::current_status`].
    pub fn status_at(&self, now_ms: u64) -> Result<PlaybackStatus, ClaimError> {
        let claim = self.store.read()?;
        let released = self.store.released_at()?;
        Ok(project_status(claim.as_ref(), released, &self.policy, now_ms))
    }

    pub async fn current_status(&self) -> Result<PlaybackStatus, ClaimError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.status_at(unix_now_ms()))
            .await
            .map_err(|e| ClaimError::Task(e.to_string()))?
    }
}
