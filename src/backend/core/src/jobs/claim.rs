//! Claim coordinator.
//!
//! Hands queued jobs to exactly one worker. The exclusivity itself lives in
//! [`JobStore::claim`]; this layer validates the request, normalizes store
//! failures into `ClaimFailure` and records claim metrics.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use super::job::ClaimedJob;
use super::store::JobStore;
use crate::error::{BusError, ErrorCode, Result};
use crate::telemetry::metrics;

/// Upper bound on jobs handed out by a single claim.
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Clone)]
pub struct ClaimCoordinator {
    store: Arc<dyn JobStore>,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Claim up to `batch_size` jobs that are due now.
    pub async fn claim(&self, worker_id: &str, batch_size: usize) -> Result<Vec<ClaimedJob>> {
        self.claim_at(worker_id, batch_size, Utc::now()).await
    }

    /// Claim against an explicit clock.
    pub async fn claim_at(&self, worker_id: &str, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>> {
        if worker_id.trim().is_empty() {
            return Err(BusError::new(ErrorCode::MissingRequiredField, "worker_id is required"));
        }
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let batch_size = batch_size.min(MAX_BATCH_SIZE);
        let claimed = self
            .store
            .claim(worker_id, batch_size, now)
            .await
            .map_err(|e| match e.code() {
                ErrorCode::ClaimFailure => e,
                _ => {
                    let reason = e.internal_message().unwrap_or(e.user_message()).to_string();
                    BusError::claim_failure(reason).with_source(e)
                }
            })?;

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "Claimed jobs");
            metrics::record_claimed(claimed.len());
        }
        Ok(claimed)
    }
}
