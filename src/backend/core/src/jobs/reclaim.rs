//! Lease reclaimer.
//!
//! A worker that dies mid-job leaves the job `processing` forever. Claims whose
//! open run is older than the lease are failed as retryable, which requeues or
//! dead-letters them through the normal retry path.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::job::JobError;
use super::retry::{Outcome, RetryManager};
use super::store::JobStore;
use crate::error::{ErrorKind, Result};
use crate::telemetry::metrics;

pub const LEASE_EXPIRED_CODE: &str = "LEASE_EXPIRED";

pub struct LeaseReclaimer {
    store: Arc<dyn JobStore>,
    retries: RetryManager,
    lease: Duration,
}

impl LeaseReclaimer {
    pub fn new(store: Arc<dyn JobStore>, retries: RetryManager, lease: Duration) -> Self {
        Self { store, retries, lease }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Fail every claim older than the lease. Returns how many were reclaimed.
    ///
    /// A claim whose report fails is logged and left for the next scan.
    pub async fn reclaim_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let lease = chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let started_before = now.checked_sub_signed(lease).unwrap_or(now);
        let expired = self.store.expired_claims(started_before).await?;

        let mut reclaimed = 0;
        for claimed in expired {
            let error = JobError::retryable(format!(
                "lease expired after {}ms on worker {}",
                self.lease.as_millis(),
                claimed.run.worker_id
            ))
            .with_code(LEASE_EXPIRED_CODE);

            match self
                .retries
                .report_outcome(claimed.job.id, claimed.run.id, Outcome::failure(error))
                .await
            {
                Ok(_) => reclaimed += 1,
                // Finished between the scan and the report.
                Err(e) if e.kind() == ErrorKind::NotCancellable => {}
                Err(e) => {
                    warn!(job_id = %claimed.job.id, run_id = %claimed.run.id, "Failed to reclaim expired claim");
                    e.log();
                }
            }
        }

        if reclaimed > 0 {
            warn!(count = reclaimed, lease_ms = self.lease.as_millis() as u64, "Reclaimed expired claims");
            metrics::record_reclaimed(reclaimed);
        }
        Ok(reclaimed)
    }

    /// Scan every `period` until `token` is cancelled.
    pub async fn run(&self, period: Duration, token: CancellationToken) {
        info!(lease_ms = self.lease.as_millis() as u64, "Lease reclaimer started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(period) => {
                    if let Err(error) = self.reclaim_once(Utc::now()).await {
                        error.log();
                    }
                }
            }
        }
        info!("Lease reclaimer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::events::EventLog;
    use crate::jobs::job::{EnqueueRequest, Job, JobStatus};
    use crate::jobs::memory::InMemoryJobStore;
    use crate::error::BusError;
    use crate::jobs::job::{
        ClaimedJob, DeadLetterEntry, EventLevel, JobEvent, JobFilter, JobId, JobRun, RunId, StatsSnapshot,
    };
    use crate::jobs::retry::BackoffStrategy;
    use crate::jobs::store::{EnqueueOutcome, Transition, TransitionRecord};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use uuid::Uuid;

    /// In-memory store whose transitions fail for selected jobs.
    #[derive(Default)]
    struct BrokenTransitions {
        inner: InMemoryJobStore,
        broken: Mutex<HashSet<JobId>>,
    }

    #[async_trait]
    impl JobStore for BrokenTransitions {
        async fn insert_job(&self, job: Job) -> Result<EnqueueOutcome> {
            self.inner.insert_job(job).await
        }

        async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
            self.inner.get_job(job_id).await
        }

        async fn list_jobs(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>> {
            self.inner.list_jobs(filter, limit).await
        }

        async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job> {
            self.inner.cancel_job(job_id, now).await
        }

        async fn claim(&self, worker_id: &str, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>> {
            self.inner.claim(worker_id, batch_size, now).await
        }

        async fn transition(
            &self,
            job_id: JobId,
            run_id: RunId,
            transition: Transition,
            now: DateTime<Utc>,
        ) -> Result<TransitionRecord> {
            if self.broken.lock().contains(&job_id) {
                return Err(BusError::new(
                    crate::error::ErrorCode::DatabaseQueryFailed,
                    "transition failed",
                ));
            }
            self.inner.transition(job_id, run_id, transition, now).await
        }

        async fn append_event(
            &self,
            job_id: JobId,
            level: EventLevel,
            message: &str,
            payload: Option<Value>,
            now: DateTime<Utc>,
        ) -> Result<JobEvent> {
            self.inner.append_event(job_id, level, message, payload, now).await
        }

        async fn runs_for(&self, job_id: JobId) -> Result<Vec<JobRun>> {
            self.inner.runs_for(job_id).await
        }

        async fn events_for(&self, job_id: JobId) -> Result<Vec<JobEvent>> {
            self.inner.events_for(job_id).await
        }

        async fn expired_claims(&self, started_before: DateTime<Utc>) -> Result<Vec<ClaimedJob>> {
            self.inner.expired_claims(started_before).await
        }

        async fn dead_letters(&self, include_resolved: bool, limit: usize) -> Result<Vec<DeadLetterEntry>> {
            self.inner.dead_letters(include_resolved, limit).await
        }

        async fn resolve_dead_letter(&self, entry_id: Uuid, now: DateTime<Utc>) -> Result<DeadLetterEntry> {
            self.inner.resolve_dead_letter(entry_id, now).await
        }

        async fn stats(&self, since: DateTime<Utc>) -> Result<StatsSnapshot> {
            self.inner.stats(since).await
        }
    }

    async fn setup(max_retries: u32) -> (Arc<InMemoryJobStore>, LeaseReclaimer, Job) {
        let store = Arc::new(InMemoryJobStore::new());
        let job = Job::from_request(
            EnqueueRequest::new("test", "ping", json!({})).with_max_retries(max_retries),
            Utc::now() - chrono::Duration::minutes(30),
        );
        store.insert_job(job.clone()).await.unwrap();

        let events = EventLog::new(store.clone());
        let retries = RetryManager::new(store.clone(), events, BackoffStrategy::fixed(1000));
        let reclaimer = LeaseReclaimer::new(store.clone(), retries, Duration::from_secs(60));
        (store, reclaimer, job)
    }

    #[tokio::test]
    async fn test_expired_claim_is_requeued() {
        let (store, reclaimer, job) = setup(3).await;
        store.claim("dead-worker", 1, Utc::now() - chrono::Duration::minutes(10)).await.unwrap();

        assert_eq!(reclaimer.reclaim_once(Utc::now()).await.unwrap(), 1);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        let runs = store.runs_for(job.id).await.unwrap();
        assert!(runs[0].error.as_deref().unwrap().contains(LEASE_EXPIRED_CODE));
    }

    #[tokio::test]
    async fn test_fresh_claim_is_left_alone() {
        let (store, reclaimer, job) = setup(3).await;
        store.claim("live-worker", 1, Utc::now()).await.unwrap();

        assert_eq!(reclaimer.reclaim_once(Utc::now()).await.unwrap(), 0);
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_expired_claim_without_retries_is_dead_lettered() {
        let (store, reclaimer, job) = setup(0).await;
        store.claim("dead-worker", 1, Utc::now() - chrono::Duration::minutes(10)).await.unwrap();

        reclaimer.reclaim_once(Utc::now()).await.unwrap();

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(store.dead_letters(false, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_one_failed_report_does_not_stop_the_scan() {
        let store = Arc::new(BrokenTransitions::default());
        let created = Utc::now() - chrono::Duration::minutes(30);
        let stuck = Job::from_request(EnqueueRequest::new("test", "ping", json!({})), created);
        let healthy = Job::from_request(EnqueueRequest::new("test", "ping", json!({})), created);
        store.insert_job(stuck.clone()).await.unwrap();
        store.insert_job(healthy.clone()).await.unwrap();
        store.claim("dead-worker", 2, Utc::now() - chrono::Duration::minutes(10)).await.unwrap();
        store.broken.lock().insert(stuck.id);

        let events = EventLog::new(store.clone());
        let retries = RetryManager::new(store.clone(), events, BackoffStrategy::fixed(1000));
        let reclaimer = LeaseReclaimer::new(store.clone(), retries, Duration::from_secs(60));

        assert_eq!(reclaimer.reclaim_once(Utc::now()).await.unwrap(), 1);
        let healthy = store.get_job(healthy.id).await.unwrap().unwrap();
        assert_eq!(healthy.status, JobStatus::Queued);
        let stuck = store.get_job(stuck.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, JobStatus::Processing);

        store.broken.lock().clear();
        assert_eq!(reclaimer.reclaim_once(Utc::now()).await.unwrap(), 1);
    }
}
