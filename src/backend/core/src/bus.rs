//! The job bus facade.
//!
//! Producers enqueue, inspect and cancel jobs through [`JobBus`]; workers claim
//! and report through it. It owns no state beyond the store handle and the
//! components wired around it.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{BusError, Result};
use crate::jobs::claim::ClaimCoordinator;
use crate::jobs::events::EventLog;
use crate::jobs::idempotency::schedule_bucket_key;
use crate::jobs::job::{
    ClaimedJob, DeadLetterEntry, EnqueueRequest, Job, JobDetail, JobFilter, JobId, JobStats, RunId,
};
use crate::jobs::retry::{BackoffStrategy, Outcome, RetryManager};
use crate::jobs::scheduler::ScheduleSpec;
use crate::jobs::store::{EnqueueOutcome, JobStore, TransitionRecord};
use crate::telemetry::metrics;

/// Largest page `list` returns.
pub const MAX_LIST_LIMIT: usize = 500;
/// Page size used when a caller passes 0.
pub const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Clone)]
pub struct JobBus {
    store: Arc<dyn JobStore>,
    events: EventLog,
    claims: ClaimCoordinator,
    retries: RetryManager,
}

impl JobBus {
    /// Bus over `store` with the default backoff.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_backoff(store, BackoffStrategy::default())
    }

    pub fn with_backoff(store: Arc<dyn JobStore>, backoff: BackoffStrategy) -> Self {
        let events = EventLog::new(store.clone());
        let claims = ClaimCoordinator::new(store.clone());
        let retries = RetryManager::new(store.clone(), events.clone(), backoff);
        Self {
            store,
            events,
            claims,
            retries,
        }
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn claims(&self) -> &ClaimCoordinator {
        &self.claims
    }

    pub fn retries(&self) -> &RetryManager {
        &self.retries
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Producer surface
    // ─────────────────────────────────────────────────────────────────────────

    /// Enqueue a job. A repeated idempotency key returns the existing job
    /// untouched.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome> {
        self.enqueue_at(request, Utc::now()).await
    }

    #[instrument(skip(self, request), fields(job_type = %request.job_type, source = %request.source))]
    pub async fn enqueue_at(&self, request: EnqueueRequest, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        request.validate()?;
        let job = Job::from_request(request, now);
        let job_type = job.job_type.clone();
        let scheduled_at = job.scheduled_at;
        let priority = job.priority;

        let outcome = self.store.insert_job(job).await?;
        metrics::record_enqueued(&job_type, outcome.is_duplicate());

        match outcome {
            EnqueueOutcome::Inserted(job_id) => {
                info!(job_id = %job_id, "Job enqueued");
                // The row is committed; a lost audit event must not report the enqueue as failed.
                if let Err(error) = self
                    .events
                    .info(
                        job_id,
                        "enqueued",
                        Some(json!({ "priority": priority, "scheduled_at": scheduled_at })),
                    )
                    .await
                {
                    error.log();
                }
            }
            EnqueueOutcome::Existing(job_id) => {
                info!(job_id = %job_id, "Duplicate enqueue, returning existing job");
            }
        }
        Ok(outcome)
    }

    /// The job with its runs and events.
    pub async fn get(&self, job_id: JobId) -> Result<JobDetail> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| BusError::job_not_found(job_id))?;
        let runs = self.store.runs_for(job_id).await?;
        let events = self.store.events_for(job_id).await?;
        Ok(JobDetail { job, runs, events })
    }

    /// Newest jobs first. `limit` is clamped to `1..=MAX_LIST_LIMIT`, 0 means the default.
    pub async fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>> {
        let limit = match limit {
            0 => DEFAULT_LIST_LIMIT,
            n => n.min(MAX_LIST_LIMIT),
        };
        self.store.list_jobs(filter, limit).await
    }

    /// Cancel a queued job. Any other status fails with `InvalidStateTransition`.
    pub async fn cancel(&self, job_id: JobId) -> Result<Job> {
        let job = self.store.cancel_job(job_id, Utc::now()).await?;
        info!(job_id = %job_id, "Job cancelled");
        if let Err(error) = self.events.info(job_id, "cancelled", None).await {
            error.log();
        }
        Ok(job)
    }

    /// Aggregates over the last `window_hours` hours (at least one).
    ///
    /// A window reaching past the Unix epoch starts at the epoch.
    pub async fn stats(&self, window_hours: u32) -> Result<JobStats> {
        let window_hours = window_hours.max(1);
        let since = window_start(Utc::now(), window_hours);
        let snapshot = self.store.stats(since).await?;
        Ok(JobStats::from_snapshot(window_hours, snapshot))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Worker surface
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn claim(&self, worker_id: &str, batch_size: usize) -> Result<Vec<ClaimedJob>> {
        self.claims.claim(worker_id, batch_size).await
    }

    pub async fn report_outcome(&self, job_id: JobId, run_id: RunId, outcome: Outcome) -> Result<TransitionRecord> {
        self.retries.report_outcome(job_id, run_id, outcome).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dead letters and schedules
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn dead_letters(&self, include_resolved: bool, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let limit = match limit {
            0 => DEFAULT_LIST_LIMIT,
            n => n.min(MAX_LIST_LIMIT),
        };
        self.store.dead_letters(include_resolved, limit).await
    }

    /// Mark a dead letter as handled by an operator.
    pub async fn resolve_dead_letter(&self, entry_id: Uuid) -> Result<DeadLetterEntry> {
        let entry = self.store.resolve_dead_letter(entry_id, Utc::now()).await?;
        info!(entry_id = %entry_id, job_id = %entry.job_id, "Dead letter resolved");
        Ok(entry)
    }

    /// Enqueue one fire of a recurring schedule, deduplicated per bucket window.
    pub async fn trigger_schedule(&self, schedule: &ScheduleSpec, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        let request = EnqueueRequest::new(&schedule.source, &schedule.job_type, schedule.payload.clone())
            .with_priority(schedule.priority)
            .with_max_retries(schedule.max_retries)
            .with_idempotency_key(schedule_bucket_key(&schedule.schedule_id, now));
        self.enqueue_at(request, now).await
    }
}

fn window_start(now: DateTime<Utc>, window_hours: u32) -> DateTime<Utc> {
    chrono::Duration::try_hours(i64::from(window_hours))
        .and_then(|window| now.checked_sub_signed(window))
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |since| since.max(DateTime::<Utc>::UNIX_EPOCH))
}
