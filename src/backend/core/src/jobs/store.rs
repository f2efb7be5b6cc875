//! Storage abstraction for jobs, runs, events and dead letters.
//!
//! Every status mutation goes through one of three atomic operations:
//! [`JobStore::claim`], [`JobStore::transition`] and [`JobStore::cancel_job`].
//! Stores never expose a read-then-write path for `status`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::job::{
    ClaimedJob, DeadLetterEntry, EventLevel, Job, JobEvent, JobFilter, JobId, JobRun, JobStatus,
    RunId, RunStatus, StatsSnapshot,
};
use crate::error::{BusError, Result};

/// Result of inserting a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was stored.
    Inserted(JobId),
    /// The idempotency key already existed; nothing was mutated.
    Existing(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Inserted(id) | Self::Existing(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Existing(_))
    }
}

/// Outcome-driven transition of a claimed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// `processing → completed`
    Complete { result: Value },
    /// `processing → queued`, consuming one retry
    Retry { error: String, retry_at: DateTime<Utc> },
    /// `processing → failed` plus a dead letter entry
    DeadLetter { error: String },
}

impl Transition {
    pub fn target_status(&self) -> JobStatus {
        match self {
            Self::Complete { .. } => JobStatus::Completed,
            Self::Retry { .. } => JobStatus::Queued,
            Self::DeadLetter { .. } => JobStatus::Failed,
        }
    }
}

/// What a successful transition wrote.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub job: Job,
    pub run: JobRun,
    pub dead_letter: Option<DeadLetterEntry>,
}

/// Durable store behind the bus.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued job, or return the existing id on idempotency key conflict.
    async fn insert_job(&self, job: Job) -> Result<EnqueueOutcome>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Jobs matching `filter`, newest first.
    async fn list_jobs(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>>;

    /// `queued → cancelled`. Any other status is rejected without mutation.
    async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job>;

    /// Atomically claim up to `batch_size` eligible jobs and open a run for each.
    ///
    /// Eligible means `queued` with `scheduled_at <= now`; results are ordered
    /// by priority descending then creation time ascending. Concurrent callers
    /// never receive the same job, and a failure leaves nothing claimed.
    async fn claim(&self, worker_id: &str, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>>;

    /// Compare-and-set transition of a claimed job.
    ///
    /// Applies only while the job is `processing` and `run_id` is its open run.
    async fn transition(
        &self,
        job_id: JobId,
        run_id: RunId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord>;

    async fn append_event(
        &self,
        job_id: JobId,
        level: EventLevel,
        message: &str,
        payload: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<JobEvent>;

    /// Runs of a job by run number.
    async fn runs_for(&self, job_id: JobId) -> Result<Vec<JobRun>>;

    /// Events of a job in append order.
    async fn events_for(&self, job_id: JobId) -> Result<Vec<JobEvent>>;

    /// Processing jobs whose open run started before `started_before`.
    async fn expired_claims(&self, started_before: DateTime<Utc>) -> Result<Vec<ClaimedJob>>;

    /// Dead letters, newest first.
    async fn dead_letters(&self, include_resolved: bool, limit: usize) -> Result<Vec<DeadLetterEntry>>;

    async fn resolve_dead_letter(&self, entry_id: Uuid, now: DateTime<Utc>) -> Result<DeadLetterEntry>;

    /// Aggregates over jobs created, runs closed and dead letters written since `since`.
    async fn stats(&self, since: DateTime<Utc>) -> Result<StatsSnapshot>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shared transition rules
// ═══════════════════════════════════════════════════════════════════════════════

/// Check that `run` is the open attempt of a processing `job`.
pub(crate) fn guard_open_claim(job: &Job, run: Option<&JobRun>, run_id: RunId) -> Result<()> {
    if job.status != JobStatus::Processing {
        return Err(BusError::stale_claim(job.id, run_id));
    }
    match run {
        Some(run)
            if run.job_id == job.id
                && run.status == RunStatus::Started
                && run.run_number == job.current_run_number() =>
        {
            Ok(())
        }
        _ => Err(BusError::stale_claim(job.id, run_id)),
    }
}

/// Apply `transition` to a guarded job and its open run in place.
pub(crate) fn apply_transition(
    job: &mut Job,
    run: &mut JobRun,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<Option<DeadLetterEntry>> {
    job.updated_at = now;
    match transition {
        Transition::Complete { result } => {
            run.close(RunStatus::Completed, Some(result.clone()), None, now);
            job.status = JobStatus::Completed;
            job.completed_at = Some(now);
            job.result = Some(result);
            job.error = None;
            Ok(None)
        }
        Transition::Retry { error, retry_at } => {
            if job.retries_remaining() == 0 {
                return Err(BusError::invalid_state_transition(
                    job.id,
                    job.status,
                    JobStatus::Queued,
                ));
            }
            run.close(RunStatus::Failed, None, Some(error.clone()), now);
            job.status = JobStatus::Queued;
            job.retry_count += 1;
            job.scheduled_at = retry_at;
            job.worker_id = None;
            job.error = Some(error);
            Ok(None)
        }
        Transition::DeadLetter { error } => {
            run.close(RunStatus::Failed, None, Some(error.clone()), now);
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
            job.error = Some(error.clone());
            Ok(Some(DeadLetterEntry {
                id: Uuid::new_v4(),
                job_id: job.id,
                job_type: job.job_type.clone(),
                error,
                attempts: run.run_number,
                resolved: false,
                created_at: now,
                resolved_at: None,
            }))
        }
    }
}
