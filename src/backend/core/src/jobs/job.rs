//! Job data model.
//!
//! This module provides the records the bus persists and hands out:
//!
//! - **Job**: a unit of work with its status and retry state
//! - **JobRun**: one execution attempt of a job
//! - **JobEvent**: an append-only audit entry
//! - **DeadLetterEntry**: a job that exhausted its retry budget
//! - **JobError**: the failure a handler reports back to the bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{BusError, ErrorCode};

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| BusError::new(ErrorCode::InvalidInput, format!("Invalid job id: {}", s)))
    }
}

/// Unique identifier for a job run (one attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for RunId {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| BusError::new(ErrorCode::InvalidInput, format!("Invalid run id: {}", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status Enums
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
///
/// Advances `queued → processing → {completed | failed}`; a failed attempt with
/// retry budget left goes `processing → queued`. Only queued jobs can be
/// cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by a worker
    Processing,
    /// Finished successfully
    Completed,
    /// Failed after exhausting retries, or failed fatally
    Failed,
    /// Cancelled before any worker claimed it
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Queued,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(BusError::new(
                ErrorCode::InvalidInput,
                format!("Unknown job status: {}", other),
            )),
        }
    }
}

/// Status of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// A run is closed once its outcome has been reported.
    pub fn is_closed(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(BusError::new(
                ErrorCode::InvalidInput,
                format!("Unknown run status: {}", other),
            )),
        }
    }
}

/// Severity of a run event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventLevel {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(BusError::new(
                ErrorCode::InvalidInput,
                format!("Unknown event level: {}", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Issuing system
    pub source: String,
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,
    /// Higher is claimed sooner
    pub priority: i32,
    pub idempotency_key: Option<String>,
    pub max_retries: u32,
    pub retry_count: u32,
    /// Earliest time a worker may claim the job
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker holding (or last holding) the claim
    pub worker_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Job {
    /// Build a freshly queued job from an enqueue request.
    pub fn from_request(request: EnqueueRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            source: request.source,
            job_type: request.job_type,
            payload: request.payload,
            status: JobStatus::Queued,
            priority: request.priority,
            idempotency_key: request.idempotency_key,
            max_retries: request.max_retries,
            retry_count: 0,
            scheduled_at: request.scheduled_at.unwrap_or(now),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            worker_id: None,
            result: None,
            error: None,
        }
    }

    /// Run number the next (or current) attempt carries.
    pub fn current_run_number(&self) -> u32 {
        self.retry_count + 1
    }

    /// Retry budget left before the job is dead-lettered.
    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: RunId,
    pub job_id: JobId,
    /// 1-based attempt counter
    pub run_number: u32,
    pub status: RunStatus,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl JobRun {
    /// Open a `started` run for a job that was just claimed.
    pub fn open(job: &Job, worker_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: RunId::new(),
            job_id: job.id,
            run_number: job.current_run_number(),
            status: RunStatus::Started,
            worker_id: worker_id.to_string(),
            started_at: now,
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
        }
    }

    /// Close the run. Duration never goes negative on clock skew.
    pub fn close(&mut self, status: RunStatus, result: Option<Value>, error: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0));
        self.result = result;
        self.error = error;
    }
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: Uuid,
    pub job_id: JobId,
    /// Monotonic position in the log; orders events within a job
    pub seq: i64,
    pub level: EventLevel,
    pub message: String,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// A job that exhausted its retries or failed fatally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub job_id: JobId,
    pub job_type: String,
    /// Terminal error
    pub error: String,
    /// Number of attempts made
    pub attempts: u32,
    /// Operator flag
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Requests and Views
// ═══════════════════════════════════════════════════════════════════════════════

/// Producer request to enqueue a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub source: String,
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

impl EnqueueRequest {
    pub fn new(source: impl Into<String>, job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            source: source.into(),
            job_type: job_type.into(),
            payload,
            priority: 0,
            scheduled_at: None,
            max_retries: default_max_retries(),
            idempotency_key: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Reject requests a store should never see.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.source.trim().is_empty() {
            return Err(BusError::new(ErrorCode::MissingRequiredField, "source is required"));
        }
        if self.job_type.trim().is_empty() {
            return Err(BusError::new(ErrorCode::MissingRequiredField, "job_type is required"));
        }
        if matches!(&self.idempotency_key, Some(key) if key.trim().is_empty()) {
            return Err(BusError::new(
                ErrorCode::InvalidInput,
                "idempotency_key must not be blank",
            ));
        }
        Ok(())
    }
}

/// Filters accepted by `list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub source: Option<String>,
    pub job_type: Option<String>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.source.as_deref().map_or(true, |s| job.source == s)
            && self.job_type.as_deref().map_or(true, |t| job.job_type == t)
            && self.status.map_or(true, |s| job.status == s)
    }
}

/// A job with its attempts and audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    pub job: Job,
    pub runs: Vec<JobRun>,
    pub events: Vec<JobEvent>,
}

/// A job handed to a worker together with the run opened for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub job: Job,
    pub run: JobRun,
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// Raw aggregates a store computes over a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub counts: StatusCounts,
    pub dead_letter_count: u64,
    /// Mean duration of runs closed in the window, 0 when there are none
    pub avg_duration_ms: f64,
}

/// Bus statistics over a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub window_hours: u32,
    pub counts: StatusCounts,
    pub dead_letter_count: u64,
    pub avg_duration_ms: f64,
    /// Percentage of finished jobs that completed
    pub success_rate: f64,
}

impl JobStats {
    pub fn from_snapshot(window_hours: u32, snapshot: StatsSnapshot) -> Self {
        Self {
            window_hours,
            success_rate: success_rate(snapshot.counts.completed, snapshot.counts.failed),
            counts: snapshot.counts,
            dead_letter_count: snapshot.dead_letter_count,
            avg_duration_ms: snapshot.avg_duration_ms,
        }
    }
}

/// `completed * 100 / (completed + failed)`, or 100 when nothing finished.
pub fn success_rate(completed: u64, failed: u64) -> f64 {
    let finished = completed + failed;
    if finished == 0 {
        return 100.0;
    }
    completed as f64 * 100.0 / finished as f64
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether this error is retryable
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "[{}] ", code)?;
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for JobError {}

impl From<BusError> for JobError {
    fn from(error: BusError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_id_parse() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_status() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());

        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_job_status_serializes_lowercase() {
        let value = serde_json::to_value(JobStatus::Processing).unwrap();
        assert_eq!(value, json!("processing"));
    }

    #[test]
    fn test_from_request_defaults() {
        let now = Utc::now();
        let job = Job::from_request(EnqueueRequest::new("api", "ping", json!({})), now);

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.scheduled_at, now);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.current_run_number(), 1);
        assert_eq!(job.retries_remaining(), 3);
    }

    #[test]
    fn test_run_close_duration() {
        let now = Utc::now();
        let job = Job::from_request(EnqueueRequest::new("api", "ping", json!({})), now);
        let mut run = JobRun::open(&job, "worker-1", now);
        assert_eq!(run.run_number, 1);
        assert!(!run.status.is_closed());

        run.close(RunStatus::Completed, Some(json!("ok")), None, now + chrono::Duration::milliseconds(250));
        assert!(run.status.is_closed());
        assert_eq!(run.duration_ms, Some(250));

        let mut skewed = JobRun::open(&job, "worker-1", now);
        skewed.close(RunStatus::Failed, None, Some("boom".into()), now - chrono::Duration::seconds(1));
        assert_eq!(skewed.duration_ms, Some(0));
    }

    #[test]
    fn test_enqueue_validation() {
        assert!(EnqueueRequest::new("api", "ping", json!({})).validate().is_ok());

        let error = EnqueueRequest::new("", "ping", json!({})).validate().unwrap_err();
        assert_eq!(error.kind(), crate::error::ErrorKind::BadInput);

        assert!(EnqueueRequest::new("api", " ", json!({})).validate().is_err());
        assert!(EnqueueRequest::new("api", "ping", json!({}))
            .with_idempotency_key("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_filter_matches() {
        let job = Job::from_request(EnqueueRequest::new("cron", "ping", json!({})), Utc::now());

        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter {
            source: Some("cron".into()),
            status: Some(JobStatus::Queued),
            ..Default::default()
        }
        .matches(&job));
        assert!(!JobFilter {
            job_type: Some("echo".into()),
            ..Default::default()
        }
        .matches(&job));
    }

    #[test]
    fn test_success_rate() {
        assert_eq!(success_rate(7, 3), 70.0);
        assert_eq!(success_rate(0, 0), 100.0);
        assert_eq!(success_rate(0, 4), 0.0);
    }

    #[test]
    fn test_status_counts() {
        let mut counts = StatusCounts::default();
        counts.add(JobStatus::Completed, 7);
        counts.add(JobStatus::Failed, 3);
        assert_eq!(counts.get(JobStatus::Completed), 7);
        assert_eq!(counts.total(), 10);
    }

    #[test]
    fn test_job_error() {
        let error = JobError::retryable("network timeout").with_code("TIMEOUT");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "[TIMEOUT] network timeout");

        let from_bus: JobError = BusError::policy_violation("a", "ping").into();
        assert!(!from_bus.retryable);
        assert_eq!(from_bus.code.as_deref(), Some("PolicyViolation"));
    }
}
