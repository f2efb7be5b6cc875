//! Worker pool for concurrent job execution.
//!
//! `concurrency` independent slots each loop: claim, execute, report, and
//! sleep when there is nothing to do. A failed iteration is logged and backed
//! off; it never ends the slot. Slots stop when their cancellation token fires.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::claim::ClaimCoordinator;
use super::events::EventLog;
use super::handler::{HandlerLookup, HandlerRegistry, JobContext};
use super::job::{ClaimedJob, JobError};
use super::retry::{Outcome, RetryManager};
use crate::config::WorkerSettings;
use crate::error::{BusError, ErrorCode, ErrorKind, Result};
use crate::policy::{PolicyEnforcer, DEFAULT_MAX_DURATION_MS};
use crate::telemetry::metrics;

// Handler panics are caught per attempt, which needs unwinding.
#[cfg(panic = "abort")]
compile_error!("the worker pool requires panic = \"unwind\"");

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Claimant identifier recorded on jobs and runs
    pub worker_id: String,
    /// Agent identity used for policy checks
    pub agent_id: String,
    /// Number of independent slots
    pub concurrency: usize,
    /// Jobs claimed per iteration
    pub batch_size: usize,
    /// Sleep after an empty claim (milliseconds)
    pub poll_interval_ms: u64,
    /// Sleep after a failed iteration (milliseconds)
    pub error_backoff_ms: u64,
    /// Shutdown timeout (seconds)
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "jobbus-worker".to_string(),
            agent_id: "worker".to_string(),
            concurrency: 4,
            batch_size: 5,
            poll_interval_ms: 800,
            error_backoff_ms: 1500,
            shutdown_timeout_secs: 30,
        }
    }
}

impl From<&WorkerSettings> for WorkerConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            worker_id: settings.worker_id.clone(),
            agent_id: settings.agent_id.clone(),
            concurrency: settings.concurrency,
            batch_size: settings.batch_size,
            poll_interval_ms: settings.poll_interval_ms,
            error_backoff_ms: settings.error_backoff_ms,
            shutdown_timeout_secs: settings.shutdown_timeout_secs,
        }
    }
}

/// Statistics for the worker pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total jobs processed
    pub processed: Arc<AtomicU64>,
    /// Total jobs succeeded
    pub succeeded: Arc<AtomicU64>,
    /// Total jobs failed
    pub failed: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
    /// Iterations that ended in an error
    pub errors: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Result of one slot iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// Nothing was due
    Idle,
    /// This many jobs were claimed and executed
    Processed(usize),
}

/// Handle for controlling a running pool.
pub struct WorkerHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    stats: WorkerStats,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Signal every slot to stop and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        let joined = futures::future::join_all(self.tasks);
        if tokio::time::timeout(self.shutdown_timeout, joined).await.is_err() {
            warn!(
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Worker slots did not stop in time; leases will reclaim their jobs"
            );
        }
    }
}

/// Claims and executes jobs.
pub struct WorkerPool {
    config: WorkerConfig,
    claims: ClaimCoordinator,
    retries: RetryManager,
    enforcer: PolicyEnforcer,
    handlers: Arc<HandlerRegistry>,
    events: EventLog,
    stats: WorkerStats,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        claims: ClaimCoordinator,
        retries: RetryManager,
        enforcer: PolicyEnforcer,
        handlers: Arc<HandlerRegistry>,
        events: EventLog,
    ) -> Self {
        Self {
            config,
            claims,
            retries,
            enforcer,
            handlers,
            events,
            stats: WorkerStats::new(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Run a single iteration of `slot`: claim a batch and execute it.
    ///
    /// Every claimed job is executed and reported even if an earlier one in
    /// the batch hit an error; the last such error is returned.
    pub async fn run_once(&self, slot: usize, token: &CancellationToken) -> Result<Iteration> {
        let claimed = self
            .claims
            .claim(&self.config.worker_id, self.config.batch_size)
            .await?;
        if claimed.is_empty() {
            return Ok(Iteration::Idle);
        }

        let count = claimed.len();
        let mut last_error = None;
        for job in claimed {
            if let Err(error) = self.process(slot, job, token).await {
                last_error = Some(error);
            }
        }

        match last_error {
            Some(error) => Err(error),
            None => Ok(Iteration::Processed(count)),
        }
    }

    async fn process(&self, slot: usize, claimed: ClaimedJob, token: &CancellationToken) -> Result<()> {
        let job_id = claimed.job.id;
        let run_id = claimed.run.id;
        let job_type = claimed.job.job_type.clone();
        let run_number = claimed.run.run_number;

        self.stats.active.fetch_add(1, Ordering::Relaxed);
        metrics::set_active_jobs(self.stats.active());
        debug!(slot, job_id = %job_id, job_type = %job_type, run_number, "Executing job");

        let message = format!("run {} started", run_number);
        let details = json!({
            "run_id": run_id,
            "worker_id": self.config.worker_id,
            "agent_id": self.config.agent_id,
        });
        if let Err(error) = self.events.info(job_id, &message, Some(details)).await {
            error.log();
        }

        let clock = Instant::now();
        let outcome = match self.attempt(claimed, token).await {
            Ok(result) => Outcome::success(result),
            Err(error) => Outcome::failure(error),
        };
        let succeeded = matches!(outcome, Outcome::Succeeded { .. });

        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        metrics::set_active_jobs(self.stats.active());
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }

        let elapsed_ms = clock.elapsed().as_millis();
        match self.retries.report_outcome(job_id, run_id, outcome).await {
            Ok(_) => {
                debug!(slot, job_id = %job_id, elapsed_ms = elapsed_ms as u64, "Outcome reported");
                Ok(())
            }
            // The claim was reclaimed while we ran; the newer attempt owns the job.
            Err(error) if error.kind() == ErrorKind::NotCancellable => {
                warn!(slot, job_id = %job_id, run_id = %run_id, "Outcome rejected, claim no longer held");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Policy check, handler lookup and bounded execution of one attempt.
    async fn attempt(&self, claimed: ClaimedJob, token: &CancellationToken) -> std::result::Result<Value, JobError> {
        let agent_id = self.config.agent_id.as_str();
        self.enforcer.assert_job_allowed(agent_id, &claimed.job.job_type)?;

        let handler = match self.handlers.resolve(&claimed.job.job_type) {
            HandlerLookup::Handler(handler) => handler,
            HandlerLookup::Unconfigured { job_type } => {
                return Err(JobError::from(BusError::new(
                    ErrorCode::HandlerNotConfigured,
                    format!("No handler configured for job type {}", job_type),
                )));
            }
        };

        let limit = self
            .enforcer
            .max_duration(agent_id)
            .unwrap_or(Duration::from_millis(DEFAULT_MAX_DURATION_MS));
        let job_id = claimed.job.id;
        let ctx = JobContext::new(
            claimed.job,
            claimed.run,
            agent_id,
            self.enforcer.clone(),
            self.events.clone(),
            token.child_token(),
        );

        let execution = AssertUnwindSafe(handler.execute(&ctx)).catch_unwind();
        match tokio::time::timeout(limit, execution).await {
            Ok(Ok(result)) => result.map_err(|error| match error.code {
                Some(_) => error,
                None => error.with_code(ErrorCode::ExecutionFailure.to_string()),
            }),
            Ok(Err(_panic)) => Err(JobError::retryable("handler panicked").with_code("HANDLER_PANIC")),
            Err(_) => {
                let limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                Err(JobError::from(BusError::execution_timeout(job_id, limit_ms)))
            }
        }
    }

    /// Spawn `concurrency` slot loops that run until `token` is cancelled.
    pub fn start(self: Arc<Self>, token: CancellationToken) -> WorkerHandle {
        info!(
            worker_id = %self.config.worker_id,
            agent_id = %self.config.agent_id,
            concurrency = self.config.concurrency,
            batch_size = self.config.batch_size,
            "Worker pool started"
        );

        let tasks = (0..self.config.concurrency)
            .map(|slot| {
                let pool = Arc::clone(&self);
                let token = token.clone();
                tokio::spawn(async move { pool.run_slot(slot, token).await })
            })
            .collect();

        WorkerHandle {
            token,
            tasks,
            stats: self.stats.clone(),
            shutdown_timeout: Duration::from_secs(self.config.shutdown_timeout_secs),
        }
    }

    async fn run_slot(&self, slot: usize, token: CancellationToken) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let error_backoff = Duration::from_millis(self.config.error_backoff_ms);

        while !token.is_cancelled() {
            let pause = match self.run_once(slot, &token).await {
                Ok(Iteration::Processed(_)) => continue,
                Ok(Iteration::Idle) => poll_interval,
                Err(error) => {
                    error.log();
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    error_backoff
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(worker_id = %self.config.worker_id, slot, "Worker slot stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval_ms, 800);
        assert_eq!(config.error_backoff_ms, 1500);
    }

    #[test]
    fn test_worker_config_from_settings() {
        let settings = WorkerSettings {
            worker_id: "w-7".into(),
            concurrency: 9,
            ..WorkerSettings::default()
        };
        let config = WorkerConfig::from(&settings);
        assert_eq!(config.worker_id, "w-7");
        assert_eq!(config.concurrency, 9);
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.processed(), 0);
        assert_eq!(stats.errors(), 0);

        stats.processed.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.processed(), 1);
    }
}
