//! Retry and dead-letter decisions.
//!
//! A reported outcome turns into exactly one store transition: completion,
//! a requeue with backoff, or a terminal failure with a dead letter entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::events::EventLog;
use super::job::{Job, JobError, JobId, JobStatus, RunId};
use super::store::{JobStore, Transition, TransitionRecord};
use crate::error::{BusError, Result};
use crate::telemetry::metrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
///
/// Every variant is non-decreasing in the attempt number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// Linear increase in delay (initial + increment * attempt)
    Linear { initial_delay_ms: u64, increment_ms: u64 },
    /// Exponential increase in delay (initial * multiplier^attempt), capped
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 5_000,
            max_delay_ms: 3_600_000, // 1 hour max
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Linear {
                initial_delay_ms,
                increment_ms,
            } => initial_delay_ms.saturating_add(increment_ms.saturating_mul(u64::from(attempt))),
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let delay = (*initial_delay_ms as f64) * multiplier.max(1.0).powi(exponent);
                delay.min(*max_delay_ms as f64) as u64
            }
        };

        Duration::from_millis(ms)
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay_ms: u64) -> Self {
        Self::Fixed { delay_ms }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decision
// ═══════════════════════════════════════════════════════════════════════════════

/// What a worker reports for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { result: Value },
    Failed { error: JobError },
}

impl Outcome {
    pub fn success(result: Value) -> Self {
        Self::Succeeded { result }
    }

    pub fn failure(error: JobError) -> Self {
        Self::Failed { error }
    }
}

/// Decide the transition for `job` given the attempt outcome.
///
/// Retryable failures requeue while `retry_count < max_retries`; the delay
/// grows with the retry count. Everything else that failed is terminal.
pub fn decide(job: &Job, outcome: Outcome, now: DateTime<Utc>, backoff: &BackoffStrategy) -> Transition {
    match outcome {
        Outcome::Succeeded { result } => Transition::Complete { result },
        Outcome::Failed { error } if error.retryable && job.retry_count < job.max_retries => {
            let delay = backoff.delay_for_attempt(job.retry_count);
            let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::weeks(52));
            Transition::Retry {
                error: error.to_string(),
                retry_at: now.checked_add_signed(delay).unwrap_or(now),
            }
        }
        Outcome::Failed { error } => Transition::DeadLetter {
            error: error.to_string(),
        },
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Manager
// ═══════════════════════════════════════════════════════════════════════════════

/// Applies reported outcomes to the store.
#[derive(Clone)]
pub struct RetryManager {
    store: Arc<dyn JobStore>,
    events: EventLog,
    backoff: BackoffStrategy,
}

impl RetryManager {
    pub fn new(store: Arc<dyn JobStore>, events: EventLog, backoff: BackoffStrategy) -> Self {
        Self { store, events, backoff }
    }

    pub fn backoff(&self) -> &BackoffStrategy {
        &self.backoff
    }

    /// Record the outcome of run `run_id` of job `job_id`.
    ///
    /// Fails with `InvalidStateTransition` if the run no longer holds the claim.
    pub async fn report_outcome(&self, job_id: JobId, run_id: RunId, outcome: Outcome) -> Result<TransitionRecord> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| BusError::job_not_found(job_id))?;

        let now = Utc::now();
        let transition = decide(&job, outcome, now, &self.backoff);
        let record = self.store.transition(job_id, run_id, transition, now).await?;
        self.record(&record).await;
        Ok(record)
    }

    async fn record(&self, record: &TransitionRecord) {
        let job = &record.job;
        let run = &record.run;
        let duration_ms = run.duration_ms.unwrap_or(0);
        let details = json!({
            "run_id": run.id,
            "run_number": run.run_number,
            "duration_ms": duration_ms,
        });

        metrics::record_attempt(&job.job_type, job.status == JobStatus::Completed, duration_ms.max(0) as u64);

        let appended = match (&record.dead_letter, job.status) {
            (Some(entry), _) => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = entry.attempts,
                    error = %entry.error,
                    "Job dead-lettered"
                );
                metrics::record_dead_letter(&job.job_type);
                self.events
                    .error(job.id, &format!("run {} failed, job dead-lettered: {}", run.run_number, entry.error), Some(details))
                    .await
            }
            (None, JobStatus::Queued) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    retry_count = job.retry_count,
                    scheduled_at = %job.scheduled_at,
                    "Job requeued for retry"
                );
                metrics::record_retry(&job.job_type);
                let mut details = details;
                details["retry_count"] = json!(job.retry_count);
                details["retry_at"] = json!(job.scheduled_at);
                self.events
                    .warn(
                        job.id,
                        &format!(
                            "run {} failed, retry {}/{} scheduled",
                            run.run_number, job.retry_count, job.max_retries
                        ),
                        Some(details),
                    )
                    .await
            }
            (None, _) => {
                info!(job_id = %job.id, job_type = %job.job_type, duration_ms, "Job completed");
                self.events
                    .info(job.id, &format!("run {} completed", run.run_number), Some(details))
                    .await
            }
        };

        // The transition already committed; a lost audit row must not undo it.
        if let Err(error) = appended {
            error.log();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::EnqueueRequest;

    fn job(max_retries: u32, retry_count: u32) -> Job {
        let mut job = Job::from_request(
            EnqueueRequest::new("test", "ping", json!({})).with_max_retries(max_retries),
            Utc::now(),
        );
        job.retry_count = retry_count;
        job.status = JobStatus::Processing;
        job
    }

    #[test]
    fn test_backoff_fixed() {
        let backoff = BackoffStrategy::fixed(10);
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(10));
    }

    #[test]
    fn test_backoff_exponential() {
        let backoff = BackoffStrategy::Exponential {
            initial_delay_ms: 1_000,
            max_delay_ms: 100_000,
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(8));
        // Should cap at max
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(100));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(100));
    }

    #[test]
    fn test_backoff_linear() {
        let backoff = BackoffStrategy::Linear {
            initial_delay_ms: 5_000,
            increment_ms: 3_000,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(11));
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let strategies = [
            BackoffStrategy::default(),
            BackoffStrategy::fixed(250),
            BackoffStrategy::Linear { initial_delay_ms: 0, increment_ms: 100 },
            BackoffStrategy::Exponential { initial_delay_ms: 100, max_delay_ms: 10_000, multiplier: 0.5 },
        ];
        for strategy in &strategies {
            let delays: Vec<Duration> = (0..20).map(|a| strategy.delay_for_attempt(a)).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{:?}", strategy);
        }
    }

    #[test]
    fn test_backoff_deserializes_tagged() {
        let backoff: BackoffStrategy =
            serde_json::from_value(json!({"kind": "fixed", "delay_ms": 50})).unwrap();
        assert_eq!(backoff, BackoffStrategy::fixed(50));
    }

    #[test]
    fn test_decide_success() {
        let transition = decide(&job(3, 0), Outcome::success(json!("ok")), Utc::now(), &BackoffStrategy::default());
        assert_eq!(transition, Transition::Complete { result: json!("ok") });
    }

    #[test]
    fn test_decide_retry_until_budget_spent() {
        let now = Utc::now();
        let backoff = BackoffStrategy::fixed(1_000);
        let failure = || Outcome::failure(JobError::retryable("flaky"));

        for retry_count in 0..3 {
            match decide(&job(3, retry_count), failure(), now, &backoff) {
                Transition::Retry { retry_at, .. } => {
                    assert_eq!(retry_at, now + chrono::Duration::seconds(1))
                }
                other => panic!("expected retry, got {:?}", other),
            }
        }
        assert!(matches!(
            decide(&job(3, 3), failure(), now, &backoff),
            Transition::DeadLetter { .. }
        ));
    }

    #[test]
    fn test_decide_fatal_skips_retries() {
        let transition = decide(
            &job(3, 0),
            Outcome::failure(JobError::fatal("no handler").with_code("HANDLER_NOT_CONFIGURED")),
            Utc::now(),
            &BackoffStrategy::default(),
        );
        assert_eq!(
            transition,
            Transition::DeadLetter {
                error: "[HANDLER_NOT_CONFIGURED] no handler".into()
            }
        );
    }
}
