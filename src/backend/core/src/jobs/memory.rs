//! In-memory job store.
//!
//! Every operation runs inside one `parking_lot` critical section, which gives
//! the same atomicity the PostgreSQL store gets from row locks. Used by tests,
//! benchmarks and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::job::{
    ClaimedJob, DeadLetterEntry, EventLevel, Job, JobEvent, JobFilter, JobId, JobRun, JobStatus,
    RunId, RunStatus, StatsSnapshot,
};
use super::store::{apply_transition, guard_open_claim, EnqueueOutcome, JobStore, Transition, TransitionRecord};
use crate::error::{BusError, ErrorCode, Result};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, StoredJob>,
    keys: HashMap<String, JobId>,
    runs: HashMap<JobId, Vec<JobRun>>,
    events: Vec<JobEvent>,
    dead_letters: Vec<DeadLetterEntry>,
    next_seq: u64,
    next_event_seq: i64,
}

struct StoredJob {
    job: Job,
    /// Insertion order, breaks `created_at` ties
    seq: u64,
}

/// Job store held in process memory.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<MemoryState>>,
    unavailable: Arc<AtomicBool>,
    events_unavailable: Arc<AtomicBool>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Simulate an outage of the event log only.
    pub fn set_event_log_available(&self, available: bool) {
        self.events_unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::with_internal(
                ErrorCode::DatabaseConnectionFailed,
                "Database unavailable",
                "in-memory store disabled",
            ));
        }
        Ok(())
    }
}

fn open_run<'a>(runs: &'a mut HashMap<JobId, Vec<JobRun>>, job_id: JobId, run_id: RunId) -> Option<&'a mut JobRun> {
    runs.get_mut(&job_id)?.iter_mut().find(|r| r.id == run_id)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: Job) -> Result<EnqueueOutcome> {
        self.check_available()?;
        let mut state = self.state.lock();

        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = state.keys.get(key) {
                return Ok(EnqueueOutcome::Existing(*existing));
            }
            state.keys.insert(key.clone(), job.id);
        }

        let id = job.id;
        state.next_seq += 1;
        let seq = state.next_seq;
        state.jobs.insert(id, StoredJob { job, seq });
        Ok(EnqueueOutcome::Inserted(id))
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.check_available()?;
        Ok(self.state.lock().jobs.get(&job_id).map(|s| s.job.clone()))
    }

    async fn list_jobs(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut matching: Vec<&StoredJob> = state.jobs.values().filter(|s| filter.matches(&s.job)).collect();
        matching.sort_by(|a, b| {
            b.job
                .created_at
                .cmp(&a.job.created_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        Ok(matching.into_iter().take(limit).map(|s| s.job.clone()).collect())
    }

    async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job> {
        self.check_available()?;
        let mut state = self.state.lock();
        let stored = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| BusError::job_not_found(job_id))?;

        if stored.job.status != JobStatus::Queued {
            return Err(BusError::invalid_state_transition(
                job_id,
                stored.job.status,
                JobStatus::Cancelled,
            ));
        }

        stored.job.status = JobStatus::Cancelled;
        stored.job.completed_at = Some(now);
        stored.job.updated_at = now;
        Ok(stored.job.clone())
    }

    async fn claim(&self, worker_id: &str, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>> {
        self.check_available()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut eligible: Vec<(i32, DateTime<Utc>, u64, JobId)> = state
            .jobs
            .values()
            .filter(|s| s.job.status == JobStatus::Queued && s.job.scheduled_at <= now)
            .map(|s| (s.job.priority, s.job.created_at, s.seq, s.job.id))
            .collect();
        eligible.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut claimed = Vec::with_capacity(batch_size.min(eligible.len()));
        for (_, _, _, id) in eligible.into_iter().take(batch_size) {
            let Some(stored) = state.jobs.get_mut(&id) else {
                continue;
            };
            let job = &mut stored.job;
            job.status = JobStatus::Processing;
            job.started_at = Some(now);
            job.worker_id = Some(worker_id.to_string());
            job.updated_at = now;

            let run = JobRun::open(job, worker_id, now);
            state.runs.entry(id).or_default().push(run.clone());
            claimed.push(ClaimedJob { job: job.clone(), run });
        }

        Ok(claimed)
    }

    async fn transition(
        &self,
        job_id: JobId,
        run_id: RunId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord> {
        self.check_available()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let stored = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| BusError::job_not_found(job_id))?;
        let run = open_run(&mut state.runs, job_id, run_id);
        guard_open_claim(&stored.job, run.as_deref(), run_id)?;
        let run = run.ok_or_else(|| BusError::stale_claim(job_id, run_id))?;

        // Work on copies so a rejected transition leaves no trace.
        let mut job = stored.job.clone();
        let mut closed = run.clone();
        let dead_letter = apply_transition(&mut job, &mut closed, transition, now)?;

        stored.job = job.clone();
        *run = closed.clone();
        if let Some(entry) = &dead_letter {
            state.dead_letters.push(entry.clone());
        }

        Ok(TransitionRecord {
            job,
            run: closed,
            dead_letter,
        })
    }

    async fn append_event(
        &self,
        job_id: JobId,
        level: EventLevel,
        message: &str,
        payload: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<JobEvent> {
        self.check_available()?;
        if self.events_unavailable.load(Ordering::SeqCst) {
            return Err(BusError::with_internal(
                ErrorCode::DatabaseQueryFailed,
                "Failed to append event",
                "in-memory event log disabled",
            ));
        }
        let mut state = self.state.lock();
        if !state.jobs.contains_key(&job_id) {
            return Err(BusError::job_not_found(job_id));
        }

        state.next_event_seq += 1;
        let event = JobEvent {
            id: Uuid::new_v4(),
            job_id,
            seq: state.next_event_seq,
            level,
            message: message.to_string(),
            payload,
            created_at: now,
        };
        state.events.push(event.clone());
        Ok(event)
    }

    async fn runs_for(&self, job_id: JobId) -> Result<Vec<JobRun>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut runs = state.runs.get(&job_id).cloned().unwrap_or_default();
        runs.sort_by_key(|r| r.run_number);
        Ok(runs)
    }

    async fn events_for(&self, job_id: JobId) -> Result<Vec<JobEvent>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state.events.iter().filter(|e| e.job_id == job_id).cloned().collect())
    }

    async fn expired_claims(&self, started_before: DateTime<Utc>) -> Result<Vec<ClaimedJob>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut expired = Vec::new();
        for stored in state.jobs.values() {
            let job = &stored.job;
            if job.status != JobStatus::Processing {
                continue;
            }
            let open = state.runs.get(&job.id).and_then(|runs| {
                runs.iter()
                    .find(|r| r.status == RunStatus::Started && r.run_number == job.current_run_number())
            });
            if let Some(run) = open {
                if run.started_at < started_before {
                    expired.push(ClaimedJob {
                        job: job.clone(),
                        run: run.clone(),
                    });
                }
            }
        }
        expired.sort_by_key(|c| c.run.started_at);
        Ok(expired)
    }

    async fn dead_letters(&self, include_resolved: bool, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .dead_letters
            .iter()
            .rev()
            .filter(|d| include_resolved || !d.resolved)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn resolve_dead_letter(&self, entry_id: Uuid, now: DateTime<Utc>) -> Result<DeadLetterEntry> {
        self.check_available()?;
        let mut state = self.state.lock();
        let entry = state
            .dead_letters
            .iter_mut()
            .find(|d| d.id == entry_id)
            .ok_or_else(|| BusError::dead_letter_not_found(entry_id))?;

        if !entry.resolved {
            entry.resolved = true;
            entry.resolved_at = Some(now);
        }
        Ok(entry.clone())
    }

    async fn stats(&self, since: DateTime<Utc>) -> Result<StatsSnapshot> {
        self.check_available()?;
        let state = self.state.lock();
        let mut snapshot = StatsSnapshot::default();

        for stored in state.jobs.values().filter(|s| s.job.created_at >= since) {
            snapshot.counts.add(stored.job.status, 1);
        }

        snapshot.dead_letter_count = state.dead_letters.iter().filter(|d| d.created_at >= since).count() as u64;

        let durations: Vec<i64> = state
            .runs
            .values()
            .flatten()
            .filter(|r| r.completed_at.map_or(false, |at| at >= since))
            .filter_map(|r| r.duration_ms)
            .collect();
        if !durations.is_empty() {
            snapshot.avg_duration_ms = durations.iter().sum::<i64>() as f64 / durations.len() as f64;
        }

        Ok(snapshot)
    }
}
