//! Recurring interval schedules.
//!
//! Each tick enqueues every due schedule with a bucket idempotency key, so any
//! number of processes ticking the same schedule inside one bucket window
//! produce a single job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::JobBus;
use crate::error::Result;
use crate::jobs::store::EnqueueOutcome;

/// Longest accepted interval, one year.
pub const MAX_INTERVAL_SECS: u64 = 366 * 24 * 60 * 60;

/// A recurring job declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Stable identifier, part of the bucket key
    pub schedule_id: String,
    pub job_type: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_payload")]
    pub payload: Value,
    /// Seconds between fires, at most [`MAX_INTERVAL_SECS`]
    pub interval_secs: u64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_source() -> String {
    "scheduler".to_string()
}

fn default_payload() -> Value {
    Value::Object(Default::default())
}

fn default_max_retries() -> u32 {
    3
}

impl ScheduleSpec {
    pub fn new(schedule_id: impl Into<String>, job_type: impl Into<String>, interval_secs: u64) -> Self {
        Self {
            schedule_id: schedule_id.into(),
            job_type: job_type.into(),
            source: default_source(),
            payload: default_payload(),
            interval_secs,
            priority: 0,
            max_retries: default_max_retries(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.interval_secs.min(MAX_INTERVAL_SECS) as i64)
    }
}

/// A schedule and when this process last fired it.
#[derive(Debug)]
struct ScheduledEntry {
    spec: ScheduleSpec,
    last_fired: Option<DateTime<Utc>>,
}

impl ScheduledEntry {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_fired {
            None => true,
            Some(last) => now - last >= self.spec.interval(),
        }
    }
}

/// What one tick did for one schedule.
#[derive(Debug)]
pub struct TickOutcome {
    pub schedule_id: String,
    pub outcome: Result<EnqueueOutcome>,
}

impl TickOutcome {
    pub fn is_fired(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Fires interval schedules through the bus.
pub struct Scheduler {
    bus: Arc<JobBus>,
    entries: Arc<RwLock<Vec<ScheduledEntry>>>,
}

impl Scheduler {
    pub fn new(bus: Arc<JobBus>, schedules: impl IntoIterator<Item = ScheduleSpec>) -> Self {
        let entries = schedules
            .into_iter()
            .map(|spec| ScheduledEntry { spec, last_fired: None })
            .collect();
        Self {
            bus,
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    /// Identifiers of all configured schedules.
    pub async fn list(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| e.spec.schedule_id.clone())
            .collect()
    }

    /// Enqueue every schedule that is due at `now`, one outcome per due schedule.
    ///
    /// A schedule that fails to enqueue stays due and is retried next tick;
    /// the other due schedules still fire.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<TickOutcome> {
        let mut entries = self.entries.write().await;
        let mut outcomes = Vec::new();

        for entry in entries.iter_mut().filter(|e| e.is_due(now)) {
            let outcome = self.bus.trigger_schedule(&entry.spec, now).await;
            match &outcome {
                Ok(enqueued) => {
                    entry.last_fired = Some(now);
                    debug!(
                        schedule_id = %entry.spec.schedule_id,
                        job_id = %enqueued.job_id(),
                        duplicate = enqueued.is_duplicate(),
                        "Schedule fired"
                    );
                }
                Err(error) => {
                    warn!(schedule_id = %entry.spec.schedule_id, "Schedule failed to fire");
                    error.log();
                }
            }
            outcomes.push(TickOutcome {
                schedule_id: entry.spec.schedule_id.clone(),
                outcome,
            });
        }

        outcomes
    }

    /// Tick every `period` until `token` is cancelled.
    pub async fn run(&self, period: Duration, token: CancellationToken) {
        let schedules = self.entries.read().await.len();
        info!(schedules, "Scheduler started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }

        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobFilter;
    use crate::jobs::memory::InMemoryJobStore;
    use crate::jobs::store::JobStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn scheduler(store: Arc<InMemoryJobStore>, specs: Vec<ScheduleSpec>) -> Scheduler {
        Scheduler::new(Arc::new(JobBus::new(store)), specs)
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_tick_fires_once_per_interval() {
        let store = Arc::new(InMemoryJobStore::new());
        let scheduler = scheduler(store.clone(), vec![ScheduleSpec::new("heartbeat", "ping", 600)]);

        assert_eq!(scheduler.tick(at(8, 0)).await.len(), 1);
        assert!(scheduler.tick(at(8, 5)).await.is_empty());
        assert_eq!(scheduler.tick(at(8, 10)).await.len(), 1);
        assert_eq!(store.job_count(), 2);
    }

    #[tokio::test]
    async fn test_two_schedulers_same_bucket_make_one_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let spec = ScheduleSpec::new("report", "echo", 300).with_payload(json!({"k": 1}));
        let a = scheduler(store.clone(), vec![spec.clone()]);
        let b = scheduler(store.clone(), vec![spec]);

        let first = a.tick(at(8, 7)).await.remove(0).outcome.unwrap();
        let second = b.tick(at(8, 9)).await.remove(0).outcome.unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.job_id(), second.job_id());

        let jobs = store.list_jobs(&JobFilter::default(), 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source, "scheduler");
    }

    #[tokio::test]
    async fn test_failed_enqueue_stays_due() {
        let store = Arc::new(InMemoryJobStore::new());
        let scheduler = scheduler(store.clone(), vec![ScheduleSpec::new("heartbeat", "ping", 600)]);

        store.set_available(false);
        let outcomes = scheduler.tick(at(8, 0)).await;
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].is_fired());

        store.set_available(true);
        let outcomes = scheduler.tick(at(8, 1)).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_fired());
    }

    #[tokio::test]
    async fn test_failing_schedule_does_not_block_later_ones() {
        let store = Arc::new(InMemoryJobStore::new());
        let scheduler = scheduler(
            store.clone(),
            vec![
                ScheduleSpec::new("broken", " ", 600),
                ScheduleSpec::new("heartbeat", "ping", 600),
            ],
        );

        let outcomes = scheduler.tick(at(8, 0)).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].schedule_id, "broken");
        assert!(!outcomes[0].is_fired());
        assert_eq!(outcomes[1].schedule_id, "heartbeat");
        assert!(outcomes[1].is_fired());
        assert_eq!(store.job_count(), 1);

        // the broken schedule is still due, the fired one is not
        let outcomes = scheduler.tick(at(8, 1)).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].schedule_id, "broken");
    }

    #[tokio::test]
    async fn test_run_fires_from_spawned_task_until_cancelled() {
        let store = Arc::new(InMemoryJobStore::new());
        let scheduler = Arc::new(scheduler(store.clone(), vec![ScheduleSpec::new("heartbeat", "ping", 600)]));
        let token = CancellationToken::new();

        let task = tokio::spawn({
            let scheduler = scheduler.clone();
            let token = token.clone();
            async move { scheduler.run(Duration::from_millis(10), token).await }
        });

        for _ in 0..100 {
            if store.job_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        task.await.unwrap();
        assert_eq!(store.job_count(), 1);
    }

    #[test]
    fn test_interval_is_clamped() {
        let spec = ScheduleSpec::new("s", "ping", u64::MAX);
        assert_eq!(spec.interval(), chrono::Duration::seconds(MAX_INTERVAL_SECS as i64));
        assert_eq!(ScheduleSpec::new("s", "ping", 90).interval(), chrono::Duration::seconds(90));
    }

    #[test]
    fn test_spec_defaults() {
        let spec: ScheduleSpec = serde_json::from_value(json!({
            "schedule_id": "s",
            "job_type": "ping",
            "interval_secs": 60
        }))
        .unwrap();
        assert_eq!(spec.source, "scheduler");
        assert_eq!(spec.max_retries, 3);
        assert_eq!(spec.priority, 0);
        assert_eq!(spec.payload, json!({}));
    }
}
