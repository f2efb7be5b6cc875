//! PostgreSQL store tests.
//!
//! These need a disposable database and are ignored by default:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/jobbus_test cargo test --test postgres_store -- --ignored
//! ```
//!
//! Every test truncates the tables, so they serialize on a shared lock.

use chrono::Utc;
use jobbus_core::bus::JobBus;
use jobbus_core::config::DatabaseConfig;
use jobbus_core::error::{ErrorCode, ErrorKind};
use jobbus_core::jobs::{
    BackoffStrategy, EnqueueRequest, JobError, JobId, JobStatus, JobStore, Outcome, PgJobStore, RunStatus,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

static DB_LOCK: Mutex<()> = Mutex::const_new(());

async fn setup() -> (MutexGuard<'static, ()>, Arc<PgJobStore>, JobBus) {
    let guard = DB_LOCK.lock().await;
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres tests");
    let store = PgJobStore::connect(&DatabaseConfig {
        url,
        max_connections: 16,
        min_connections: 1,
        acquire_timeout_secs: 10,
    })
    .await
    .unwrap();
    store.migrate().await.unwrap();
    sqlx::query("TRUNCATE dead_letters, job_events, job_runs, jobs")
        .execute(store.pool())
        .await
        .unwrap();

    let store = Arc::new(store);
    let bus = JobBus::with_backoff(store.clone(), BackoffStrategy::fixed(0));
    (guard, store, bus)
}

// ============================================================================
// Enqueue Tests
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_pg_idempotent_enqueue() {
    let (_guard, store, bus) = setup().await;

    let first = bus
        .enqueue(EnqueueRequest::new("api", "ping", json!({"n": 1})).with_idempotency_key("k"))
        .await
        .unwrap();
    let second = bus
        .enqueue(EnqueueRequest::new("api", "ping", json!({"n": 2})).with_idempotency_key("k"))
        .await
        .unwrap();

    assert!(second.is_duplicate());
    assert_eq!(first.job_id(), second.job_id());
    let job = store.get_job(first.job_id()).await.unwrap().unwrap();
    assert_eq!(job.payload, json!({"n": 1}));
}

// ============================================================================
// Claim Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn test_pg_concurrent_claims_are_exclusive() {
    let (_guard, _store, bus) = setup().await;
    let bus = Arc::new(bus);
    for i in 0..300 {
        bus.enqueue(EnqueueRequest::new("api", "ping", json!({ "i": i }))).await.unwrap();
    }

    let tasks: Vec<_> = (0..8)
        .map(|w| {
            let bus = bus.clone();
            tokio::spawn(async move {
                let worker_id = format!("w{}", w);
                let mut mine = Vec::new();
                loop {
                    let batch = bus.claim(&worker_id, 5).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|c| c.job.id));
                }
                mine
            })
        })
        .collect();

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let unique: HashSet<JobId> = all.iter().copied().collect();
    assert_eq!(all.len(), 300);
    assert_eq!(unique.len(), 300);
}

#[tokio::test]
#[ignore]
async fn test_pg_claim_order_and_runs() {
    let (_guard, store, bus) = setup().await;
    let low = bus.enqueue(EnqueueRequest::new("api", "ping", json!({}))).await.unwrap().job_id();
    let high = bus
        .enqueue(EnqueueRequest::new("api", "ping", json!({})).with_priority(10))
        .await
        .unwrap()
        .job_id();

    let claimed = bus.claim("w1", 10).await.unwrap();
    let order: Vec<JobId> = claimed.iter().map(|c| c.job.id).collect();
    assert_eq!(order, vec![high, low]);

    let runs = store.runs_for(high).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Started);
    assert_eq!(runs[0].worker_id, "w1");
}

// ============================================================================
// Transition Tests
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_pg_retry_then_dead_letter() {
    let (_guard, store, bus) = setup().await;
    let id = bus
        .enqueue(EnqueueRequest::new("api", "ping", json!({})).with_max_retries(1))
        .await
        .unwrap()
        .job_id();

    for _ in 0..2 {
        let claimed = bus.claim("w1", 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        bus.report_outcome(id, claimed[0].run.id, Outcome::failure(JobError::retryable("down")))
            .await
            .unwrap();
    }

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);

    let dead = store.dead_letters(false, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 2);
}

#[tokio::test]
#[ignore]
async fn test_pg_stale_report_rejected() {
    let (_guard, _store, bus) = setup().await;
    let id = bus.enqueue(EnqueueRequest::new("api", "ping", json!({}))).await.unwrap().job_id();
    let claimed = bus.claim("w1", 1).await.unwrap();

    bus.report_outcome(id, claimed[0].run.id, Outcome::success(json!(1))).await.unwrap();
    let error = bus
        .report_outcome(id, claimed[0].run.id, Outcome::success(json!(2)))
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::InvalidStateTransition);
}

#[tokio::test]
#[ignore]
async fn test_pg_cancel_and_events() {
    let (_guard, store, bus) = setup().await;
    let id = bus.enqueue(EnqueueRequest::new("api", "ping", json!({}))).await.unwrap().job_id();

    bus.cancel(id).await.unwrap();
    let error = bus.cancel(id).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotCancellable);

    let events = store.events_for(id).await.unwrap();
    let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["enqueued", "cancelled"]);
}

#[tokio::test]
#[ignore]
async fn test_pg_expired_claims_and_stats() {
    let (_guard, store, bus) = setup().await;
    bus.enqueue_at(
        EnqueueRequest::new("api", "ping", json!({})),
        Utc::now() - chrono::Duration::minutes(30),
    )
    .await
    .unwrap();
    store
        .claim("dead-worker", 1, Utc::now() - chrono::Duration::minutes(10))
        .await
        .unwrap();

    let expired = store
        .expired_claims(Utc::now() - chrono::Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);

    let stats = bus.stats(24).await.unwrap();
    assert_eq!(stats.counts.processing, 1);
    assert_eq!(stats.success_rate, 100.0);
}
