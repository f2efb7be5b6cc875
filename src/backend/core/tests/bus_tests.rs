//! Job bus tests against the in-memory store.
//!
//! Tests cover:
//! - Idempotent enqueue, including concurrent duplicates
//! - Exclusive claims under concurrent polling
//! - Claim ordering and eligibility
//! - Listing, cancellation and statistics
//! - Dead letter triage and schedule buckets

use chrono::{TimeZone, Utc};
use jobbus_core::bus::JobBus;
use jobbus_core::error::{ErrorCode, ErrorKind};
use jobbus_core::jobs::idempotency::schedule_bucket_key;
use jobbus_core::jobs::{
    BackoffStrategy, EnqueueRequest, InMemoryJobStore, JobError, JobFilter, JobId, JobStatus, JobStore,
    Outcome, ScheduleSpec,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

fn bus() -> (Arc<InMemoryJobStore>, JobBus) {
    let store = Arc::new(InMemoryJobStore::new());
    let bus = JobBus::with_backoff(store.clone(), BackoffStrategy::fixed(0));
    (store, bus)
}

// ============================================================================
// Enqueue Tests
// ============================================================================

#[tokio::test]
async fn test_duplicate_key_returns_existing_without_mutation() {
    let (store, bus) = bus();
    let first = bus
        .enqueue(EnqueueRequest::new("api", "ping", json!({"n": 1})).with_idempotency_key("order-42"))
        .await
        .unwrap();
    let second = bus
        .enqueue(
            EnqueueRequest::new("api", "ping", json!({"n": 2}))
                .with_priority(99)
                .with_idempotency_key("order-42"),
        )
        .await
        .unwrap();

    assert!(!first.is_duplicate());
    assert!(second.is_duplicate());
    assert_eq!(first.job_id(), second.job_id());

    let job = store.get_job(first.job_id()).await.unwrap().unwrap();
    assert_eq!(job.payload, json!({"n": 1}));
    assert_eq!(job.priority, 0);
    assert_eq!(store.job_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_enqueues_make_one_job() {
    let (store, bus) = bus();
    let bus = Arc::new(bus);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.enqueue(EnqueueRequest::new("api", "ping", json!({})).with_idempotency_key("same"))
                    .await
                    .unwrap()
                    .job_id()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap());
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(store.job_count(), 1);
}

#[tokio::test]
async fn test_enqueue_without_key_never_dedupes() {
    let (store, bus) = bus();
    for _ in 0..3 {
        bus.enqueue(EnqueueRequest::new("api", "ping", json!({}))).await.unwrap();
    }
    assert_eq!(store.job_count(), 3);
}

// ============================================================================
// Claim Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_claimants_never_share_a_job() {
    let (_, bus) = bus();
    let bus = Arc::new(bus);
    for i in 0..200 {
        bus.enqueue(EnqueueRequest::new("api", "ping", json!({ "i": i }))).await.unwrap();
    }

    let tasks: Vec<_> = (0..8)
        .map(|w| {
            let bus = bus.clone();
            tokio::spawn(async move {
                let worker_id = format!("w{}", w);
                let mut mine = Vec::new();
                loop {
                    let batch = bus.claim(&worker_id, 7).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    for claimed in batch {
                        assert_eq!(claimed.job.worker_id.as_deref(), Some(worker_id.as_str()));
                        mine.push(claimed.job.id);
                    }
                    tokio::task::yield_now().await;
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
    assert_eq!(all.len(), 200);
    assert_eq!(unique.len(), 200);
}

#[tokio::test]
async fn test_claim_orders_by_priority_then_age() {
    let (_, bus) = bus();
    let t0 = Utc::now() - chrono::Duration::minutes(10);
    let low_old = bus
        .enqueue_at(EnqueueRequest::new("api", "ping", json!({})), t0)
        .await
        .unwrap()
        .job_id();
    let high_new = bus
        .enqueue_at(
            EnqueueRequest::new("api", "ping", json!({})).with_priority(5),
            t0 + chrono::Duration::minutes(2),
        )
        .await
        .unwrap()
        .job_id();
    let high_old = bus
        .enqueue_at(
            EnqueueRequest::new("api", "ping", json!({})).with_priority(5),
            t0 + chrono::Duration::minutes(1),
        )
        .await
        .unwrap()
        .job_id();

    let claimed: Vec<JobId> = bus.claim("w1", 10).await.unwrap().iter().map(|c| c.job.id).collect();
    assert_eq!(claimed, vec![high_old, high_new, low_old]);
}

#[tokio::test]
async fn test_future_jobs_are_not_claimable() {
    let (_, bus) = bus();
    bus.enqueue(
        EnqueueRequest::new("api", "ping", json!({})).scheduled_for(Utc::now() + chrono::Duration::hours(1)),
    )
    .await
    .unwrap();

    assert!(bus.claim("w1", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_claim_opens_started_run() {
    let (_, bus) = bus();
    let id = bus.enqueue(EnqueueRequest::new("api", "ping", json!({}))).await.unwrap().job_id();

    let claimed = bus.claim("w1", 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].job.status, JobStatus::Processing);
    assert!(claimed[0].job.started_at.is_some());
    assert_eq!(claimed[0].run.run_number, 1);

    let detail = bus.get(id).await.unwrap();
    assert_eq!(detail.runs.len(), 1);
    assert_eq!(detail.runs[0].id, claimed[0].run.id);
}

#[tokio::test]
async fn test_claim_during_outage_claims_nothing() {
    let (store, bus) = bus();
    let id = bus.enqueue(EnqueueRequest::new("api", "ping", json!({}))).await.unwrap().job_id();

    store.set_available(false);
    let error = bus.claim("w1", 5).await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::ClaimFailure);

    store.set_available(true);
    assert_eq!(store.get_job(id).await.unwrap().unwrap().status, JobStatus::Queued);
}

// ============================================================================
// List and Cancel Tests
// ============================================================================

#[tokio::test]
async fn test_list_filters_newest_first() {
    let (_, bus) = bus();
    let t0 = Utc::now() - chrono::Duration::minutes(5);
    let a = bus
        .enqueue_at(EnqueueRequest::new("api", "ping", json!({})), t0)
        .await
        .unwrap()
        .job_id();
    let b = bus
        .enqueue_at(EnqueueRequest::new("api", "ping", json!({})), t0 + chrono::Duration::seconds(1))
        .await
        .unwrap()
        .job_id();
    bus.enqueue_at(EnqueueRequest::new("cron", "echo", json!({})), t0 + chrono::Duration::seconds(2))
        .await
        .unwrap();

    let filter = JobFilter {
        job_type: Some("ping".into()),
        ..JobFilter::default()
    };
    let ids: Vec<JobId> = bus.list(&filter, 10).await.unwrap().iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![b, a]);

    let limited = bus.list(&JobFilter::default(), 1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].source, "cron");
}

#[tokio::test]
async fn test_cancel_processing_is_rejected_without_mutation() {
    let (store, bus) = bus();
    let id = bus.enqueue(EnqueueRequest::new("api", "ping", json!({}))).await.unwrap().job_id();
    bus.claim("w1", 1).await.unwrap();

    let error = bus.cancel(id).await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::InvalidStateTransition);

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
}

#[tokio::test]
async fn test_cancelled_job_is_never_claimed() {
    let (_, bus) = bus();
    let id = bus.enqueue(EnqueueRequest::new("api", "ping", json!({}))).await.unwrap().job_id();
    bus.cancel(id).await.unwrap();

    assert!(bus.claim("w1", 10).await.unwrap().is_empty());
    let detail = bus.get(id).await.unwrap();
    assert_eq!(detail.events.last().unwrap().message, "cancelled");
}

#[tokio::test]
async fn test_cancel_unknown_job_is_not_found() {
    let (_, bus) = bus();
    let error = bus.cancel(JobId::new()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
}

// ============================================================================
// Stats and Dead Letter Tests
// ============================================================================

#[tokio::test]
async fn test_stats_counts_and_success_rate() {
    let (_, bus) = bus();
    for _ in 0..4 {
        bus.enqueue(EnqueueRequest::new("api", "ping", json!({})).with_max_retries(0))
            .await
            .unwrap();
    }
    bus.enqueue(EnqueueRequest::new("api", "ping", json!({})).scheduled_for(Utc::now() + chrono::Duration::hours(1)))
        .await
        .unwrap();

    let claimed = bus.claim("w1", 4).await.unwrap();
    for (i, c) in claimed.iter().enumerate() {
        let outcome = if i < 3 {
            Outcome::success(json!({}))
        } else {
            Outcome::failure(JobError::retryable("boom"))
        };
        bus.report_outcome(c.job.id, c.run.id, outcome).await.unwrap();
    }

    let stats = bus.stats(24).await.unwrap();
    assert_eq!(stats.counts.completed, 3);
    assert_eq!(stats.counts.failed, 1);
    assert_eq!(stats.counts.queued, 1);
    assert_eq!(stats.dead_letter_count, 1);
    assert_eq!(stats.success_rate, 75.0);
    assert!(stats.avg_duration_ms >= 0.0);
}

#[tokio::test]
async fn test_resolve_dead_letter() {
    let (_, bus) = bus();
    bus.enqueue(EnqueueRequest::new("api", "ping", json!({})).with_max_retries(0))
        .await
        .unwrap();
    let claimed = bus.claim("w1", 1).await.unwrap();
    bus.report_outcome(claimed[0].job.id, claimed[0].run.id, Outcome::failure(JobError::fatal("bad input")))
        .await
        .unwrap();

    let open = bus.dead_letters(false, 10).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].attempts, 1);

    let resolved = bus.resolve_dead_letter(open[0].id).await.unwrap();
    assert!(resolved.resolved);
    assert!(resolved.resolved_at.is_some());

    assert!(bus.dead_letters(false, 10).await.unwrap().is_empty());
    assert_eq!(bus.dead_letters(true, 10).await.unwrap().len(), 1);

    let error = bus.resolve_dead_letter(uuid::Uuid::new_v4()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
}

// ============================================================================
// Schedule Tests
// ============================================================================

#[test]
fn test_schedule_bucket_window() {
    let a = Utc.with_ymd_and_hms(2026, 3, 1, 8, 7, 0).unwrap();
    let b = Utc.with_ymd_and_hms(2026, 3, 1, 8, 9, 0).unwrap();
    let c = Utc.with_ymd_and_hms(2026, 3, 1, 8, 15, 0).unwrap();

    assert_eq!(schedule_bucket_key("s", a), schedule_bucket_key("s", b));
    assert!(schedule_bucket_key("s", a).ends_with("08-05"));
    assert_ne!(schedule_bucket_key("s", a), schedule_bucket_key("s", c));
}

#[tokio::test]
async fn test_trigger_schedule_dedupes_within_bucket() {
    let (store, bus) = bus();
    let spec = ScheduleSpec::new("nightly", "echo", 300);
    let a = Utc.with_ymd_and_hms(2026, 3, 1, 8, 7, 0).unwrap();
    let b = Utc.with_ymd_and_hms(2026, 3, 1, 8, 9, 0).unwrap();
    let c = Utc.with_ymd_and_hms(2026, 3, 1, 8, 15, 0).unwrap();

    let first = bus.trigger_schedule(&spec, a).await.unwrap();
    let second = bus.trigger_schedule(&spec, b).await.unwrap();
    let third = bus.trigger_schedule(&spec, c).await.unwrap();

    assert_eq!(first.job_id(), second.job_id());
    assert_ne!(first.job_id(), third.job_id());
    assert_eq!(store.job_count(), 2);
}
