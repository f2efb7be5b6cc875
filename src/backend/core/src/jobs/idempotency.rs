//! Deterministic idempotency keys.
//!
//! Recurring schedules, idempotent sub-steps of a run, and ad-hoc producer
//! submissions each get their own key shape so they can never collide.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Width of a schedule bucket in minutes.
pub const SCHEDULE_BUCKET_MINUTES: u32 = 5;

/// `schedule:<id>:bucket:YYYY-MM-DD-HH-mm`, minutes floored to the bucket width.
pub fn schedule_bucket_key(schedule_id: &str, now: DateTime<Utc>) -> String {
    let minute = now.minute() - now.minute() % SCHEDULE_BUCKET_MINUTES;
    format!(
        "schedule:{}:bucket:{:04}-{:02}-{:02}-{:02}-{:02}",
        schedule_id,
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        minute
    )
}

/// `run:<runId>:step:<stepKey>`
pub fn run_event_key(run_id: impl std::fmt::Display, step_key: &str) -> String {
    format!("run:{}:step:{}", run_id, step_key)
}

/// `adhoc:<jobType>:<clientKey>`
pub fn ad_hoc_job_key(job_type: &str, client_key: &str) -> String {
    format!("adhoc:{}:{}", job_type, client_key)
}

/// Hex SHA-256 of a payload, stable for equal documents.
///
/// `serde_json` keeps object keys sorted, so two payloads that differ only in
/// key order serialize identically.
pub fn payload_digest(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
