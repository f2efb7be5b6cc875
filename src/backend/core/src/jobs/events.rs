//! Run event log.
//!
//! Append-only; there is no update or delete. Each appended event is also
//! mirrored to the tracing pipeline with its payload passed through the
//! sensitive field redactor.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

use super::job::{EventLevel, JobEvent, JobId};
use super::store::JobStore;
use crate::error::Result;
use crate::telemetry::SensitiveFieldRedactor;

/// Appends audit events for jobs.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn JobStore>,
}

impl EventLog {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn append(
        &self,
        job_id: JobId,
        level: EventLevel,
        message: &str,
        payload: Option<Value>,
    ) -> Result<JobEvent> {
        let event = self
            .store
            .append_event(job_id, level, message, payload, Utc::now())
            .await?;
        mirror(&event);
        Ok(event)
    }

    pub async fn debug(&self, job_id: JobId, message: &str, payload: Option<Value>) -> Result<JobEvent> {
        self.append(job_id, EventLevel::Debug, message, payload).await
    }

    pub async fn info(&self, job_id: JobId, message: &str, payload: Option<Value>) -> Result<JobEvent> {
        self.append(job_id, EventLevel::Info, message, payload).await
    }

    pub async fn warn(&self, job_id: JobId, message: &str, payload: Option<Value>) -> Result<JobEvent> {
        self.append(job_id, EventLevel::Warn, message, payload).await
    }

    pub async fn error(&self, job_id: JobId, message: &str, payload: Option<Value>) -> Result<JobEvent> {
        self.append(job_id, EventLevel::Error, message, payload).await
    }
}

fn mirror(event: &JobEvent) {
    let payload = event
        .payload
        .as_ref()
        .map(|p| SensitiveFieldRedactor::global().redact_json(p).to_string())
        .unwrap_or_default();

    match event.level {
        EventLevel::Debug => tracing::debug!(
            job_id = %event.job_id,
            seq = event.seq,
            payload = %payload,
            "{}", event.message
        ),
        EventLevel::Info => tracing::info!(
            job_id = %event.job_id,
            seq = event.seq,
            payload = %payload,
            "{}", event.message
        ),
        EventLevel::Warn => tracing::warn!(
            job_id = %event.job_id,
            seq = event.seq,
            payload = %payload,
            "{}", event.message
        ),
        EventLevel::Error => tracing::error!(
            job_id = %event.job_id,
            seq = event.seq,
            payload = %payload,
            "{}", event.message
        ),
    }
}
