//! Job handlers and the context they execute in.
//!
//! Handlers are registered per job type in a [`HandlerRegistry`] built once
//! at startup. A job type without a handler resolves to
//! [`HandlerLookup::Unconfigured`] so the worker handles it explicitly.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::events::EventLog;
use super::idempotency::run_event_key;
use super::job::{Job, JobError, JobEvent, JobRun};
use crate::error::Result;
use crate::policy::PolicyEnforcer;

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Logic for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler serves.
    fn job_type(&self) -> &str;

    /// Execute one attempt.
    ///
    /// # Errors
    ///
    /// Return `JobError::retryable()` for transient failures and
    /// `JobError::fatal()` for failures retrying cannot fix.
    async fn execute(&self, ctx: &JobContext) -> std::result::Result<Value, JobError>;
}

/// Result of looking up a handler.
#[derive(Clone)]
pub enum HandlerLookup {
    Handler(Arc<dyn JobHandler>),
    Unconfigured { job_type: String },
}

/// Job type routing table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its job type, replacing any previous one.
    pub fn register(mut self, handler: impl JobHandler + 'static) -> Self {
        let handler: Arc<dyn JobHandler> = Arc::new(handler);
        self.handlers.insert(handler.job_type().to_string(), handler);
        self
    }

    pub fn resolve(&self, job_type: &str) -> HandlerLookup {
        match self.handlers.get(job_type) {
            Some(handler) => HandlerLookup::Handler(handler.clone()),
            None => HandlerLookup::Unconfigured {
                job_type: job_type.to_string(),
            },
        }
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to handlers during execution.
pub struct JobContext {
    job: Job,
    run: JobRun,
    agent_id: String,
    enforcer: PolicyEnforcer,
    events: EventLog,
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(
        job: Job,
        run: JobRun,
        agent_id: impl Into<String>,
        enforcer: PolicyEnforcer,
        events: EventLog,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job,
            run,
            agent_id: agent_id.into(),
            enforcer,
            events,
            cancellation,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn run(&self) -> &JobRun {
        &self.run
    }

    pub fn payload(&self) -> &Value {
        &self.job.payload
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.run.run_number
    }

    /// Check if the worker is shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Must be called before every durable write the handler performs.
    pub fn assert_write(&self, surface: &str) -> Result<()> {
        self.enforcer.assert_write_allowed(&self.agent_id, surface)
    }

    /// Idempotency key for a sub-step of this run.
    pub fn step_key(&self, step: &str) -> String {
        run_event_key(self.run.id, step)
    }

    pub async fn log_info(&self, message: &str, payload: Option<Value>) -> Result<JobEvent> {
        self.events.info(self.job.id, message, payload).await
    }

    pub async fn log_warn(&self, message: &str, payload: Option<Value>) -> Result<JobEvent> {
        self.events.warn(self.job.id, message, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        fn job_type(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _ctx: &JobContext) -> std::result::Result<Value, JobError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_resolve_registered_and_unconfigured() {
        let registry = HandlerRegistry::new().register(Noop);

        assert!(matches!(registry.resolve("noop"), HandlerLookup::Handler(_)));
        match registry.resolve("missing") {
            HandlerLookup::Unconfigured { job_type } => assert_eq!(job_type, "missing"),
            HandlerLookup::Handler(_) => panic!("expected unconfigured"),
        }
        assert_eq!(registry.job_types(), vec!["noop"]);
    }
}
