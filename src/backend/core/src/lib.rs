#![allow(clippy::result_large_err)]
//! # JobBus Core
//!
//! Durable job execution bus.
//!
//! ## Architecture
//!
//! - **Job Store**: PostgreSQL (or in-memory) record of jobs, runs, events and dead letters
//! - **Claim Coordinator**: Exclusive, non-blocking batch claims across any number of workers
//! - **Retry Manager**: Bounded retries with monotonic backoff, then dead letters
//! - **Policy Enforcer**: Per-agent allow-lists for job types and write surfaces, fail-closed
//! - **Worker Pool**: Concurrent polling slots with timeouts and graceful shutdown
//! - **Telemetry**: Structured logging with redaction and Prometheus metrics

pub mod bus;
pub mod config;
pub mod error;
pub mod jobs;
pub mod policy;
pub mod telemetry;

pub use bus::JobBus;
pub use error::{BusError, ErrorCode, ErrorDetails, ErrorKind, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bus::JobBus;
    pub use crate::config::Config;
    pub use crate::error::{BusError, ErrorCode, ErrorKind, Result};
    pub use crate::jobs::{
        BackoffStrategy, ClaimedJob, DeadLetterEntry, EnqueueOutcome, EnqueueRequest, HandlerRegistry,
        InMemoryJobStore, Job, JobContext, JobDetail, JobError, JobFilter, JobHandler, JobId, JobStatus,
        JobStore, Outcome, PgJobStore, RunId, WorkerConfig, WorkerPool,
    };
    pub use crate::policy::{AgentPolicy, PolicyDecision, PolicyEnforcer, PolicyRegistry};
}
