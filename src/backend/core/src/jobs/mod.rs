//! Durable job execution.
//!
//! ```text
//! ┌──────────┐  enqueue   ┌─────────────┐   claim    ┌──────────────┐
//! │ Producer │──────────▶│  JobStore   │◀──────────│  WorkerPool  │
//! │/Scheduler│            │ (Postgres / │            │  (N slots)   │
//! └──────────┘            │  in-memory) │◀──────────│              │
//!                         └─────────────┘  outcome   └──────┬───────┘
//!                               ▲                           │ policy check,
//!                               │ requeue / dead letter     │ handler, timeout
//!                         ┌─────┴────────┐                  ▼
//!                         │ RetryManager │◀───────── Outcome
//!                         └──────────────┘
//! ```
//!
//! Every status change happens inside one atomic store operation: claim,
//! transition or cancel.

pub mod builtin;
pub mod claim;
pub mod events;
pub mod handler;
pub mod idempotency;
pub mod job;
pub mod memory;
pub mod postgres;
pub mod reclaim;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use builtin::{EchoHandler, PingHandler};
pub use claim::ClaimCoordinator;
pub use events::EventLog;
pub use handler::{HandlerLookup, HandlerRegistry, JobContext, JobHandler};
pub use job::{
    ClaimedJob, DeadLetterEntry, EnqueueRequest, EventLevel, Job, JobDetail, JobError, JobEvent,
    JobFilter, JobId, JobRun, JobStats, JobStatus, RunId, RunStatus, StatusCounts,
};
pub use memory::InMemoryJobStore;
pub use postgres::PgJobStore;
pub use reclaim::LeaseReclaimer;
pub use retry::{BackoffStrategy, Outcome, RetryManager};
pub use scheduler::{ScheduleSpec, Scheduler};
pub use store::{EnqueueOutcome, JobStore, Transition, TransitionRecord};
pub use worker::{Iteration, WorkerConfig, WorkerHandle, WorkerPool, WorkerStats};
