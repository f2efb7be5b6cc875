//! Configuration management.
//!
//! Values come from an optional file plus `JOBBUS__*` environment variables,
//! with `__` separating nested keys (`JOBBUS__WORKER__CONCURRENCY=8`).

use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{BusError, Result};
use crate::jobs::retry::BackoffStrategy;
use crate::jobs::scheduler::{ScheduleSpec, MAX_INTERVAL_SECS};
use crate::policy::AgentPolicy;
use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Retry backoff
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Agent policies; an agent missing here is authorized for nothing
    #[serde(default)]
    pub agents: Vec<AgentPolicy>,

    /// Recurring interval schedules
    #[serde(default)]
    pub schedules: Vec<ScheduleSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a pooled connection
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Identifier recorded on claimed jobs and runs
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// Agent identity the worker executes as
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// Number of independent polling slots
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Jobs claimed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sleep after an empty claim
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Sleep after a failed iteration
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    /// Claims older than the longest agent limit times this are reclaimed
    #[serde(default = "default_lease_multiplier")]
    pub lease_multiplier: u32,

    /// Explicit lease, overriding the derived one
    #[serde(default)]
    pub lease_timeout_ms: Option<u64>,

    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,

    #[serde(default = "default_schedule_tick_ms")]
    pub schedule_tick_ms: u64,

    /// Grace period for in-flight jobs on shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            agent_id: default_agent_id(),
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            lease_multiplier: default_lease_multiplier(),
            lease_timeout_ms: None,
            reclaim_interval_ms: default_reclaim_interval_ms(),
            schedule_tick_ms: default_schedule_tick_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

// Default value functions
fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

fn default_worker_id() -> String {
    format!("jobbus-worker-{}", std::process::id())
}

fn default_agent_id() -> String {
    "worker".to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_batch_size() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    800
}

fn default_error_backoff_ms() -> u64 {
    1500
}

fn default_lease_multiplier() -> u32 {
    3
}

fn default_reclaim_interval_ms() -> u64 {
    30_000
}

fn default_schedule_tick_ms() -> u64 {
    15_000
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("JOBBUS").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("JOBBUS").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Reject settings the worker cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(BusError::configuration("database.url must not be empty"));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(BusError::configuration(
                "database.min_connections exceeds database.max_connections",
            ));
        }

        let worker = &self.worker;
        if worker.concurrency == 0 {
            return Err(BusError::configuration("worker.concurrency must be at least 1"));
        }
        if worker.batch_size == 0 {
            return Err(BusError::configuration("worker.batch_size must be at least 1"));
        }
        if worker.poll_interval_ms == 0 {
            return Err(BusError::configuration("worker.poll_interval_ms must be positive"));
        }
        if worker.lease_multiplier == 0 {
            return Err(BusError::configuration("worker.lease_multiplier must be at least 1"));
        }
        if worker.worker_id.trim().is_empty() {
            return Err(BusError::configuration("worker.worker_id must not be empty"));
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if !agent_ids.insert(agent.agent_id.as_str()) {
                return Err(BusError::configuration(format!(
                    "agent '{}' is defined more than once",
                    agent.agent_id
                )));
            }
            if agent.max_duration_ms == 0 {
                return Err(BusError::configuration(format!(
                    "agent '{}' needs a positive max_duration_ms",
                    agent.agent_id
                )));
            }
        }
        if !agent_ids.contains(worker.agent_id.as_str()) {
            return Err(BusError::configuration(format!(
                "worker agent '{}' has no policy",
                worker.agent_id
            )));
        }

        let mut schedule_ids = HashSet::new();
        for schedule in &self.schedules {
            if !schedule_ids.insert(schedule.schedule_id.as_str()) {
                return Err(BusError::configuration(format!(
                    "schedule '{}' is defined more than once",
                    schedule.schedule_id
                )));
            }
            if schedule.interval_secs == 0 {
                return Err(BusError::configuration(format!(
                    "schedule '{}' needs a positive interval_secs",
                    schedule.schedule_id
                )));
            }
            if schedule.interval_secs > MAX_INTERVAL_SECS {
                return Err(BusError::configuration(format!(
                    "schedule '{}' interval_secs exceeds {}",
                    schedule.schedule_id, MAX_INTERVAL_SECS
                )));
            }
        }

        Ok(())
    }

    /// How long a claim may stay in `processing` before it is reclaimed.
    pub fn lease_timeout(&self) -> Duration {
        if let Some(ms) = self.worker.lease_timeout_ms {
            return Duration::from_millis(ms);
        }
        let longest = self
            .agents
            .iter()
            .map(|a| a.max_duration_ms)
            .max()
            .unwrap_or(crate::policy::DEFAULT_MAX_DURATION_MS);
        Duration::from_millis(longest.saturating_mul(u64::from(self.worker.lease_multiplier)))
    }
}
