//! Agent policies.
//!
//! The enforcer answers two questions, both fail-closed:
//! "May agent A handle job type T?" and "May agent A write to surface S?"
//! An agent without a registered policy is authorized for nothing.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{BusError, Result};
use crate::telemetry::metrics;

/// Attempt limit used when no agent policy is configured at all.
pub const DEFAULT_MAX_DURATION_MS: u64 = 60_000;

// ═══════════════════════════════════════════════════════════════════════════════
// Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Static authorization record for one execution agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub agent_id: String,

    #[serde(default)]
    pub allowed_job_types: HashSet<String>,

    /// Named durable surfaces the agent may write to
    #[serde(default)]
    pub allowed_write_surfaces: HashSet<String>,

    /// Upper bound for a single attempt
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
}

fn default_max_duration_ms() -> u64 {
    DEFAULT_MAX_DURATION_MS
}

impl AgentPolicy {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            allowed_job_types: HashSet::new(),
            allowed_write_surfaces: HashSet::new(),
            max_duration_ms: DEFAULT_MAX_DURATION_MS,
        }
    }

    pub fn allow_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.allowed_job_types.insert(job_type.into());
        self
    }

    pub fn allow_write_surface(mut self, surface: impl Into<String>) -> Self {
        self.allowed_write_surfaces.insert(surface.into());
        self
    }

    pub fn with_max_duration_ms(mut self, max_duration_ms: u64) -> Self {
        self.max_duration_ms = max_duration_ms;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decision
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The action is allowed.
    Allow,
    /// The action is denied, with a reason.
    Deny(String),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Deny(_))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry and Enforcer
// ═══════════════════════════════════════════════════════════════════════════════

/// Policy table built once at startup. Immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, AgentPolicy>,
}

impl PolicyRegistry {
    /// Build the table; a later entry for the same agent replaces an earlier one.
    pub fn new(policies: impl IntoIterator<Item = AgentPolicy>) -> Self {
        let policies = policies
            .into_iter()
            .map(|p| (p.agent_id.clone(), p))
            .collect();
        Self { policies }
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentPolicy> {
        self.policies.get(agent_id)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Longest attempt limit across agents.
    pub fn longest_max_duration(&self) -> Option<Duration> {
        self.policies
            .values()
            .map(|p| p.max_duration_ms)
            .max()
            .map(Duration::from_millis)
    }
}

/// Authorizes agents against the policy table.
#[derive(Debug, Clone)]
pub struct PolicyEnforcer {
    registry: Arc<PolicyRegistry>,
}

impl PolicyEnforcer {
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Evaluate whether `agent_id` may handle `job_type`.
    pub fn check_job(&self, agent_id: &str, job_type: &str) -> PolicyDecision {
        match self.registry.get(agent_id) {
            None => PolicyDecision::Deny(format!("Agent {} has no registered policy", agent_id)),
            Some(policy) if policy.allowed_job_types.contains(job_type) => PolicyDecision::Allow,
            Some(_) => PolicyDecision::Deny(format!(
                "Agent {} may not handle job type {}",
                agent_id, job_type
            )),
        }
    }

    /// Evaluate whether `agent_id` may write to `surface`.
    pub fn check_write(&self, agent_id: &str, surface: &str) -> PolicyDecision {
        match self.registry.get(agent_id) {
            None => PolicyDecision::Deny(format!("Agent {} has no registered policy", agent_id)),
            Some(policy) if policy.allowed_write_surfaces.contains(surface) => PolicyDecision::Allow,
            Some(_) => PolicyDecision::Deny(format!(
                "Agent {} may not write to {}",
                agent_id, surface
            )),
        }
    }

    pub fn assert_job_allowed(&self, agent_id: &str, job_type: &str) -> Result<()> {
        enforce(self.check_job(agent_id, job_type), agent_id, job_type)
    }

    pub fn assert_write_allowed(&self, agent_id: &str, surface: &str) -> Result<()> {
        enforce(self.check_write(agent_id, surface), agent_id, surface)
    }

    /// Attempt limit for an agent, if it has a policy.
    pub fn max_duration(&self, agent_id: &str) -> Option<Duration> {
        self.registry
            .get(agent_id)
            .map(|p| Duration::from_millis(p.max_duration_ms))
    }
}

fn enforce(decision: PolicyDecision, agent_id: &str, subject: &str) -> Result<()> {
    match decision {
        PolicyDecision::Allow => {
            debug!(agent_id, subject, "Policy check passed");
            Ok(())
        }
        PolicyDecision::Deny(reason) => {
            warn!(agent_id, subject, reason = %reason, "Policy check denied");
            metrics::record_policy_denial(agent_id);
            Err(BusError::policy_violation(agent_id, subject))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
