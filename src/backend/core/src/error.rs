//! Error handling for the job bus.
//!
//! This module provides:
//! - A single structured error type with machine-readable codes
//! - A coarse [`ErrorKind`] that collaborators branch on (bad input, not found,
//!   not cancellable, internal)
//! - User-facing vs internal messages
//! - Severity-aware logging and an error counter metric

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for job bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by collaborators for programmatic
/// error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    InvalidStateTransition,
    DeadLetterNotFound,

    // Worker Errors (1100-1199)
    ClaimFailure,
    ExecutionFailure,
    ExecutionTimeout,
    HandlerNotConfigured,

    // Policy Errors (1200-1299)
    PolicyViolation,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    DuplicateRecord,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,
    MissingRequiredField,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

/// What a collaborator calling enqueue/get/list/cancel needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadInput,
    NotFound,
    NotCancellable,
    Internal,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::InvalidStateTransition => 1001,
            Self::DeadLetterNotFound => 1003,

            Self::ClaimFailure => 1100,
            Self::ExecutionFailure => 1101,
            Self::ExecutionTimeout => 1102,
            Self::HandlerNotConfigured => 1103,

            Self::PolicyViolation => 1200,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::DuplicateRecord => 2005,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,
            Self::MissingRequiredField => 4102,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Map the code onto the caller-facing error kind.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationError
            | Self::InvalidInput
            | Self::MissingRequiredField
            | Self::DuplicateRecord => ErrorKind::BadInput,

            Self::JobNotFound | Self::DeadLetterNotFound => ErrorKind::NotFound,

            Self::InvalidStateTransition => ErrorKind::NotCancellable,

            _ => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::ClaimFailure
                | Self::ExecutionFailure
                | Self::ExecutionTimeout
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "worker",
            1200..=1299 => "policy",
            2000..=2099 => "database",
            2200..=2299 => "serialization",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown job, not cancellable)
    Low,
    /// Operational issues (failed attempts, timeouts, policy denials)
    Medium,
    /// System errors (database failures, bugs)
    High,
    /// Errors that stop the process
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::InvalidInput
            | ErrorCode::MissingRequiredField
            | ErrorCode::JobNotFound
            | ErrorCode::DeadLetterNotFound
            | ErrorCode::DuplicateRecord
            | ErrorCode::InvalidStateTransition => Self::Low,

            ErrorCode::ExecutionFailure
            | ErrorCode::ExecutionTimeout
            | ErrorCode::HandlerNotConfigured
            | ErrorCode::PolicyViolation
            | ErrorCode::ClaimFailure => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InternalError => Self::High,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, agent, dead letter)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the job bus.
#[derive(Error, Debug)]
pub struct BusError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Message safe to hand to collaborators
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl BusError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "jobbus_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for BusError {
    fn from(error: sqlx::Error) -> Self {
        let (code, message) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::JobNotFound, "Record not found"),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                (ErrorCode::DatabaseConnectionFailed, "Database unavailable")
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                (ErrorCode::DuplicateRecord, "Duplicate record")
            }
            sqlx::Error::Database(_) => (ErrorCode::DatabaseQueryFailed, "Database query failed"),
            sqlx::Error::Migrate(_) => (ErrorCode::DatabaseError, "Database migration failed"),
            _ => (ErrorCode::DatabaseError, "Database error"),
        };
        let internal = error.to_string();
        Self::with_internal(code, message, internal).with_source(error)
    }
}

impl From<serde_json::Error> for BusError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_data() || error.is_syntax() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };
        let internal = error.to_string();
        Self::with_internal(code, "Failed to process JSON document", internal).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for BusError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::ExecutionTimeout, "Operation timed out", error.to_string())
    }
}

impl From<std::io::Error> for BusError {
    fn from(error: std::io::Error) -> Self {
        let internal = error.to_string();
        Self::with_internal(ErrorCode::InternalError, "I/O error", internal).with_source(error)
    }
}

impl From<config::ConfigError> for BusError {
    fn from(error: config::ConfigError) -> Self {
        let code = match &error {
            config::ConfigError::NotFound(_) => ErrorCode::MissingConfiguration,
            config::ConfigError::Type { .. } => ErrorCode::InvalidConfiguration,
            _ => ErrorCode::ConfigurationError,
        };
        let internal = error.to_string();
        Self::with_internal(code, "Configuration error", internal).with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Domain-Specific Constructors
// ═══════════════════════════════════════════════════════════════════════════════

impl BusError {
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("job", id))
    }

    pub fn dead_letter_not_found(entry_id: impl fmt::Display) -> Self {
        let id = entry_id.to_string();
        Self::new(ErrorCode::DeadLetterNotFound, format!("Dead letter entry not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("dead_letter", id))
    }

    pub fn invalid_state_transition(
        job_id: impl fmt::Display,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        let id = job_id.to_string();
        let (from, to) = (from.to_string(), to.to_string());
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Job {} cannot move from {} to {}", id, from, to),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("job", id)
                .with_context("from", from)
                .with_context("to", to),
        )
    }

    /// The reported run is no longer the job's open attempt.
    pub fn stale_claim(job_id: impl fmt::Display, run_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Run {} no longer holds the claim on job {}", run_id, id),
        )
        .with_details(ErrorDetails::new().with_entity("job", id))
    }

    pub fn policy_violation(agent_id: impl Into<String>, subject: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        let subject = subject.into();
        Self::new(
            ErrorCode::PolicyViolation,
            format!("Agent '{}' is not authorized for '{}'", agent_id, subject),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("agent", agent_id)
                .with_context("subject", subject),
        )
    }

    pub fn claim_failure(reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::ClaimFailure, "Failed to claim jobs", reason)
    }

    pub fn execution_timeout(job_id: impl fmt::Display, limit_ms: u64) -> Self {
        Self::new(
            ErrorCode::ExecutionTimeout,
            format!("Job {} exceeded its {}ms execution limit", job_id, limit_ms),
        )
        .with_context("limit_ms", limit_ms)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(ErrorCode::InvalidInput.kind(), ErrorKind::BadInput);
        assert_eq!(ErrorCode::JobNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(ErrorCode::InvalidStateTransition.kind(), ErrorKind::NotCancellable);
        assert_eq!(ErrorCode::DatabaseError.kind(), ErrorKind::Internal);
        assert_eq!(ErrorCode::PolicyViolation.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::ClaimFailure.is_retryable());
        assert!(ErrorCode::ExecutionTimeout.is_retryable());
        assert!(!ErrorCode::PolicyViolation.is_retryable());
        assert!(!ErrorCode::HandlerNotConfigured.is_retryable());
    }

    #[test]
    fn test_policy_violation_details() {
        let error = BusError::policy_violation("unregistered-agent", "ping");
        assert_eq!(error.code(), ErrorCode::PolicyViolation);
        assert_eq!(error.details().entity_id.as_deref(), Some("unregistered-agent"));
        assert!(error.details().context.contains_key("subject"));
        assert!(error.user_message().contains("ping"));
    }

    #[test]
    fn test_invalid_state_transition() {
        let error = BusError::invalid_state_transition("job-1", "processing", "cancelled");
        assert_eq!(error.kind(), ErrorKind::NotCancellable);
        assert!(error.user_message().contains("processing"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::JobNotFound), ErrorSeverity::Low);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::PolicyViolation), ErrorSeverity::Medium);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::DatabaseError), ErrorSeverity::High);
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ConfigurationError),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_error_display() {
        let error = BusError::with_internal(
            ErrorCode::DatabaseError,
            "Database error",
            "Connection refused: localhost:5432",
        );

        let display = format!("{}", error);
        assert!(display.contains("DatabaseError"));
        assert!(display.contains("Connection refused"));
    }
}
