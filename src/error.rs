//! Error types for jobwarden.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::JobState;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job-related errors. These are returned synchronously to the caller.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: JobState, to: JobState },

    #[error("Job {id} is no longer leased by {owner}")]
    LeaseLost { id: Uuid, owner: String },

    #[error("Job {id} is still leased by a live worker")]
    LeaseHeld { id: Uuid },

    #[error("Job {id} was cancelled")]
    Cancelled { id: Uuid },

    #[error("No handler registered for task type {task_type}")]
    NoHandler { task_type: String },

    #[error("Handler for task type {task_type} is already registered")]
    DuplicateHandler { task_type: String },

    #[error("No dead-letter entry for job {id}")]
    DeadLetterNotFound { id: Uuid },

    #[error("Dead-letter entry for job {id} is already {status}")]
    DeadLetterResolved { id: Uuid, status: String },

    #[error("Checkpoint sequence for job {id} must exceed {latest}, got {sequence}")]
    CheckpointSequence { id: Uuid, latest: u32, sequence: u32 },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Classification of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkTimeout,
    RateLimited,
    ResourceUnavailable,
    CircuitOpen,
    /// The soft or hard execution time limit fired.
    TimeLimitExceeded,
    InvalidInput,
    AuthFailure,
    CheckpointCorrupt,
    RetryBudgetExhausted,
    /// The job was cancelled or the worker lost its lease. Not a failure.
    Cancelled,
}

impl ErrorKind {
    /// Whether the retry policy may schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkTimeout
                | Self::RateLimited
                | Self::ResourceUnavailable
                | Self::CircuitOpen
                | Self::TimeLimitExceeded
        )
    }

    /// Whether this failure says something about the health of a dependency.
    pub fn counts_against_dependency(&self) -> bool {
        self.is_retryable() && *self != Self::CircuitOpen
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network_timeout",
            Self::RateLimited => "rate_limited",
            Self::ResourceUnavailable => "resource_unavailable",
            Self::CircuitOpen => "circuit_open",
            Self::TimeLimitExceeded => "time_limit_exceeded",
            Self::InvalidInput => "invalid_input",
            Self::AuthFailure => "auth_failure",
            Self::CheckpointCorrupt => "checkpoint_corrupt",
            Self::RetryBudgetExhausted => "retry_budget_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "network_timeout" => Ok(Self::NetworkTimeout),
            "rate_limited" => Ok(Self::RateLimited),
            "resource_unavailable" => Ok(Self::ResourceUnavailable),
            "circuit_open" => Ok(Self::CircuitOpen),
            "time_limit_exceeded" => Ok(Self::TimeLimitExceeded),
            "invalid_input" => Ok(Self::InvalidInput),
            "auth_failure" => Ok(Self::AuthFailure),
            "checkpoint_corrupt" => Ok(Self::CheckpointCorrupt),
            "retry_budget_exhausted" => Ok(Self::RetryBudgetExhausted),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

/// Error returned by a task handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
    /// Overrides the scheduled retry delay (set for `circuit_open`).
    pub retry_after: Option<Duration>,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn network_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkTimeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn resource_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceUnavailable, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn auth_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailure, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Fail-fast error for a dependency whose breaker is open.
    pub fn circuit_open(dependency: &str, remaining: Duration) -> Self {
        Self {
            kind: ErrorKind::CircuitOpen,
            message: format!(
                "circuit for {dependency} is open, {}s of cool-down left",
                remaining.as_secs()
            ),
            retry_after: Some(remaining),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_partition() {
        for kind in [
            ErrorKind::NetworkTimeout,
            ErrorKind::RateLimited,
            ErrorKind::ResourceUnavailable,
            ErrorKind::CircuitOpen,
            ErrorKind::TimeLimitExceeded,
        ] {
            assert!(kind.is_retryable(), "{kind} should be retryable");
        }
        for kind in [
            ErrorKind::InvalidInput,
            ErrorKind::AuthFailure,
            ErrorKind::CheckpointCorrupt,
            ErrorKind::RetryBudgetExhausted,
            ErrorKind::Cancelled,
        ] {
            assert!(!kind.is_retryable(), "{kind} should be terminal");
        }
    }

    #[test]
    fn circuit_open_does_not_count_against_dependency() {
        assert!(!ErrorKind::CircuitOpen.counts_against_dependency());
        assert!(ErrorKind::NetworkTimeout.counts_against_dependency());
        assert!(!ErrorKind::InvalidInput.counts_against_dependency());
    }

    #[test]
    fn error_kind_parses_its_own_display() {
        let kind: ErrorKind = ErrorKind::RetryBudgetExhausted.to_string().parse().unwrap();
        assert_eq!(kind, ErrorKind::RetryBudgetExhausted);
        assert!("bogus".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn circuit_open_carries_remaining_cooldown() {
        let err = HandlerError::circuit_open("llm", Duration::from_secs(42));
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert_eq!(err.retry_after, Some(Duration::from_secs(42)));
        assert!(err.to_string().starts_with("circuit_open:"));
    }
}
