//! Persisted LLM task dispatch with validated retries
//!
//! This crate runs LLM requests as background tasks. Each task is driven
//! through a bounded number of attempts by the [`RetryOrchestrator`], whose
//! results are judged by a chain of validators built from the
//! [`ValidatorRegistry`]. Failed attempts feed their validation errors back
//! into the conversation before the next attempt. Task state lives in a
//! SQLite-backed [`TaskStore`], and the [`PollingManager`] exposes
//! submit/status/wait/cancel on top of it.
//!
//! Provider protocols are out of scope: callers plug in an [`Executor`].

pub mod config;
pub mod db;
pub mod executor;
pub mod polling;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use config::{DispatcherConfig, Message, RequestConfig, Role, ValidationSpec};
pub use db::{DatabaseConnection, DatabaseError, StatusUpdate, TaskStore};
pub use executor::{
    AttemptObserver, Executor, ExecutorError, NoopObserver, Outcome, RetryOrchestrator,
    RetryPolicy,
};
pub use polling::{PollingManager, TaskSnapshot};
pub use validation::{
    Completion, StrategyInfo, ValidationContext, ValidationResult, Validator, ValidatorRegistry,
};

/// Errors surfaced by the dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Submission is missing required fields or carries invalid values
    #[error("Invalid task configuration: {0}")]
    InvalidConfig(String),

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// `wait` gave up before the task reached a terminal state
    #[error("Timed out after {waited:?} waiting for task {task_id}")]
    Timeout { task_id: String, waited: Duration },

    /// Task ended as Failed or TimedOut
    #[error("Task {task_id} failed: {error}")]
    TaskFailed { task_id: String, error: String },

    /// Task ended as Failed after reaching its escalation threshold
    #[error("Task {task_id} needs human review: {reason}")]
    NeedsHumanReview { task_id: String, reason: String },

    /// Task was cancelled by a caller
    #[error("Task {0} was cancelled")]
    TaskCancelled(String),

    /// No validator registered under this name
    #[error("Validator not found: {0}")]
    ValidatorNotFound(String),

    /// Manager no longer accepts work
    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    /// Dispatcher configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error(transparent)]
    Storage(#[from] DatabaseError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, waiting for a worker
    Pending,
    /// Picked up by a worker
    Running,
    /// Validators passed
    Completed,
    /// Attempts exhausted, escalated, or orphaned
    Failed,
    /// Wall-clock deadline hit
    TimedOut,
    /// Cancelled by a caller
    Cancelled,
}

impl TaskStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::TimedOut,
        TaskStatus::Cancelled,
    ];

    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the storage representation
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }

    /// Whether no further transition can occur
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    /// Whether `self -> next` is an edge of the lifecycle.
    ///
    /// `Pending -> Failed` exists only for orphan recovery after a restart.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
        )
    }

    /// Statuses from which `next` may be entered
    pub fn predecessors(next: TaskStatus) -> Vec<TaskStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "Pending"),
            TaskStatus::Running => write!(f, "Running"),
            TaskStatus::Completed => write!(f, "Completed"),
            TaskStatus::Failed => write!(f, "Failed"),
            TaskStatus::TimedOut => write!(f, "TimedOut"),
            TaskStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Get version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_storage_names() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("paused"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::TimedOut.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        for from in TaskStatus::ALL.into_iter().filter(TaskStatus::is_terminal) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {} must be rejected", from, to);
            }
        }
    }

    #[test]
    fn test_lifecycle_edges() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::TimedOut));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_predecessors() {
        assert_eq!(
            TaskStatus::predecessors(TaskStatus::Cancelled),
            vec![TaskStatus::Pending, TaskStatus::Running]
        );
        assert_eq!(TaskStatus::predecessors(TaskStatus::Completed), vec![TaskStatus::Running]);
        assert!(TaskStatus::predecessors(TaskStatus::Pending).is_empty());
    }

    #[test]
    fn test_version() {
        let v = version();
        assert!(!v.is_empty());
    }
}
