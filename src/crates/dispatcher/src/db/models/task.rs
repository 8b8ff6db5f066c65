//! Task model for database persistence

use crate::TaskStatus;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Represents a task row in the dispatcher database
///
/// `config` and `result` are opaque JSON documents; the store never looks
/// inside them.
///
/// # Timestamps
/// All timestamp fields are fixed-width RFC 3339 strings (see [`timestamp`])
/// so that string comparison in SQL matches chronological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TaskRecord {
    /// Unique task identifier (UUID string)
    pub id: String,

    /// Storage name of the task status (see [`TaskStatus::as_str`])
    pub status: String,

    /// Submitted request configuration as JSON
    pub config: String,

    /// Successful response as JSON, only when completed
    pub result: Option<String>,

    /// Failure description, only when failed or timed out
    pub error: Option<String>,

    /// Failed because the escalation threshold was reached
    pub needs_review: bool,

    /// Advisory progress, 0-100
    pub progress: i64,

    /// Attempts started so far
    pub attempts: i64,

    /// Creation timestamp
    pub created_at: String,

    /// Last update timestamp
    pub updated_at: String,

    /// Set once when a worker picks the task up
    pub started_at: Option<String>,

    /// Set once when the task reaches a terminal status
    pub completed_at: Option<String>,
}

impl TaskRecord {
    /// Create a pending record for the given id and serialized config
    pub fn new(id: impl Into<String>, config: impl Into<String>) -> Self {
        let now = timestamp(Utc::now());
        Self {
            id: id.into(),
            status: TaskStatus::Pending.as_str().to_string(),
            config: config.into(),
            result: None,
            error: None,
            needs_review: false,
            progress: 0,
            attempts: 0,
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Parsed status, `None` if the stored value is unknown
    pub fn task_status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }

    /// Whether the stored status is terminal
    pub fn is_terminal(&self) -> bool {
        self.task_status().map(|s| s.is_terminal()).unwrap_or(false)
    }
}

/// Format a timestamp the way the store persists it
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
