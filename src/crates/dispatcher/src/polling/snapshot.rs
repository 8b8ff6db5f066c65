//! Public view of a stored task

use crate::db::{DatabaseError, TaskRecord};
use crate::{DispatchError, Result, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Point-in-time copy of a task
///
/// Built from the stored row only, so two snapshots of a terminal task are
/// always equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub status: TaskStatus,
    /// Submission as stored, after defaults were applied
    pub config: Value,
    /// Serialized completion, only when completed
    pub result: Option<Value>,
    /// Failure description, only when failed or timed out
    pub error: Option<String>,
    /// Failed because automated retries could not resolve the request
    pub needs_human_review: bool,
    pub progress: u8,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Assistant text of a completed task
    pub fn content(&self) -> Option<&str> {
        self.result.as_ref()?.get("content")?.as_str()
    }
}

impl TryFrom<TaskRecord> for TaskSnapshot {
    type Error = DispatchError;

    fn try_from(record: TaskRecord) -> Result<Self> {
        let id = Uuid::parse_str(&record.id)
            .map_err(|e| DatabaseError::corrupt(format!("task id '{}': {}", record.id, e)))?;
        let status = record.task_status().ok_or_else(|| {
            DatabaseError::corrupt(format!("task {} has unknown status '{}'", record.id, record.status))
        })?;

        Ok(Self {
            id,
            status,
            config: serde_json::from_str(&record.config)?,
            result: record.result.as_deref().map(serde_json::from_str).transpose()?,
            error: record.error,
            needs_human_review: record.needs_review,
            progress: record.progress.clamp(0, 100) as u8,
            attempts: u32::try_from(record.attempts.max(0)).unwrap_or(u32::MAX),
            created_at: parse_timestamp(&record.created_at)?,
            updated_at: parse_timestamp(&record.updated_at)?,
            started_at: record.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: record.completed_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| DatabaseError::corrupt(format!("timestamp '{}': {}", value, e)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_from_completed_record() {
        let id = Uuid::new_v4();
        let mut record = TaskRecord::new(id.to_string(), r#"{"model":"m"}"#);
        record.status = "completed".to_string();
        record.result = Some(r#"{"content":"4"}"#.to_string());
        record.progress = 100;
        record.attempts = 1;
        record.started_at = Some(record.created_at.clone());
        record.completed_at = Some(record.created_at.clone());

        let snapshot = TaskSnapshot::try_from(record).unwrap();
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert_eq!(snapshot.config, json!({"model": "m"}));
        assert_eq!(snapshot.content(), Some("4"));
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.attempts, 1);
        assert!(snapshot.is_terminal());
        assert_eq!(snapshot.started_at, Some(snapshot.created_at));
    }

    #[test]
    fn test_snapshot_rejects_corrupt_rows() {
        let record = TaskRecord::new("not-a-uuid", "{}");
        assert!(matches!(
            TaskSnapshot::try_from(record),
            Err(DispatchError::Storage(DatabaseError::Corrupt(_)))
        ));

        let mut record = TaskRecord::new(Uuid::new_v4().to_string(), "{}");
        record.status = "paused".to_string();
        assert!(TaskSnapshot::try_from(record).is_err());

        let record = TaskRecord::new(Uuid::new_v4().to_string(), "not json");
        assert!(matches!(TaskSnapshot::try_from(record), Err(DispatchError::Serialization(_))));
    }
}
