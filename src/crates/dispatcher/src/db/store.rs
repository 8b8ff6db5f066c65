//! Typed task store
//!
//! Wraps [`TaskRepository`] with lifecycle checks: status changes are only
//! accepted along the edges of the task state machine, and the columns a
//! transition may write depend on the target status.

use crate::db::connection::{DatabaseConnection, PoolStatistics};
use crate::db::error::{DatabaseError, DbResult};
use crate::db::models::{timestamp, TaskRecord};
use crate::db::repositories::{TaskRepository, TransitionColumns};
use crate::executor::retry::{retry_storage, storage_policy};
use crate::TaskStatus;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Fields written alongside a status change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    /// Successful response, only for `Completed`
    pub result: Option<Value>,
    /// Failure description, only for `Failed` / `TimedOut`
    pub error: Option<String>,
    /// Mark a `Failed` task as escalated
    pub needs_review: bool,
}

impl StatusUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn completed(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn escalated(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            needs_review: true,
            ..Default::default()
        }
    }

    /// Reject column combinations that cannot belong to `status`
    fn check(&self, status: TaskStatus) -> DbResult<()> {
        let wants_result = status == TaskStatus::Completed;
        let wants_error = matches!(status, TaskStatus::Failed | TaskStatus::TimedOut);

        if self.result.is_some() != wants_result {
            return Err(DatabaseError::constraint(format!(
                "result must be set exactly when completing, got status {}",
                status
            )));
        }
        if self.error.is_some() != wants_error {
            return Err(DatabaseError::constraint(format!(
                "error must be set exactly when failing or timing out, got status {}",
                status
            )));
        }
        if self.needs_review && status != TaskStatus::Failed {
            return Err(DatabaseError::constraint(
                "needs_review only applies to failed tasks",
            ));
        }
        Ok(())
    }
}

/// Durable task records
///
/// Cheap to clone; every clone shares the same connection pool.
#[derive(Clone)]
pub struct TaskStore {
    conn: DatabaseConnection,
}

impl TaskStore {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    /// Open the database at `url`, applying migrations
    pub async fn open(url: &str, max_connections: u32) -> DbResult<Self> {
        let conn = DatabaseConnection::with_max_connections(url, max_connections).await?;
        conn.run_migrations().await?;
        Ok(Self::new(conn))
    }

    /// Private in-memory store
    pub async fn in_memory() -> DbResult<Self> {
        Ok(Self::new(DatabaseConnection::in_memory().await?))
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Insert a new pending task
    ///
    /// # Returns
    /// The task id, or `DuplicateId` if it already exists
    pub async fn create(&self, record: &TaskRecord) -> DbResult<String> {
        if record.task_status() != Some(TaskStatus::Pending) {
            return Err(DatabaseError::constraint(format!(
                "new tasks must be pending, got '{}'",
                record.status
            )));
        }

        let created = retry_storage(&storage_policy(), "create_task", || {
            TaskRepository::create(self.conn.pool(), record)
        })
        .await?;

        debug!(task_id = %created.id, "Task created");
        Ok(created.id)
    }

    /// Fetch a task
    pub async fn get(&self, id: &str) -> DbResult<TaskRecord> {
        TaskRepository::get_by_id(self.conn.pool(), id)
            .await?
            .ok_or_else(|| DatabaseError::not_found(format!("task {}", id)))
    }

    /// Move a task to `status`, writing the columns in `update`
    ///
    /// The check and the write happen in one statement, so two callers
    /// racing to finish the same task cannot both succeed.
    ///
    /// # Errors
    /// * `NotFound` if the task does not exist
    /// * `InvalidTransition` if the current status has no edge to `status`
    /// * `ConstraintViolation` if `update` does not fit `status`
    pub async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        update: StatusUpdate,
    ) -> DbResult<TaskRecord> {
        update.check(status)?;

        let now = timestamp(Utc::now());
        let result_json = update.result.as_ref().map(Value::to_string);
        let columns = TransitionColumns {
            status: status.as_str(),
            now: &now,
            mark_started: status == TaskStatus::Running,
            mark_completed: status.is_terminal(),
            result: result_json.as_deref(),
            error: update.error.as_deref(),
            needs_review: update.needs_review,
            progress: (status == TaskStatus::Completed).then_some(100),
        };
        let from: Vec<&str> = TaskStatus::predecessors(status)
            .into_iter()
            .map(|s| s.as_str())
            .collect();

        let updated = retry_storage(&storage_policy(), "update_task_status", || {
            TaskRepository::transition(self.conn.pool(), id, &from, &columns)
        })
        .await?;

        match updated {
            Some(record) => {
                info!(task_id = %id, status = %status, "Task status updated");
                Ok(record)
            }
            None => {
                let current = self.get(id).await?;
                Err(DatabaseError::InvalidTransition {
                    id: id.to_string(),
                    from: current.status,
                    to: status.as_str().to_string(),
                })
            }
        }
    }

    /// Record attempt count and progress on a running task
    ///
    /// # Returns
    /// `false` if the task is no longer running
    pub async fn update_progress(&self, id: &str, attempts: u32, progress: u8) -> DbResult<bool> {
        let now = timestamp(Utc::now());
        retry_storage(&storage_policy(), "update_task_progress", || {
            TaskRepository::update_progress(
                self.conn.pool(),
                id,
                i64::from(attempts),
                i64::from(progress.min(100)),
                &now,
            )
        })
        .await
    }

    /// All Pending and Running tasks, oldest first
    pub async fn list_active(&self) -> DbResult<Vec<TaskRecord>> {
        TaskRepository::list_by_statuses(
            self.conn.pool(),
            &[TaskStatus::Pending.as_str(), TaskStatus::Running.as_str()],
        )
        .await
    }

    /// All tasks in the given status, oldest first
    pub async fn list_by_status(&self, status: TaskStatus) -> DbResult<Vec<TaskRecord>> {
        TaskRepository::list_by_statuses(self.conn.pool(), &[status.as_str()]).await
    }

    /// Delete terminal tasks that completed more than `age` ago
    ///
    /// # Returns
    /// Number of deleted tasks
    pub async fn delete_older_than(&self, age: Duration) -> DbResult<u64> {
        let age = chrono::Duration::from_std(age)
            .map_err(|e| DatabaseError::Query(format!("retention window: {}", e)))?;
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .map(timestamp)
            .ok_or_else(|| DatabaseError::Query("retention window out of range".to_string()))?;

        let terminal: Vec<&str> = TaskStatus::ALL
            .into_iter()
            .filter(TaskStatus::is_terminal)
            .map(|s| s.as_str())
            .collect();

        let deleted =
            TaskRepository::delete_completed_before(self.conn.pool(), &cutoff, &terminal).await?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Deleted expired terminal tasks");
        }
        Ok(deleted)
    }

    pub async fn count(&self) -> DbResult<i64> {
        TaskRepository::count(self.conn.pool()).await
    }

    /// Task count per status; statuses with no tasks map to 0
    pub async fn count_by_status(&self) -> DbResult<HashMap<TaskStatus, i64>> {
        let mut counts = HashMap::new();
        for status in TaskStatus::ALL {
            let n = TaskRepository::count_by_status(self.conn.pool(), status.as_str()).await?;
            counts.insert(status, n);
        }
        Ok(counts)
    }

    pub async fn health_check(&self) -> DbResult<()> {
        self.conn.health_check().await
    }

    pub fn pool_statistics(&self) -> PoolStatistics {
        self.conn.get_pool_statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with_task(id: &str) -> TaskStore {
        let store = TaskStore::in_memory().await.unwrap();
        store.create(&TaskRecord::new(id, "{}")).await.unwrap();
        store
    }

    #[test]
    fn test_status_update_shapes() {
        assert!(StatusUpdate::none().check(TaskStatus::Running).is_ok());
        assert!(StatusUpdate::none().check(TaskStatus::Cancelled).is_ok());
        assert!(StatusUpdate::completed(json!("4")).check(TaskStatus::Completed).is_ok());
        assert!(StatusUpdate::failed("boom").check(TaskStatus::TimedOut).is_ok());
        assert!(StatusUpdate::escalated("stuck").check(TaskStatus::Failed).is_ok());

        assert!(StatusUpdate::none().check(TaskStatus::Completed).is_err());
        assert!(StatusUpdate::none().check(TaskStatus::Failed).is_err());
        assert!(StatusUpdate::failed("boom").check(TaskStatus::Cancelled).is_err());
        assert!(StatusUpdate::completed(json!(1)).check(TaskStatus::Failed).is_err());

        let mut timed_out = StatusUpdate::escalated("late");
        assert!(timed_out.check(TaskStatus::TimedOut).is_err());
        timed_out.needs_review = false;
        assert!(timed_out.check(TaskStatus::TimedOut).is_ok());
    }

    #[tokio::test]
    async fn test_create_rejects_non_pending() {
        let store = TaskStore::in_memory().await.unwrap();
        let mut record = TaskRecord::new("task-1", "{}");
        record.status = "running".to_string();

        let err = store.create(&record).await.unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[tokio::test]
    async fn test_full_lifecycle_sets_timestamps_once() {
        let store = store_with_task("task-1").await;

        let running = store
            .update_status("task-1", TaskStatus::Running, StatusUpdate::none())
            .await
            .unwrap();
        assert_eq!(running.task_status(), Some(TaskStatus::Running));
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        let done = store
            .update_status("task-1", TaskStatus::Completed, StatusUpdate::completed(json!({"content": "4"})))
            .await
            .unwrap();
        assert_eq!(done.started_at, running.started_at);
        assert!(done.completed_at.is_some());
        assert_eq!(done.progress, 100);
        assert!(done.error.is_none());
        assert!(done.created_at <= done.started_at.clone().unwrap());
        assert!(done.started_at.clone().unwrap() <= done.completed_at.clone().unwrap());
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let store = store_with_task("task-1").await;
        store
            .update_status("task-1", TaskStatus::Cancelled, StatusUpdate::none())
            .await
            .unwrap();

        let err = store
            .update_status("task-1", TaskStatus::Running, StatusUpdate::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::InvalidTransition { ref from, ref to, .. } if from == "cancelled" && to == "running"
        ));

        let task = store.get("task-1").await.unwrap();
        assert_eq!(task.task_status(), Some(TaskStatus::Cancelled));
        assert!(task.result.is_none());
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn test_update_missing_task() {
        let store = TaskStore::in_memory().await.unwrap();
        let err = store
            .update_status("ghost", TaskStatus::Running, StatusUpdate::none())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_escalation_flag_persists() {
        let store = store_with_task("task-1").await;
        store
            .update_status("task-1", TaskStatus::Running, StatusUpdate::none())
            .await
            .unwrap();
        let failed = store
            .update_status("task-1", TaskStatus::Failed, StatusUpdate::escalated("still invalid"))
            .await
            .unwrap();

        assert!(failed.needs_review);
        assert_eq!(failed.error.as_deref(), Some("still invalid"));
    }

    #[tokio::test]
    async fn test_progress_only_while_running() {
        let store = store_with_task("task-1").await;
        assert!(!store.update_progress("task-1", 1, 33).await.unwrap());

        store
            .update_status("task-1", TaskStatus::Running, StatusUpdate::none())
            .await
            .unwrap();
        assert!(store.update_progress("task-1", 1, 33).await.unwrap());

        let task = store.get("task-1").await.unwrap();
        assert_eq!(task.attempts, 1);
        assert_eq!(task.progress, 33);
    }

    #[tokio::test]
    async fn test_list_active_and_counts() {
        let store = TaskStore::in_memory().await.unwrap();
        for id in ["a", "b", "c"] {
            store.create(&TaskRecord::new(id, "{}")).await.unwrap();
        }
        store
            .update_status("b", TaskStatus::Running, StatusUpdate::none())
            .await
            .unwrap();
        store
            .update_status("c", TaskStatus::Cancelled, StatusUpdate::none())
            .await
            .unwrap();

        let active: Vec<String> = store.list_active().await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&"a".to_string()));
        assert!(active.contains(&"b".to_string()));

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts[&TaskStatus::Pending], 1);
        assert_eq!(counts[&TaskStatus::Running], 1);
        assert_eq!(counts[&TaskStatus::Cancelled], 1);
        assert_eq!(counts[&TaskStatus::Completed], 0);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_older_than_keeps_active_and_recent() {
        let store = TaskStore::in_memory().await.unwrap();
        for id in ["done", "active"] {
            store.create(&TaskRecord::new(id, "{}")).await.unwrap();
        }
        store
            .update_status("done", TaskStatus::Cancelled, StatusUpdate::none())
            .await
            .unwrap();

        assert_eq!(store.delete_older_than(Duration::from_secs(3600)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.delete_older_than(Duration::from_millis(5)).await.unwrap(), 1);
        assert!(store.get("done").await.unwrap_err().is_not_found());
        assert!(store.get("active").await.is_ok());
    }

    #[tokio::test]
    async fn test_introspection() {
        let store = TaskStore::in_memory().await.unwrap();
        assert!(store.health_check().await.is_ok());
        assert_eq!(store.pool_statistics().max_connections, 1);
    }
}
