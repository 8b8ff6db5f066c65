//! Task repository for database operations
//!
//! Every mutating statement is a single SQL statement, so each one is atomic
//! on its own. Status changes are guarded by the `WHERE status IN (...)`
//! clause: two writers racing on the same row serialize in SQLite and the
//! loser sees zero rows affected.

use crate::db::connection::DatabasePool;
use crate::db::error::{DatabaseError, DbResult};
use crate::db::models::TaskRecord;

/// Column values written by a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionColumns<'a> {
    /// New status (storage name)
    pub status: &'a str,
    /// Timestamp of the change
    pub now: &'a str,
    /// Set `started_at` if still unset
    pub mark_started: bool,
    /// Set `completed_at` if still unset
    pub mark_completed: bool,
    /// Result JSON to store
    pub result: Option<&'a str>,
    /// Error text to store
    pub error: Option<&'a str>,
    /// Flag the failure for review
    pub needs_review: bool,
    /// Progress override
    pub progress: Option<i64>,
}

/// Task repository for managing task database operations
pub struct TaskRepository;

impl TaskRepository {
    /// Insert a new task row
    ///
    /// # Returns
    /// The stored row, or `DuplicateId` if the id is taken
    pub async fn create(pool: &DatabasePool, task: &TaskRecord) -> DbResult<TaskRecord> {
        sqlx::query_as::<_, TaskRecord>(
            "INSERT INTO tasks (id, status, config, result, error, needs_review, progress, attempts,
                                created_at, updated_at, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(&task.id)
        .bind(&task.status)
        .bind(&task.config)
        .bind(&task.result)
        .bind(&task.error)
        .bind(task.needs_review)
        .bind(task.progress)
        .bind(task.attempts)
        .bind(&task.created_at)
        .bind(&task.updated_at)
        .bind(&task.started_at)
        .bind(&task.completed_at)
        .fetch_one(pool)
        .await
        .map_err(|e| match DatabaseError::from(e) {
            DatabaseError::ConstraintViolation(msg) if msg.contains("UNIQUE") => {
                DatabaseError::DuplicateId(task.id.clone())
            }
            other => other,
        })
    }

    /// Get a task by ID
    pub async fn get_by_id(pool: &DatabasePool, id: &str) -> DbResult<Option<TaskRecord>> {
        let task = sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(task)
    }

    /// List tasks whose status is one of `statuses`, oldest first
    pub async fn list_by_statuses(
        pool: &DatabasePool,
        statuses: &[&str],
    ) -> DbResult<Vec<TaskRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT * FROM tasks WHERE status IN ({}) ORDER BY created_at ASC",
            placeholders(statuses.len())
        );
        let mut query = sqlx::query_as::<_, TaskRecord>(&sql);
        for status in statuses {
            query = query.bind(*status);
        }

        Ok(query.fetch_all(pool).await?)
    }

    /// Move a task to a new status if its current status is in `from`
    ///
    /// # Returns
    /// The updated row, or `None` if the row is missing or its status did
    /// not match
    pub async fn transition(
        pool: &DatabasePool,
        id: &str,
        from: &[&str],
        columns: &TransitionColumns<'_>,
    ) -> DbResult<Option<TaskRecord>> {
        if from.is_empty() {
            return Ok(None);
        }

        let sql = format!(
            "UPDATE tasks SET
                 status = ?,
                 updated_at = ?,
                 started_at = CASE WHEN ? THEN COALESCE(started_at, ?) ELSE started_at END,
                 completed_at = CASE WHEN ? THEN COALESCE(completed_at, ?) ELSE completed_at END,
                 result = COALESCE(?, result),
                 error = COALESCE(?, error),
                 needs_review = MAX(needs_review, ?),
                 progress = COALESCE(?, progress)
             WHERE id = ? AND status IN ({})
             RETURNING *",
            placeholders(from.len())
        );

        let mut query = sqlx::query_as::<_, TaskRecord>(&sql)
            .bind(columns.status)
            .bind(columns.now)
            .bind(columns.mark_started)
            .bind(columns.now)
            .bind(columns.mark_completed)
            .bind(columns.now)
            .bind(columns.result)
            .bind(columns.error)
            .bind(columns.needs_review)
            .bind(columns.progress)
            .bind(id);
        for status in from {
            query = query.bind(*status);
        }

        Ok(query.fetch_optional(pool).await?)
    }

    /// Record attempt count and progress for a running task
    ///
    /// # Returns
    /// Whether a running task was updated
    pub async fn update_progress(
        pool: &DatabasePool,
        id: &str,
        attempts: i64,
        progress: i64,
        now: &str,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET attempts = ?, progress = ?, updated_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(attempts)
        .bind(progress)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete terminal tasks that completed before `cutoff`
    ///
    /// # Returns
    /// Number of deleted rows
    pub async fn delete_completed_before(
        pool: &DatabasePool,
        cutoff: &str,
        terminal: &[&str],
    ) -> DbResult<u64> {
        if terminal.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "DELETE FROM tasks
             WHERE completed_at IS NOT NULL AND completed_at < ? AND status IN ({})",
            placeholders(terminal.len())
        );
        let mut query = sqlx::query(&sql).bind(cutoff);
        for status in terminal {
            query = query.bind(*status);
        }

        Ok(query.execute(pool).await?.rows_affected())
    }

    /// Delete a task
    pub async fn delete(pool: &DatabasePool, id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count total tasks
    pub async fn count(pool: &DatabasePool) -> DbResult<i64> {
        let result: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(pool)
            .await?;

        Ok(result.0)
    }

    /// Count tasks by status
    pub async fn count_by_status(pool: &DatabasePool, status: &str) -> DbResult<i64> {
        let result: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = ?")
            .bind(status)
            .fetch_one(pool)
            .await?;

        Ok(result.0)
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseConnection;

    async fn setup() -> DatabaseConnection {
        DatabaseConnection::in_memory().await.unwrap()
    }

    fn columns<'a>(status: &'a str, now: &'a str) -> TransitionColumns<'a> {
        TransitionColumns {
            status,
            now,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_task() {
        let conn = setup().await;

        let task = TaskRepository::create(conn.pool(), &TaskRecord::new("task-1", "{}"))
            .await
            .unwrap();

        assert_eq!(task.id, "task-1");
        assert_eq!(task.status, "pending");
        assert_eq!(task.config, "{}");
    }

    #[tokio::test]
    async fn test_create_duplicate_id() {
        let conn = setup().await;
        let record = TaskRecord::new("task-1", "{}");

        TaskRepository::create(conn.pool(), &record).await.unwrap();
        let err = TaskRepository::create(conn.pool(), &record).await.unwrap_err();

        assert!(matches!(err, DatabaseError::DuplicateId(id) if id == "task-1"));
    }

    #[tokio::test]
    async fn test_get_by_id() {
        let conn = setup().await;
        let created = TaskRepository::create(conn.pool(), &TaskRecord::new("task-1", "{}"))
            .await
            .unwrap();

        let fetched = TaskRepository::get_by_id(conn.pool(), "task-1").await.unwrap();
        assert_eq!(fetched, Some(created));

        let missing = TaskRepository::get_by_id(conn.pool(), "task-2").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_transition_guard() {
        let conn = setup().await;
        TaskRepository::create(conn.pool(), &TaskRecord::new("task-1", "{}"))
            .await
            .unwrap();

        let now = "2025-01-01T00:00:00.000000Z";
        let mut running = columns("running", now);
        running.mark_started = true;

        let updated = TaskRepository::transition(conn.pool(), "task-1", &["pending"], &running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, "running");
        assert_eq!(updated.started_at.as_deref(), Some(now));

        // Second pickup loses the race
        let again = TaskRepository::transition(conn.pool(), "task-1", &["pending"], &running)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_list_by_statuses() {
        let conn = setup().await;
        for id in ["task-1", "task-2", "task-3"] {
            TaskRepository::create(conn.pool(), &TaskRecord::new(id, "{}"))
                .await
                .unwrap();
        }

        let now = "2025-01-01T00:00:00.000000Z";
        TaskRepository::transition(conn.pool(), "task-2", &["pending"], &columns("running", now))
            .await
            .unwrap();

        let active = TaskRepository::list_by_statuses(conn.pool(), &["pending", "running"])
            .await
            .unwrap();
        assert_eq!(active.len(), 3);

        let running = TaskRepository::list_by_statuses(conn.pool(), &["running"])
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "task-2");

        assert!(TaskRepository::list_by_statuses(conn.pool(), &[])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_progress_requires_running() {
        let conn = setup().await;
        TaskRepository::create(conn.pool(), &TaskRecord::new("task-1", "{}"))
            .await
            .unwrap();

        let now = "2025-01-01T00:00:00.000000Z";
        assert!(!TaskRepository::update_progress(conn.pool(), "task-1", 1, 50, now)
            .await
            .unwrap());

        TaskRepository::transition(conn.pool(), "task-1", &["pending"], &columns("running", now))
            .await
            .unwrap();
        assert!(TaskRepository::update_progress(conn.pool(), "task-1", 1, 50, now)
            .await
            .unwrap());

        let task = TaskRepository::get_by_id(conn.pool(), "task-1").await.unwrap().unwrap();
        assert_eq!(task.attempts, 1);
        assert_eq!(task.progress, 50);
    }

    #[tokio::test]
    async fn test_delete_task() {
        let conn = setup().await;
        TaskRepository::create(conn.pool(), &TaskRecord::new("task-1", "{}"))
            .await
            .unwrap();

        assert!(TaskRepository::delete(conn.pool(), "task-1").await.unwrap());
        assert!(!TaskRepository::delete(conn.pool(), "task-1").await.unwrap());
        assert!(TaskRepository::get_by_id(conn.pool(), "task-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_count_tasks() {
        let conn = setup().await;
        TaskRepository::create(conn.pool(), &TaskRecord::new("task-1", "{}"))
            .await
            .unwrap();
        TaskRepository::create(conn.pool(), &TaskRecord::new("task-2", "{}"))
            .await
            .unwrap();

        assert_eq!(TaskRepository::count(conn.pool()).await.unwrap(), 2);
        assert_eq!(
            TaskRepository::count_by_status(conn.pool(), "pending").await.unwrap(),
            2
        );
        assert_eq!(
            TaskRepository::count_by_status(conn.pool(), "running").await.unwrap(),
            0
        );
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }
}
