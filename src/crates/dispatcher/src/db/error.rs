//! Storage errors
//!
//! sqlx errors are folded into the few cases callers act on: missing rows,
//! rejected writes, lock contention worth retrying, and everything else.

use thiserror::Error;

/// SQLite primary result codes for lock contention
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A task with this id already exists
    #[error("Duplicate task id: {0}")]
    DuplicateId(String),

    /// Status change not allowed by the task lifecycle
    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// Write rejected by a CHECK or UNIQUE rule, or by the store's own
    /// column rules
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Database locked, busy, or no pooled connection free in time
    #[error("Database busy: {0}")]
    Busy(String),

    /// A stored row could not be turned back into a task
    #[error("Corrupt task data: {0}")]
    Corrupt(String),

    /// Database could not be opened, migrated or reached
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("Query error: {0}")]
    Query(String),
}

impl DatabaseError {
    pub fn not_found(context: impl Into<String>) -> Self {
        DatabaseError::NotFound(context.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        DatabaseError::ConstraintViolation(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        DatabaseError::Corrupt(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DatabaseError::NotFound(_))
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, DatabaseError::ConstraintViolation(_))
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, DatabaseError::InvalidTransition { .. })
    }

    /// Whether retrying the same statement may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, DatabaseError::Busy(_))
    }
}

/// Result type for database operations
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

fn is_lock_contention(code: Option<&str>, message: &str) -> bool {
    // Extended codes (e.g. 517 SQLITE_BUSY_SNAPSHOT) keep the primary code in the low byte
    let primary = code.and_then(|c| c.parse::<i32>().ok()).map(|c| c & 0xff);
    if matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
        return true;
    }
    let message = message.to_lowercase();
    message.contains("database is locked") || message.contains("busy")
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("no matching row".to_string()),
            sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_) => DatabaseError::Corrupt(err.to_string()),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() || db_err.is_check_violation() {
                    DatabaseError::ConstraintViolation(db_err.message().to_string())
                } else if is_lock_contention(db_err.code().as_deref(), db_err.message()) {
                    DatabaseError::Busy(db_err.message().to_string())
                } else {
                    DatabaseError::Query(db_err.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => {
                DatabaseError::Busy("timed out waiting for a pooled connection".to_string())
            }
            sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_)
            | sqlx::Error::Io(_)
            | sqlx::Error::Migrate(_) => DatabaseError::Unavailable(err.to_string()),
            err => DatabaseError::Query(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DatabaseError::Unavailable(format!("migration failed: {}", err))
    }
}
