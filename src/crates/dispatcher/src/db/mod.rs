//! Task persistence
//!
//! SQLite storage for task state. [`TaskStore`] is the typed entry point;
//! [`repositories`] holds the SQL it is built on.

pub mod connection;
pub mod error;
pub mod models;
pub mod repositories;
pub mod store;

pub use connection::{DatabaseConnection, DatabasePool, PoolStatistics};
pub use error::{DatabaseError, DbResult};
pub use models::{timestamp, TaskRecord};
pub use store::{StatusUpdate, TaskStore};
