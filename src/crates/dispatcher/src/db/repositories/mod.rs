//! Raw SQL access to the tasks table

pub mod task_repo;

pub use task_repo::{TaskRepository, TransitionColumns};
