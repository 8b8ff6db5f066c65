//! Database models

pub mod task;

pub use task::{timestamp, TaskRecord};
