//! Configuration types
//!
//! - [`settings`]: process-wide dispatcher configuration
//! - [`request`]: per-task submission schema

pub mod request;
pub mod settings;

pub use request::{Message, RequestConfig, Role, ValidationSpec};
pub use settings::{
    DatabaseConfig, DefaultsConfig, DispatcherConfig, RetentionConfig, WorkerConfig,
};
