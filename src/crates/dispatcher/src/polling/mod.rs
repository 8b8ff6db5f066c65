//! Background task execution and polling

pub mod manager;
pub mod snapshot;

pub use manager::PollingManager;
pub use snapshot::TaskSnapshot;
