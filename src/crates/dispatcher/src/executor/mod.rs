//! LLM execution with validated retries
//!
//! The [`Executor`] trait is the seam to a model provider. The
//! [`RetryOrchestrator`] drives one request through repeated executor calls
//! until the validator chain accepts a response or the [`RetryPolicy`] says
//! stop.

pub mod orchestrator;
pub mod retry;

pub use orchestrator::{feedback_message, AttemptObserver, NoopObserver, Outcome, RetryOrchestrator};
pub use retry::{retry_storage, RetryDecision, RetryPolicy};

use crate::config::Message;
use crate::validation::Completion;
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors an executor may report for a single call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutorError {
    /// Network or provider failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Provider answered with something that is not a completion
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The call observed the cancellation token and stopped
    #[error("Execution cancelled")]
    Cancelled,
}

/// Performs one LLM call
///
/// Called concurrently for different tasks, never concurrently for the same
/// task. Implementations that can abort early should watch `cancel`.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn complete(
        &self,
        conversation: &[Message],
        params: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Completion, ExecutorError>;
}
