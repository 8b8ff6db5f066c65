//! Retry loop with validation feedback
//!
//! Each attempt calls the executor and runs the response through the
//! validator chain. A rejected response is appended to the conversation
//! together with a feedback message built from the validator's verdict, so
//! the next attempt sees why the previous one failed. Executor errors consume
//! an attempt the same way but add nothing to the conversation.

use super::retry::RetryDecision;
use super::{Executor, ExecutorError};
use crate::config::{Message, RequestConfig};
use crate::validation::{run_chain, ChainVerdict, Completion, ValidationContext, ValidationResult, Validator};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Terminal result of one orchestrated request
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Validators accepted a response
    Success { completion: Completion, attempts: u32 },
    /// Attempt budget exhausted; carries the last failure
    Failure { error: String, attempts: u32 },
    /// Escalation threshold reached; carries the last failure
    NeedsHumanReview { reason: String, attempts: u32 },
    /// Wall-clock deadline hit before a terminal verdict
    TimedOut { attempts: u32 },
    /// Cancellation token fired
    Cancelled { attempts: u32 },
}

impl Outcome {
    /// Attempts started before the outcome was reached
    pub fn attempts(&self) -> u32 {
        match self {
            Outcome::Success { attempts, .. }
            | Outcome::Failure { attempts, .. }
            | Outcome::NeedsHumanReview { attempts, .. }
            | Outcome::TimedOut { attempts }
            | Outcome::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

/// Hook called by the orchestrator before each attempt
#[async_trait]
pub trait AttemptObserver: Send + Sync {
    /// Attempt `attempt` (1-based) is about to call the executor
    async fn attempt_started(&self, _attempt: u32, _max_attempts: u32) {}
}

/// Observer that ignores every event
pub struct NoopObserver;

#[async_trait]
impl AttemptObserver for NoopObserver {}

/// Drives one request through the validate-and-retry protocol
pub struct RetryOrchestrator {
    executor: Arc<dyn Executor>,
    validators: Vec<Arc<dyn Validator>>,
    task_id: Option<String>,
}

impl RetryOrchestrator {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            validators: Vec::new(),
            task_id: None,
        }
    }

    /// Set the validator chain, run in order
    pub fn with_validators(mut self, validators: Vec<Arc<dyn Validator>>) -> Self {
        self.validators = validators;
        self
    }

    /// Task id reported to validators and logs
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Run `request` to a terminal outcome
    ///
    /// The request's deadline, if any, bounds the whole loop including
    /// backoff sleeps; an in-flight executor call is abandoned when it fires.
    pub async fn run(
        &self,
        request: &RequestConfig,
        observer: &dyn AttemptObserver,
        cancel: &CancellationToken,
    ) -> Outcome {
        let started = AtomicU32::new(0);

        match request.deadline() {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.attempt_loop(request, observer, cancel, &started))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let attempts = started.load(Ordering::SeqCst);
                        warn!(
                            task_id = self.task_id.as_deref().unwrap_or("-"),
                            attempts,
                            deadline_ms = deadline.as_millis() as u64,
                            "Task deadline reached"
                        );
                        Outcome::TimedOut { attempts }
                    }
                }
            }
            None => self.attempt_loop(request, observer, cancel, &started).await,
        }
    }

    async fn attempt_loop(
        &self,
        request: &RequestConfig,
        observer: &dyn AttemptObserver,
        cancel: &CancellationToken,
        started: &AtomicU32,
    ) -> Outcome {
        let task_id = self.task_id.as_deref().unwrap_or("-");
        let policy = request.retry_policy();
        let params = request.executor_params();
        let mut conversation = request.messages.clone();
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Outcome::Cancelled { attempts: attempt - 1 };
            }

            started.store(attempt, Ordering::SeqCst);
            observer.attempt_started(attempt, policy.max_attempts).await;
            debug!(task_id, attempt, max_attempts = policy.max_attempts, "Starting attempt");

            let call = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled { attempts: attempt },
                result = self.executor.complete(&conversation, &params, cancel) => result,
            };

            // Turns appended to the conversation if another attempt follows
            let mut feedback: Vec<Message> = Vec::new();

            let reason = match call {
                Ok(completion) => {
                    let ctx = ValidationContext {
                        task_id: self.task_id.clone(),
                        model: request.model.clone(),
                        attempt,
                        max_attempts: policy.max_attempts,
                        params: params.clone(),
                    };

                    match run_chain(&self.validators, &completion, &ctx).await {
                        ChainVerdict::Passed => {
                            info!(task_id, attempt, "Response accepted");
                            return Outcome::Success {
                                completion,
                                attempts: attempt,
                            };
                        }
                        ChainVerdict::Rejected { validator, result } => {
                            let reason = rejection_reason(&validator, &result);
                            feedback.push(Message::assistant(completion.content));
                            feedback.push(feedback_message(&validator, &result));
                            reason
                        }
                    }
                }
                Err(ExecutorError::Cancelled) => return Outcome::Cancelled { attempts: attempt },
                Err(e) => format!("Executor error: {}", e),
            };

            warn!(task_id, attempt, reason = %reason, "Attempt failed");

            match policy.decide(attempt) {
                RetryDecision::Retry(delay) => {
                    conversation.extend(feedback);
                    debug!(task_id, attempt, delay_ms = delay.as_millis() as u64, "Backing off");

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Outcome::Cancelled { attempts: attempt },
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                RetryDecision::Escalate => {
                    warn!(task_id, attempt, "Escalation threshold reached");
                    return Outcome::NeedsHumanReview {
                        reason,
                        attempts: attempt,
                    };
                }
                RetryDecision::GiveUp => {
                    warn!(task_id, attempts = attempt, "Attempts exhausted");
                    return Outcome::Failure {
                        error: reason,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

fn rejection_reason(validator: &str, result: &ValidationResult) -> String {
    match &result.error {
        Some(error) => format!("Validation failed ({}): {}", validator, error),
        None => format!("Validation failed ({})", validator),
    }
}

/// User turn telling the model why its last answer was rejected
pub fn feedback_message(validator: &str, result: &ValidationResult) -> Message {
    let mut text = format!(
        "Your previous response failed validation ({}): {}",
        validator,
        result.error.as_deref().unwrap_or("no reason given")
    );

    if !result.suggestions.is_empty() {
        text.push_str("\n\nSuggestions:");
        for suggestion in &result.suggestions {
            text.push_str("\n- ");
            text.push_str(suggestion);
        }
    }

    text.push_str("\n\nPlease try again.");
    Message::user(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::executor::RetryPolicy;
    use serde_json::{Map, Value};
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Returns scripted responses in order, repeating the last one
    struct ScriptedExecutor {
        responses: Vec<Result<Completion, ExecutorError>>,
        calls: Arc<Mutex<Vec<Vec<Message>>>>,
    }

    impl ScriptedExecutor {
        fn new(responses: Vec<Result<Completion, ExecutorError>>) -> Self {
            Self {
                responses,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn complete(
            &self,
            conversation: &[Message],
            _params: &Map<String, Value>,
            _cancel: &CancellationToken,
        ) -> Result<Completion, ExecutorError> {
            let mut calls = self.calls.lock().await;
            let index = calls.len().min(self.responses.len() - 1);
            calls.push(conversation.to_vec());
            self.responses[index].clone()
        }
    }

    struct Reject;

    #[async_trait]
    impl Validator for Reject {
        fn name(&self) -> &str {
            "reject"
        }

        async fn validate(&self, _: &Completion, _: &ValidationContext) -> ValidationResult {
            ValidationResult::fail("not good enough").with_suggestion("be better")
        }
    }

    fn request(policy: RetryPolicy) -> RequestConfig {
        RequestConfig::new("m", vec![Message::user("2+2?")])
            .with_retry(policy.with_initial_delay(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let executor = Arc::new(ScriptedExecutor::new(vec![Ok(Completion::new("4"))]));
        let orchestrator = RetryOrchestrator::new(executor.clone());

        let outcome = orchestrator
            .run(&request(RetryPolicy::new(3)), &NoopObserver, &CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            Outcome::Success {
                completion: Completion::new("4"),
                attempts: 1
            }
        );
        assert_eq!(executor.calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_executor_errors_consume_attempts_without_feedback() {
        let executor = Arc::new(ScriptedExecutor::new(vec![
            Err(ExecutorError::Transport("connection reset".into())),
            Ok(Completion::new("4")),
        ]));
        let orchestrator = RetryOrchestrator::new(executor.clone());

        let outcome = orchestrator
            .run(&request(RetryPolicy::new(3)), &NoopObserver, &CancellationToken::new())
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 2);

        let calls = executor.calls.lock().await;
        assert_eq!(calls[1], calls[0]);
    }

    #[tokio::test]
    async fn test_rejections_append_feedback_in_order() {
        let executor = Arc::new(ScriptedExecutor::new(vec![
            Ok(Completion::new("first")),
            Ok(Completion::new("second")),
        ]));
        let orchestrator = RetryOrchestrator::new(executor.clone()).with_validators(vec![Arc::new(Reject)]);

        let outcome = orchestrator
            .run(&request(RetryPolicy::new(3)), &NoopObserver, &CancellationToken::new())
            .await;

        match outcome {
            Outcome::Failure { error, attempts } => {
                assert_eq!(attempts, 3);
                assert!(error.contains("not good enough"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let calls = executor.calls.lock().await;
        assert_eq!(calls[0].len(), 1);
        assert_eq!(calls[1].len(), 3);
        assert_eq!(calls[2].len(), 5);

        // History is only ever extended
        assert_eq!(&calls[2][..3], &calls[1][..]);
        assert_eq!(calls[1][1], Message::assistant("first"));
        assert_eq!(calls[1][2].role, Role::User);
        assert!(calls[1][2].content.contains("reject"));
        assert!(calls[1][2].content.contains("- be better"));
        assert_eq!(calls[2][3], Message::assistant("second"));
    }

    #[tokio::test]
    async fn test_escalation_is_returned_not_raised() {
        let executor = Arc::new(ScriptedExecutor::new(vec![Ok(Completion::new("x"))]));
        let orchestrator = RetryOrchestrator::new(executor.clone()).with_validators(vec![Arc::new(Reject)]);

        let outcome = orchestrator
            .run(
                &request(RetryPolicy::new(4).with_escalation_after(2)),
                &NoopObserver,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(outcome, Outcome::NeedsHumanReview { attempts: 2, ref reason } if reason.contains("not good enough")));
        assert_eq!(executor.calls.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let executor = Arc::new(ScriptedExecutor::new(vec![Ok(Completion::new("4"))]));
        let orchestrator = RetryOrchestrator::new(executor.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = orchestrator.run(&request(RetryPolicy::new(3)), &NoopObserver, &cancel).await;

        assert_eq!(outcome, Outcome::Cancelled { attempts: 0 });
        assert!(executor.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_executor_reported_cancellation() {
        let executor = Arc::new(ScriptedExecutor::new(vec![Err(ExecutorError::Cancelled)]));
        let orchestrator = RetryOrchestrator::new(executor);

        let outcome = orchestrator
            .run(&request(RetryPolicy::new(3)), &NoopObserver, &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Cancelled { attempts: 1 });
    }

    #[test]
    fn test_feedback_message_without_suggestions() {
        let message = feedback_message("length", &ValidationResult::fail("too long"));
        assert_eq!(message.role, Role::User);
        assert_eq!(
            message.content,
            "Your previous response failed validation (length): too long\n\nPlease try again."
        );
    }
}
