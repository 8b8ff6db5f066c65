//! Retry policy and backoff
//!
//! [`RetryPolicy`] is the per-task attempt budget used by the
//! [`RetryOrchestrator`](super::RetryOrchestrator). [`retry_storage`] applies
//! the same backoff to transient storage failures when persisting task state.

use crate::db::DbResult;
use crate::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Upper bound for any delay or deadline accepted in a submission (30 days)
pub const MAX_DURATION_SECS: f64 = 30.0 * 24.0 * 3600.0;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Sleep, then run the next attempt
    Retry(Duration),
    /// Escalation threshold reached; stop and ask for review
    Escalate,
    /// Attempt budget exhausted
    GiveUp,
}

/// Attempt budget and backoff schedule for one task
///
/// Delays are in seconds. The delay after attempt `k` (1-based) is
/// `min(initial_delay * backoff_factor^(k-1), max_delay)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay after the first failed attempt, in seconds
    pub initial_delay: f64,

    /// Multiplier applied per further attempt
    pub backoff_factor: f64,

    /// Ceiling for any single delay, in seconds
    pub max_delay: f64,

    /// Attempt count at which a failing task is escalated for review
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts_before_escalation: Option<u32>,

    /// Add up to 25% random jitter (still capped by `max_delay`)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: 1.0,
            backoff_factor: 2.0,
            max_delay: 60.0,
            max_attempts_before_escalation: None,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a custom attempt budget
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay.as_secs_f64();
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay.as_secs_f64();
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Escalate once this many attempts have failed
    pub fn with_escalation_after(mut self, attempts: u32) -> Self {
        self.max_attempts_before_escalation = Some(attempts);
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DispatchError::InvalidConfig(
                "retry_config.max_attempts must be at least 1".to_string(),
            ));
        }

        if !(0.0..=MAX_DURATION_SECS).contains(&self.initial_delay) {
            return Err(DispatchError::InvalidConfig(format!(
                "retry_config.initial_delay must be between 0 and {} seconds, got {}",
                MAX_DURATION_SECS, self.initial_delay
            )));
        }

        if !(0.0..=MAX_DURATION_SECS).contains(&self.max_delay) {
            return Err(DispatchError::InvalidConfig(format!(
                "retry_config.max_delay must be between 0 and {} seconds, got {}",
                MAX_DURATION_SECS, self.max_delay
            )));
        }

        if !self.backoff_factor.is_finite() || self.backoff_factor <= 0.0 {
            return Err(DispatchError::InvalidConfig(format!(
                "retry_config.backoff_factor must be positive, got {}",
                self.backoff_factor
            )));
        }

        if self.max_attempts_before_escalation == Some(0) {
            return Err(DispatchError::InvalidConfig(
                "retry_config.max_attempts_before_escalation must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Delay to sleep after the given failed attempt (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ceiling = self.max_delay.max(0.0);

        let mut delay = self.initial_delay.max(0.0) * self.backoff_factor.powi(exponent);
        if !delay.is_finite() {
            delay = ceiling;
        }

        if self.jitter {
            delay += delay * 0.25 * rand::random::<f64>();
        }

        Duration::try_from_secs_f64(delay.min(ceiling))
            .or_else(|_| Duration::try_from_secs_f64(ceiling))
            .unwrap_or(Duration::MAX)
    }

    /// Whether the escalation threshold is reached after `attempt` failures
    pub fn escalation_reached(&self, attempt: u32) -> bool {
        matches!(self.max_attempts_before_escalation, Some(threshold) if attempt >= threshold)
    }

    /// Decide how to continue after the given failed attempt (1-based)
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if self.escalation_reached(attempt) {
            RetryDecision::Escalate
        } else if attempt >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.backoff_delay(attempt))
        }
    }
}

/// Run a storage operation, retrying transient failures with backoff
///
/// Non-transient errors (not found, invalid transition, constraint
/// violations) are returned immediately.
pub async fn retry_storage<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut f: F,
) -> DbResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Storage operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient storage error, will retry after delay"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    error!(operation = operation_name, attempt, error = %e, "Storage retries exhausted");
                }
                return Err(e);
            }
        }
    }
}

/// Policy used when persisting task transitions
pub(crate) fn storage_policy() -> RetryPolicy {
    RetryPolicy::new(5)
        .with_initial_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
}
