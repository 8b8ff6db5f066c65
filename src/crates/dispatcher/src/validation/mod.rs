//! Response validation
//!
//! A [`Validator`] judges one executor [`Completion`] and returns a
//! [`ValidationResult`]. Failing results carry the text that is fed back into
//! the conversation before the next attempt.

pub mod builtin;
pub mod registry;

pub use builtin::BuiltinValidator;
pub use registry::{StrategyInfo, ValidatorFactory, ValidatorRegistry};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// One successful executor response
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Completion {
    /// Assistant message text
    pub content: String,

    /// Model that produced the response, if the executor reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Provider usage figures, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,

    /// Any other provider fields
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Completion {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_usage(mut self, usage: Value) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Verdict of a single validator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,

    /// Why the response was rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Remediation hints for the next attempt, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            valid: true,
            error: None,
            suggestions: Vec::new(),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// What a validator may know about the call it is judging
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationContext {
    /// Task being executed, if any
    pub task_id: Option<String>,
    /// Model requested by the submission
    pub model: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
    /// Executor parameters of the submission
    pub params: Map<String, Value>,
}

/// Judges executor responses
///
/// Implementations must be pure with respect to shared state: the same
/// validator instance is reused across tasks and attempts.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Registry name of this validator
    fn name(&self) -> &str;

    async fn validate(&self, completion: &Completion, ctx: &ValidationContext) -> ValidationResult;
}

/// Outcome of running a validator chain
#[derive(Debug, Clone, PartialEq)]
pub enum ChainVerdict {
    Passed,
    /// First failing validator and its result
    Rejected { validator: String, result: ValidationResult },
}

/// Run validators in order, stopping at the first failure
pub async fn run_chain(
    chain: &[Arc<dyn Validator>],
    completion: &Completion,
    ctx: &ValidationContext,
) -> ChainVerdict {
    for validator in chain {
        let result = validator.validate(completion, ctx).await;
        if !result.valid {
            return ChainVerdict::Rejected {
                validator: validator.name().to_string(),
                result,
            };
        }
    }
    ChainVerdict::Passed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        verdict: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Validator for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn validate(&self, _: &Completion, _: &ValidationContext) -> ValidationResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.verdict {
                ValidationResult::pass()
            } else {
                ValidationResult::fail(format!("{} rejected", self.name))
            }
        }
    }

    fn counting(name: &'static str, verdict: bool, calls: &Arc<AtomicUsize>) -> Arc<dyn Validator> {
        Arc::new(Counting {
            name,
            verdict,
            calls: Arc::clone(calls),
        })
    }

    #[test]
    fn test_validation_result_helpers() {
        assert!(ValidationResult::pass().valid);

        let failed = ValidationResult::fail("too short").with_suggestion("write more");
        assert!(!failed.valid);
        assert_eq!(failed.error.as_deref(), Some("too short"));
        assert_eq!(failed.suggestions, vec!["write more"]);
    }

    #[tokio::test]
    async fn test_chain_short_circuits_on_first_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = vec![
            counting("first", true, &calls),
            counting("second", false, &calls),
            counting("third", false, &calls),
        ];

        let verdict = run_chain(&chain, &Completion::new("x"), &ValidationContext::default()).await;

        match verdict {
            ChainVerdict::Rejected { validator, result } => {
                assert_eq!(validator, "second");
                assert_eq!(result.error.as_deref(), Some("second rejected"));
            }
            ChainVerdict::Passed => panic!("chain should reject"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_chain_passes() {
        let verdict = run_chain(&[], &Completion::new(""), &ValidationContext::default()).await;
        assert_eq!(verdict, ChainVerdict::Passed);
    }

    #[test]
    fn test_completion_serialization_skips_empty_fields() {
        let value = serde_json::to_value(Completion::new("4")).unwrap();
        assert_eq!(value, serde_json::json!({"content": "4"}));

        let value = serde_json::to_value(Completion::new("4").with_model("m")).unwrap();
        assert_eq!(value["model"], "m");
    }
}
