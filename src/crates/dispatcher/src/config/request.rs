//! Submission schema for a single LLM task
//!
//! A submission arrives as an opaque JSON map. Required fields are checked
//! here, everything outside the schema is kept verbatim in
//! [`RequestConfig::params`] and forwarded to the executor.

use crate::config::DefaultsConfig;
use crate::executor::retry::MAX_DURATION_SECS;
use crate::executor::RetryPolicy;
use crate::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Author of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A validator reference inside a submission: `{ "type": ..., "params": ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSpec {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl ValidationSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Parsed submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Model identifier passed to the executor
    pub model: String,

    /// Initial conversation
    pub messages: Vec<Message>,

    /// Ordered validator chain
    #[serde(default)]
    pub validation: Vec<ValidationSpec>,

    /// Retry policy; filled from dispatcher defaults at submission when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryPolicy>,

    /// Per-task wall-clock deadline in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    /// Everything else (temperature, max_tokens, ...), forwarded untouched
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl RequestConfig {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            validation: Vec::new(),
            retry_config: None,
            timeout: None,
            params: Map::new(),
        }
    }

    pub fn with_validator(mut self, spec: ValidationSpec) -> Self {
        self.validation.push(spec);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_config = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Parse and validate a raw submission map
    pub fn from_value(value: Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| DispatchError::InvalidConfig("submission must be a JSON object".into()))?;

        match object.get("model") {
            Some(Value::String(model)) if !model.trim().is_empty() => {}
            Some(Value::String(_)) => {
                return Err(DispatchError::InvalidConfig("'model' must not be empty".into()))
            }
            Some(_) => return Err(DispatchError::InvalidConfig("'model' must be a string".into())),
            None => return Err(DispatchError::InvalidConfig("missing required field 'model'".into())),
        }

        if !object.contains_key("messages") {
            return Err(DispatchError::InvalidConfig(
                "missing required field 'messages'".into(),
            ));
        }

        let config: Self = serde_json::from_value(value)
            .map_err(|e| DispatchError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(DispatchError::InvalidConfig("'model' must not be empty".into()));
        }

        if self.messages.is_empty() {
            return Err(DispatchError::InvalidConfig(
                "'messages' must contain at least one message".into(),
            ));
        }

        if let Some(spec) = self.validation.iter().find(|spec| spec.kind.trim().is_empty()) {
            return Err(DispatchError::InvalidConfig(format!(
                "validator entry has an empty type: {:?}",
                spec
            )));
        }

        if let Some(policy) = &self.retry_config {
            policy.validate()?;
        }

        if let Some(timeout) = self.timeout {
            if !(timeout > 0.0 && timeout <= MAX_DURATION_SECS) {
                return Err(DispatchError::InvalidConfig(format!(
                    "'timeout' must be a positive number of seconds up to {}, got {}",
                    MAX_DURATION_SECS, timeout
                )));
            }
        }

        Ok(())
    }

    /// Fill unset retry policy and timeout from dispatcher defaults
    pub fn apply_defaults(&mut self, defaults: &DefaultsConfig) {
        if self.retry_config.is_none() {
            self.retry_config = Some(defaults.retry.clone());
        }
        if self.timeout.is_none() {
            self.timeout = defaults.timeout_secs.map(|secs| secs as f64);
        }
    }

    /// Effective retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_config.clone().unwrap_or_default()
    }

    /// Wall-clock deadline, if any
    pub fn deadline(&self) -> Option<Duration> {
        self.timeout
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Executor parameters: the model plus every non-schema field
    pub fn executor_params(&self) -> Map<String, Value> {
        let mut params = self.params.clone();
        params.insert("model".to_string(), Value::String(self.model.clone()));
        params
    }
}
