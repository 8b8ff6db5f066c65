//! Built-in validator kinds
//!
//! Every kind is a variant of [`BuiltinValidator`], built from the `params`
//! object of a submission's validation entry.

use super::{Completion, ValidationContext, ValidationResult, Validator};
use crate::{DispatchError, Result};
use async_trait::async_trait;
use jsonschema::JSONSchema;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

/// Names and descriptions of the built-in kinds, in registration order
pub const BUILTIN_KINDS: [(&str, &str); 7] = [
    ("response_not_empty", "Rejects empty or whitespace-only responses"),
    ("json_format", "Requires the response to be valid JSON"),
    ("json_schema", "Requires the response to be JSON matching params.schema"),
    ("regex", "Requires the response to match params.pattern"),
    ("length", "Requires the response length in characters to lie within params.min..=params.max"),
    ("contains", "Requires every string in params.values to appear in the response"),
    ("not_contains", "Rejects responses containing any string in params.values"),
];

/// Known validator kinds
pub enum BuiltinValidator {
    ResponseNotEmpty,
    JsonFormat,
    JsonSchema(Box<JSONSchema>),
    Regex(Regex),
    Length { min: Option<usize>, max: Option<usize> },
    Contains(TermList),
    NotContains(TermList),
}

/// Substrings to look for
#[derive(Debug, Clone, Deserialize)]
pub struct TermList {
    pub values: Vec<String>,
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
}

fn default_case_sensitive() -> bool {
    true
}

impl TermList {
    fn matches<'a>(&'a self, content: &str) -> impl Iterator<Item = &'a String> + 'a {
        let haystack = if self.case_sensitive {
            content.to_string()
        } else {
            content.to_lowercase()
        };
        let case_sensitive = self.case_sensitive;
        self.values.iter().filter(move |term| {
            if case_sensitive {
                haystack.contains(term.as_str())
            } else {
                haystack.contains(&term.to_lowercase())
            }
        })
    }
}

#[derive(Deserialize)]
struct PatternParams {
    pattern: String,
}

#[derive(Deserialize)]
struct LengthParams {
    min: Option<usize>,
    max: Option<usize>,
}

impl BuiltinValidator {
    /// Build the kind registered as `kind` from its params
    pub fn from_spec(kind: &str, params: &Value) -> Result<Self> {
        match kind {
            "response_not_empty" => Ok(Self::ResponseNotEmpty),
            "json_format" => Ok(Self::JsonFormat),
            "json_schema" => {
                let schema = params.get("schema").ok_or_else(|| {
                    DispatchError::InvalidConfig("json_schema requires params.schema".into())
                })?;
                let compiled = JSONSchema::compile(schema).map_err(|e| {
                    DispatchError::InvalidConfig(format!("Invalid JSON Schema: {}", e))
                })?;
                Ok(Self::JsonSchema(Box::new(compiled)))
            }
            "regex" => {
                let PatternParams { pattern } = parse_params(kind, params)?;
                let regex = Regex::new(&pattern).map_err(|e| {
                    DispatchError::InvalidConfig(format!("Invalid regex '{}': {}", pattern, e))
                })?;
                Ok(Self::Regex(regex))
            }
            "length" => {
                let LengthParams { min, max } = parse_params(kind, params)?;
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return Err(DispatchError::InvalidConfig(format!(
                            "length: min ({}) exceeds max ({})",
                            min, max
                        )));
                    }
                }
                Ok(Self::Length { min, max })
            }
            "contains" => Ok(Self::Contains(parse_params(kind, params)?)),
            "not_contains" => Ok(Self::NotContains(parse_params(kind, params)?)),
            other => Err(DispatchError::ValidatorNotFound(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResponseNotEmpty => "response_not_empty",
            Self::JsonFormat => "json_format",
            Self::JsonSchema(_) => "json_schema",
            Self::Regex(_) => "regex",
            Self::Length { .. } => "length",
            Self::Contains(_) => "contains",
            Self::NotContains(_) => "not_contains",
        }
    }

    /// Judge a response
    pub fn check(&self, content: &str) -> ValidationResult {
        match self {
            Self::ResponseNotEmpty => {
                if content.trim().is_empty() {
                    ValidationResult::fail("Response is empty")
                        .with_suggestion("Provide a non-empty answer to the request")
                } else {
                    ValidationResult::pass()
                }
            }
            Self::JsonFormat => match serde_json::from_str::<Value>(extract_json(content)) {
                Ok(_) => ValidationResult::pass(),
                Err(e) => ValidationResult::fail(format!("Response is not valid JSON: {}", e))
                    .with_suggestion("Respond with a single JSON document and nothing else"),
            },
            Self::JsonSchema(schema) => {
                let instance: Value = match serde_json::from_str(extract_json(content)) {
                    Ok(value) => value,
                    Err(e) => {
                        return ValidationResult::fail(format!("Response is not valid JSON: {}", e))
                            .with_suggestion("Respond with a single JSON document and nothing else")
                    }
                };

                // Errors borrow the schema and instance; collect before returning
                let messages = match schema.validate(&instance) {
                    Ok(()) => None,
                    Err(errors) => Some(
                        errors
                            .map(|e| format!("{}: {}", e.instance_path, e))
                            .collect::<Vec<String>>(),
                    ),
                };

                match messages {
                    None => ValidationResult::pass(),
                    Some(messages) => messages.into_iter().fold(
                        ValidationResult::fail("Response does not match the required JSON schema"),
                        |result, message| result.with_suggestion(format!("Fix {}", message)),
                    ),
                }
            }
            Self::Regex(regex) => {
                if regex.is_match(content) {
                    ValidationResult::pass()
                } else {
                    ValidationResult::fail(format!(
                        "Response does not match pattern '{}'",
                        regex.as_str()
                    ))
                }
            }
            Self::Length { min, max } => {
                let len = content.chars().count();
                match (min, max) {
                    (Some(min), _) if len < *min => ValidationResult::fail(format!(
                        "Response is too short: {} characters, minimum is {}",
                        len, min
                    ))
                    .with_suggestion(format!("Expand the answer to at least {} characters", min)),
                    (_, Some(max)) if len > *max => ValidationResult::fail(format!(
                        "Response is too long: {} characters, maximum is {}",
                        len, max
                    ))
                    .with_suggestion(format!("Shorten the answer to at most {} characters", max)),
                    _ => ValidationResult::pass(),
                }
            }
            Self::Contains(terms) => {
                let found: Vec<&String> = terms.matches(content).collect();
                let missing: Vec<&str> = terms
                    .values
                    .iter()
                    .filter(|term| !found.contains(term))
                    .map(String::as_str)
                    .collect();
                if missing.is_empty() {
                    ValidationResult::pass()
                } else {
                    ValidationResult::fail(format!(
                        "Response is missing required text: {}",
                        missing.join(", ")
                    ))
                    .with_suggestion(format!("Include: {}", missing.join(", ")))
                }
            }
            Self::NotContains(terms) => {
                let found: Vec<&str> = terms.matches(content).map(String::as_str).collect();
                if found.is_empty() {
                    ValidationResult::pass()
                } else {
                    ValidationResult::fail(format!(
                        "Response contains forbidden text: {}",
                        found.join(", ")
                    ))
                    .with_suggestion(format!("Remove: {}", found.join(", ")))
                }
            }
        }
    }
}

#[async_trait]
impl Validator for BuiltinValidator {
    fn name(&self) -> &str {
        self.kind()
    }

    async fn validate(&self, completion: &Completion, _ctx: &ValidationContext) -> ValidationResult {
        self.check(&completion.content)
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(kind: &str, params: &Value) -> Result<T> {
    T::deserialize(params)
        .map_err(|e| DispatchError::InvalidConfig(format!("{}: invalid params: {}", kind, e)))
}

/// Body of a ```json fenced block if present, else the trimmed response
fn extract_json(text: &str) -> &str {
    for fence in ["```json", "```JSON"] {
        if let Some(start) = text.find(fence) {
            let content = &text[start + fence.len()..];
            if let Some(end) = content.find("```") {
                return content[..end].trim();
            }
        }
    }
    text.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(kind: &str, params: Value) -> BuiltinValidator {
        BuiltinValidator::from_spec(kind, &params).unwrap()
    }

    #[test]
    fn test_response_not_empty() {
        let validator = build("response_not_empty", Value::Null);
        assert!(validator.check("4").valid);

        let result = validator.check("  \n");
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("empty"));
    }

    #[test]
    fn test_json_format() {
        let validator = build("json_format", Value::Null);
        assert!(validator.check(r#"{"answer": 4}"#).valid);
        assert!(validator.check("```json\n[1, 2]\n```").valid);
        assert!(!validator.check("the answer is 4").valid);
    }

    #[test]
    fn test_json_schema() {
        let validator = build(
            "json_schema",
            json!({"schema": {
                "type": "object",
                "properties": {"answer": {"type": "integer"}},
                "required": ["answer"]
            }}),
        );

        assert!(validator.check(r#"{"answer": 4}"#).valid);

        let result = validator.check(r#"{"answer": "four"}"#);
        assert!(!result.valid);
        assert!(!result.suggestions.is_empty());
        assert!(result.suggestions[0].contains("/answer"));

        assert!(!validator.check("not json").valid);
    }

    #[test]
    fn test_json_schema_requires_schema() {
        let err = BuiltinValidator::from_spec("json_schema", &json!({})).err().unwrap();
        assert!(matches!(err, DispatchError::InvalidConfig(_)));
    }

    #[test]
    fn test_regex() {
        let validator = build("regex", json!({"pattern": r"^\d+$"}));
        assert!(validator.check("42").valid);
        assert!(!validator.check("forty-two").valid);

        let err = BuiltinValidator::from_spec("regex", &json!({"pattern": "("})).err().unwrap();
        assert!(matches!(err, DispatchError::InvalidConfig(msg) if msg.contains("Invalid regex")));
    }

    #[test]
    fn test_length_counts_characters() {
        let validator = build("length", json!({"min": 2, "max": 4}));
        assert!(validator.check("héé").valid);
        assert!(!validator.check("h").valid);
        assert!(validator.check("hello").error.unwrap().contains("too long"));

        let err = BuiltinValidator::from_spec("length", &json!({"min": 5, "max": 1})).err().unwrap();
        assert!(matches!(err, DispatchError::InvalidConfig(_)));
    }

    #[test]
    fn test_contains_and_not_contains() {
        let contains = build("contains", json!({"values": ["alpha", "beta"]}));
        assert!(contains.check("alpha and beta").valid);
        let result = contains.check("alpha only");
        assert!(result.error.unwrap().contains("beta"));

        let insensitive = build("contains", json!({"values": ["ALPHA"], "case_sensitive": false}));
        assert!(insensitive.check("alpha").valid);

        let forbidden = build("not_contains", json!({"values": ["TODO"]}));
        assert!(forbidden.check("done").valid);
        assert!(!forbidden.check("TODO: finish").valid);
    }

    #[test]
    fn test_unknown_kind() {
        let err = BuiltinValidator::from_spec("sentiment", &Value::Null).err().unwrap();
        assert!(matches!(err, DispatchError::ValidatorNotFound(name) if name == "sentiment"));
    }

    #[test]
    fn test_every_listed_kind_builds() {
        let params = json!({"schema": {}, "pattern": ".*", "values": []});
        for (kind, _) in BUILTIN_KINDS {
            let validator = BuiltinValidator::from_spec(kind, &params).unwrap();
            assert_eq!(validator.kind(), kind);
        }
    }
}
