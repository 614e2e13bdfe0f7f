//! Composite match conditions and their evaluation.
//!
//! Evaluation fails closed: a malformed regex, an unparsable body, or a type
//! mismatch makes the condition a non-match instead of an error, so a bad
//! rule can never take down the hot path.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::rule::request::RequestInfo;

/// How the conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Logical {
    #[default]
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

/// What a condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Method,
    Path,
    Header,
    BodyJson,
}

/// How the inspected value is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Regex,
    Exists,
    JsonPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub operator: ConditionOperator,
    /// Header name for `header`, JSONPath expression for `body_json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub value: Value,
    /// Reserved for future per-condition options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MatchConfig {
    #[serde(default)]
    pub logical: Logical,
    #[serde(default)]
    pub conditions: Vec<MatchCondition>,
}

impl MatchConfig {
    /// Structural validation, enforced on every write.
    pub fn validate(&self) -> Result<()> {
        if self.conditions.is_empty() {
            return Err(EngineError::Validation(
                "match config must have at least one condition".into(),
            ));
        }
        for (i, cond) in self.conditions.iter().enumerate() {
            if cond.value.is_null() {
                return Err(EngineError::Validation(format!(
                    "conditions[{i}].value must not be null"
                )));
            }
            match cond.condition_type {
                ConditionType::Header if cond.key.as_deref().unwrap_or("").is_empty() => {
                    return Err(EngineError::Validation(format!(
                        "conditions[{i}]: header condition requires a key"
                    )));
                }
                ConditionType::BodyJson if cond.key.as_deref().unwrap_or("").is_empty() => {
                    return Err(EngineError::Validation(format!(
                        "conditions[{i}]: body_json condition requires a JSONPath key"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Values of all `path` conditions, used to derive the rule's path pattern.
    pub fn paths(&self) -> Vec<&str> {
        self.conditions
            .iter()
            .filter(|c| c.condition_type == ConditionType::Path)
            .filter_map(|c| c.value.as_str())
            .collect()
    }

    /// Values of all `method` conditions.
    pub fn methods(&self) -> Vec<String> {
        self.conditions
            .iter()
            .filter(|c| c.condition_type == ConditionType::Method)
            .filter_map(|c| c.value.as_str())
            .map(|m| m.to_uppercase())
            .collect()
    }

    /// Evaluate the conditions against a request with short-circuiting:
    /// AND returns false on the first non-match, OR returns true on the
    /// first match. Empty conditions never match.
    pub fn is_match(&self, req: &dyn RequestInfo) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        let is_and = self.logical == Logical::And;
        for cond in &self.conditions {
            let matched = match_condition(req, cond);
            if is_and && !matched {
                return false;
            }
            if !is_and && matched {
                return true;
            }
        }
        is_and
    }
}

fn match_condition(req: &dyn RequestInfo, cond: &MatchCondition) -> bool {
    match cond.condition_type {
        ConditionType::Method => match_method(req, cond),
        ConditionType::Path => match_path(req, cond),
        ConditionType::Header => match_header(req, cond),
        ConditionType::BodyJson => match_body_json(req, cond),
    }
}

fn match_method(req: &dyn RequestInfo, cond: &MatchCondition) -> bool {
    let Some(rule_method) = cond.value.as_str() else {
        warn!(value = %cond.value, "method condition value is not a string");
        return false;
    };
    req.method().eq_ignore_ascii_case(rule_method)
}

fn match_path(req: &dyn RequestInfo, cond: &MatchCondition) -> bool {
    let Some(rule_path) = cond.value.as_str() else {
        warn!(value = %cond.value, "path condition value is not a string");
        return false;
    };
    match cond.operator {
        ConditionOperator::Regex => regex_matches(rule_path, req.path()),
        // Everything else is exact comparison.
        _ => req.path() == rule_path,
    }
}

fn match_header(req: &dyn RequestInfo, cond: &MatchCondition) -> bool {
    let Some(key) = cond.key.as_deref() else {
        return false;
    };
    // HTTP headers are projected with lowercased keys.
    let Some(header_value) = req.headers().get(&key.to_lowercase()) else {
        return false;
    };
    match cond.operator {
        ConditionOperator::Exists => true,
        ConditionOperator::Regex => match cond.value.as_str() {
            Some(pattern) => regex_matches(pattern, header_value),
            None => false,
        },
        _ => cond.value.as_str() == Some(header_value.as_str()),
    }
}

fn match_body_json(req: &dyn RequestInfo, cond: &MatchCondition) -> bool {
    let Ok(body) = req.body_json() else {
        return false;
    };
    let Some(path) = cond.key.as_deref() else {
        return false;
    };
    let Some(result) = json_lookup(&Value::Object(body.clone()), path) else {
        return false;
    };
    match scalar_to_string(&cond.value) {
        Some(expected) => result == expected,
        None => false,
    }
}

/// Compile-and-match; a malformed pattern is a non-match, never an error.
fn regex_matches(pattern: &str, input: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(input),
        Err(e) => {
            warn!(pattern, error = %e, "invalid regex in match condition");
            false
        }
    }
}

/// Look up a dotted JSONPath (`$.user.name`, `$.items[0].id`) in a JSON
/// value, rendering scalar results as strings. A leading `$` is optional.
/// Unresolvable paths and non-scalar results yield `None`.
pub(crate) fn json_lookup(value: &Value, path: &str) -> Option<String> {
    let path = path.trim_start_matches('$').trim_start_matches('.');

    let mut current = value;
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        if let Some(bracket) = part.find('[') {
            if !part.ends_with(']') {
                return None;
            }
            let field = &part[..bracket];
            let index_str = &part[bracket + 1..part.len() - 1];
            if !field.is_empty() {
                current = current.get(field)?;
            }
            let index: usize = index_str.parse().ok()?;
            current = current.get(index)?;
        } else {
            current = current.get(part)?;
        }
    }

    scalar_to_string(current)
}

/// Render a scalar JSON value as a string for comparison and templating.
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        _ => None,
    }
}
