//! Response body templating.
//!
//! Bodies marked `template` substitute `${name}` placeholders from a data
//! map built by merging the rule's `templateData` with the request body
//! JSON. Placeholders use dotted paths (`${user.name}`, `${items[0].sku}`);
//! an unresolvable placeholder is a render error, which the action layer
//! carries on the response instead of panicking.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::rule::matcher::json_lookup;

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_\-.\[\]]*)\}").unwrap()
    })
}

/// Render a template against a data map.
pub fn render(template: &str, data: &Map<String, Value>) -> Result<String> {
    let root = Value::Object(data.clone());
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in placeholder_regex().captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        let value = json_lookup(&root, name).ok_or_else(|| {
            EngineError::ActionExecution(format!("unresolved template variable '{name}'"))
        })?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Merge two JSON object maps recursively; on key conflict `extra` wins,
/// except that two nested objects are merged instead of replaced.
pub fn merge_maps(base: &Map<String, Value>, extra: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in extra {
        match (merged.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                *existing = merge_maps(existing, incoming);
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn renders_simple_and_dotted_placeholders() {
        let data = map(json!({"name": "alice", "user": {"id": 7}, "items": ["a", "b"]}));
        assert_eq!(render("hi ${name}", &data).unwrap(), "hi alice");
        assert_eq!(render("id=${user.id}", &data).unwrap(), "id=7");
        assert_eq!(render("first=${items[0]}", &data).unwrap(), "first=a");
        assert_eq!(render("no placeholders", &data).unwrap(), "no placeholders");
    }

    #[test]
    fn unresolved_placeholder_is_an_error() {
        let data = map(json!({"name": "alice"}));
        let err = render("hi ${missing}", &data).unwrap_err();
        assert!(matches!(err, EngineError::ActionExecution(_)));
    }

    #[test]
    fn merge_prefers_extra_and_merges_nested_objects() {
        let base = map(json!({"a": 1, "nested": {"x": 1, "y": 2}}));
        let extra = map(json!({"b": 2, "nested": {"y": 3, "z": 4}}));
        let merged = merge_maps(&base, &extra);
        assert_eq!(Value::Object(merged), json!({
            "a": 1,
            "b": 2,
            "nested": {"x": 1, "y": 3, "z": 4}
        }));
    }

    #[test]
    fn merge_replaces_non_object_conflicts() {
        let base = map(json!({"v": {"x": 1}}));
        let extra = map(json!({"v": "flat"}));
        let merged = merge_maps(&base, &extra);
        assert_eq!(merged["v"], json!("flat"));
    }
}
