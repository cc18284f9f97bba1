// src/tools/coerce.rs
//! Argument value coercion for `<parameter=..>` bodies.

use super::ToolSchema;
use serde_json::{Map, Value};

/// A coerced parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentValue {
    Text(String),
    /// Decoded JSON array or object
    Structured(Value),
}

impl ArgumentValue {
    pub fn into_json(self) -> Value {
        match self {
            ArgumentValue::Text(s) => Value::String(s),
            ArgumentValue::Structured(v) => v,
        }
    }

    /// Render the value the way a model would write it inside a parameter tag.
    pub fn to_parameter_text(&self) -> String {
        match self {
            ArgumentValue::Text(s) => s.clone(),
            ArgumentValue::Structured(v) => v.to_string(),
        }
    }
}

/// Coerce one raw parameter body.
///
/// Only list/object literals that decode as strict JSON become structured;
/// everything else, including numbers and booleans, stays text.
pub fn coerce_parameter(raw: &str) -> ArgumentValue {
    let trimmed = raw.trim();
    let candidate = strip_backtick_fence(trimmed);
    if looks_structured(candidate) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return ArgumentValue::Structured(value);
        }
        tracing::debug!("Parameter looks structured but is not valid JSON, keeping text");
    }
    ArgumentValue::Text(trimmed.to_string())
}

fn looks_structured(s: &str) -> bool {
    (s.starts_with('[') && s.ends_with(']')) || (s.starts_with('{') && s.ends_with('}'))
}

/// Remove one enclosing back-tick fence: `` `...` `` or a ```` ``` ```` block
/// with an optional language tag.
fn strip_backtick_fence(s: &str) -> &str {
    if s.len() >= 6 {
        if let Some(inner) = s.strip_prefix("```").and_then(|r| r.strip_suffix("```")) {
            let inner = match inner.find('\n') {
                Some(nl)
                    if inner[..nl]
                        .trim()
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
                {
                    &inner[nl + 1..]
                }
                _ => inner,
            };
            return inner.trim();
        }
    }
    if s.len() >= 2 {
        if let Some(inner) = s.strip_prefix('`').and_then(|r| r.strip_suffix('`')) {
            return inner.trim();
        }
    }
    s
}

/// Arguments for a function body that carried no parameter tags.
///
/// The whole body is assigned only when the schema names exactly one required
/// parameter; otherwise the call gets no arguments at all.
pub fn fallback_arguments(raw_body: &str, schema: Option<&ToolSchema>) -> Map<String, Value> {
    let mut args = Map::new();
    let body = raw_body.trim();
    if body.is_empty() {
        return args;
    }
    match schema.and_then(ToolSchema::sole_required) {
        Some(param) => {
            tracing::debug!(
                "No parameter tags, assigning body to sole required parameter '{}'",
                param
            );
            args.insert(param.to_string(), Value::String(body.to_string()));
        }
        None => {
            tracing::debug!("No parameter tags and no unambiguous target, emitting empty arguments");
        }
    }
    args
}
