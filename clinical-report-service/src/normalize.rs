//! Conversion of whatever an external service hands back into plain JSON.
//!
//! Service adapters translate their native response into [`ExternalValue`];
//! [`normalize`] then reduces it to scalars, string-keyed maps and lists.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// The shapes an external result can take before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Map(BTreeMap<String, ExternalValue>),
    List(Vec<ExternalValue>),
    /// Result envelope; checked for `raw_output`, then `output`, then `fields`.
    Wrapped(WrappedResult),
    /// Anything else, kept only as its description.
    Opaque(String),
}

/// Envelope returned by agent-style services.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WrappedResult {
    pub raw_output: Option<Box<ExternalValue>>,
    pub output: Option<Box<ExternalValue>>,
    pub fields: BTreeMap<String, ExternalValue>,
}

impl WrappedResult {
    pub fn raw(value: ExternalValue) -> Self {
        Self {
            raw_output: Some(Box::new(value)),
            ..Self::default()
        }
    }
}

impl ExternalValue {
    /// Adapter for LLM completions: strips Markdown code fences, parses the
    /// body as JSON when possible and wraps the result as `raw_output`.
    pub fn from_llm_text(text: &str) -> Self {
        let body = strip_code_fence(text);
        let parsed = serde_json::from_str::<Value>(body)
            .ok()
            .or_else(|| embedded_json(body))
            .map(ExternalValue::from)
            .unwrap_or_else(|| ExternalValue::String(body.to_string()));
        ExternalValue::Wrapped(WrappedResult::raw(parsed))
    }
}

impl From<Value> for ExternalValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ExternalValue::Null,
            Value::Bool(b) => ExternalValue::Bool(b),
            Value::Number(n) => ExternalValue::Number(n),
            Value::String(s) => ExternalValue::String(s),
            Value::Array(items) => {
                ExternalValue::List(items.into_iter().map(ExternalValue::from).collect())
            }
            Value::Object(map) => ExternalValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, ExternalValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Reduce an external value to plain JSON. Never fails: unresolvable
/// values fall back to their string form.
pub fn normalize(value: ExternalValue) -> Value {
    match value {
        ExternalValue::Null => Value::Null,
        ExternalValue::Bool(b) => Value::Bool(b),
        ExternalValue::Number(n) => Value::Number(n),
        ExternalValue::String(s) => Value::String(s),
        ExternalValue::Map(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .collect::<Map<String, Value>>(),
        ),
        ExternalValue::List(items) => Value::Array(items.into_iter().map(normalize).collect()),
        ExternalValue::Wrapped(wrapped) => unwrap_result(wrapped),
        ExternalValue::Opaque(description) => Value::String(description),
    }
}

fn unwrap_result(wrapped: WrappedResult) -> Value {
    if let Some(raw) = wrapped.raw_output {
        return normalize(*raw);
    }
    if let Some(output) = wrapped.output {
        return normalize(*output);
    }
    if !wrapped.fields.is_empty() {
        return normalize(ExternalValue::Map(wrapped.fields));
    }
    Value::String(String::new())
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the language tag on the fence line
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// The outermost `{...}` block of a chatty response, if it parses.
fn embedded_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixtures() -> Vec<ExternalValue> {
        let nested = ExternalValue::Map(BTreeMap::from([
            ("a".to_string(), ExternalValue::List(vec![ExternalValue::Bool(true)])),
            (
                "b".to_string(),
                ExternalValue::Wrapped(WrappedResult {
                    output: Some(Box::new(ExternalValue::String("inner".into()))),
                    ..WrappedResult::default()
                }),
            ),
        ]));
        vec![
            ExternalValue::Null,
            ExternalValue::Number(Number::from(3)),
            ExternalValue::Opaque("<Agent 0x1>".into()),
            nested.clone(),
            ExternalValue::Wrapped(WrappedResult::raw(nested)),
            ExternalValue::Wrapped(WrappedResult {
                fields: BTreeMap::from([("k".to_string(), ExternalValue::Null)]),
                ..WrappedResult::default()
            }),
            ExternalValue::Wrapped(WrappedResult::default()),
            ExternalValue::from_llm_text("```json\n{\"entries\": []}\n```"),
        ]
    }

    #[test]
    fn normalize_is_idempotent() {
        for fixture in fixtures() {
            let once = normalize(fixture);
            let twice = normalize(ExternalValue::from(once.clone()));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn prefers_raw_output_over_output() {
        let wrapped = ExternalValue::Wrapped(WrappedResult {
            raw_output: Some(Box::new(ExternalValue::String("raw".into()))),
            output: Some(Box::new(ExternalValue::String("output".into()))),
            fields: BTreeMap::new(),
        });
        assert_eq!(normalize(wrapped), json!("raw"));
    }

    #[test]
    fn opaque_values_become_strings() {
        assert_eq!(normalize(ExternalValue::Opaque("obj".into())), json!("obj"));
    }

    #[test]
    fn llm_text_is_parsed_when_possible() {
        assert_eq!(
            normalize(ExternalValue::from_llm_text("```json\n{\"a\": 1}\n```")),
            json!({"a": 1})
        );
        assert_eq!(
            normalize(ExternalValue::from_llm_text("Sure! {\"a\": [2]} hope this helps")),
            json!({"a": [2]})
        );
        assert_eq!(
            normalize(ExternalValue::from_llm_text("plain words")),
            json!("plain words")
        );
    }
}
