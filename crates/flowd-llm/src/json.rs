use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use flowd_core::error::{FlowdError, Result};

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").unwrap())
}

/// Pull a JSON object out of a model reply.
///
/// Accepts a bare object, an object inside a markdown code fence, or an object
/// surrounded by prose.
pub fn extract_json(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return object_only(value);
    }

    if let Some(inner) = fence_re().captures(trimmed).and_then(|c| c.get(1)) {
        if let Ok(value) = serde_json::from_str::<Value>(inner.as_str()) {
            return object_only(value);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return object_only(value);
            }
        }
    }

    Err(FlowdError::LlmParse(format!(
        "no JSON object in response: {}",
        excerpt(trimmed, 120)
    )))
}

fn object_only(value: Value) -> Result<Value> {
    if value.is_object() {
        Ok(value)
    } else {
        Err(FlowdError::LlmParse(format!("expected a JSON object, got {}", value)))
    }
}

/// Truncate on a char boundary.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_object() {
        assert_eq!(extract_json(r#" {"a": 1} "#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn fenced_object() {
        let text = "Here you go:\n```json\n{\"triggers\": [\"once|0|\"]}\n```\nthanks";
        assert_eq!(extract_json(text).unwrap(), json!({"triggers": ["once|0|"]}));
    }

    #[test]
    fn object_in_prose() {
        let text = "Sure! {\"name\": \"Daily digest\"} hope that helps";
        assert_eq!(extract_json(text).unwrap()["name"], "Daily digest");
    }

    #[test]
    fn rejects_non_objects() {
        assert!(matches!(extract_json("[1, 2]"), Err(FlowdError::LlmParse(_))));
        assert!(matches!(extract_json("no json here"), Err(FlowdError::LlmParse(_))));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo", 2), "hé...");
        assert_eq!(excerpt("hi", 10), "hi");
    }
}
