//! LLM call auditing types.
//!
//! Calls are tagged before the entity they belong to exists (a flow is created
//! from the result of the very calls that describe it). Callers therefore tag
//! every attempt with a [`CorrelationKey`] up front and enrich the matching
//! records once the real id is known.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A caller-chosen unique key/value pair stamped into call metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub key: String,
    pub value: String,
}

impl CorrelationKey {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// A fresh, unique value under `key`.
    pub fn generate(key: impl Into<String>) -> Self {
        Self::new(key, Uuid::new_v4().to_string())
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Metadata attached to every attempt of one logical call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallMetadata {
    pub correlation: CorrelationKey,
    pub usecase: String,
    pub account_id: Option<String>,
    pub extra: Map<String, Value>,
}

impl CallMetadata {
    pub fn new(correlation: CorrelationKey, usecase: impl Into<String>) -> Self {
        Self {
            correlation,
            usecase: usecase.into(),
            account_id: None,
            extra: Map::new(),
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Flatten into the JSON object stored on each record.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = self.extra.clone();
        map.insert(
            self.correlation.key.clone(),
            Value::String(self.correlation.value.clone()),
        );
        map.insert("usecase".into(), Value::String(self.usecase.clone()));
        if let Some(account_id) = &self.account_id {
            map.insert("accountId".into(), Value::String(account_id.clone()));
        }
        map
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum CallOutcome {
    Succeeded,
    Failed { error: String },
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Append-only audit row for a single attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallRecord {
    pub id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    pub correlation: CorrelationKey,
    pub usecase: String,
    pub metadata: Map<String, Value>,
    pub model: String,
    /// 1-based attempt number within the logical call.
    pub attempt: u32,
    #[serde(flatten)]
    pub outcome: CallOutcome,
    #[serde(default)]
    pub response_excerpt: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl LlmCallRecord {
    pub fn new(metadata: &CallMetadata, model: impl Into<String>, attempt: u32, outcome: CallOutcome) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: metadata.account_id.clone(),
            correlation: metadata.correlation.clone(),
            usecase: metadata.usecase.clone(),
            metadata: metadata.to_json(),
            model: model.into(),
            attempt,
            outcome,
            response_excerpt: None,
            duration_ms: 0,
            created_at: Utc::now(),
        }
    }
}

/// Merge `patch` into `target`, key by key. Nested objects are replaced, not merged.
pub fn merge_metadata(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (k, v) in patch {
        target.insert(k.clone(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_json_contains_pair_and_usecase() {
        let meta = CallMetadata::new(CorrelationKey::new("generator", "1700000000000"), "generator")
            .with_account("acct-1")
            .with_extra("agentCodes", json!(["X"]));
        let map = meta.to_json();
        assert_eq!(map["generator"], "1700000000000");
        assert_eq!(map["usecase"], "generator");
        assert_eq!(map["accountId"], "acct-1");
        assert_eq!(map["agentCodes"], json!(["X"]));
    }

    #[test]
    fn generated_keys_are_unique() {
        let a = CorrelationKey::generate("generator");
        let b = CorrelationKey::generate("generator");
        assert_eq!(a.key, b.key);
        assert_ne!(a.value, b.value);
    }

    #[test]
    fn merge_overwrites_and_adds() {
        let mut target = json!({"usecase": "generator", "flowId": null})
            .as_object()
            .cloned()
            .unwrap();
        let patch = json!({"flowId": "f-1"}).as_object().cloned().unwrap();
        merge_metadata(&mut target, &patch);
        assert_eq!(target["flowId"], "f-1");
        assert_eq!(target["usecase"], "generator");
    }

    #[test]
    fn outcome_serializes_flat() {
        let meta = CallMetadata::new(CorrelationKey::new("k", "v"), "test");
        let record = LlmCallRecord::new(
            &meta,
            "model-a",
            1,
            CallOutcome::Failed {
                error: "timeout".into(),
            },
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["error"], "timeout");
    }
}
