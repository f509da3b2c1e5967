//! Multi-model call ensemble.
//!
//! One logical call runs against an ordered ladder of interchangeable models.
//! Attempt `i` uses `models[i % models.len()]`: every failure moves one rung
//! down, and the ladder wraps to the top only once it is exhausted. From the
//! first wrap on, each attempt waits with exponential backoff.
//!
//! Every attempt, failed or not, is appended to the [`CallRecordStore`] tagged
//! with the caller's [`CorrelationKey`], so records can be found and enriched
//! later with ids that did not exist when the call was made.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use flowd_core::call::{CallMetadata, CallOutcome, CorrelationKey, LlmCallRecord};
use flowd_core::config::{EnsembleConfig, RetryConfig};
use flowd_core::error::{FlowdError, Result};
use flowd_core::event::{EventBus, FlowEvent};
use flowd_core::traits::{CallRecordStore, CompletionRequest};
use flowd_core::types::ChatMessage;

use crate::json::{excerpt, extract_json};
use crate::providers::ProviderRegistry;
use crate::retry::backoff_before;

const EXCERPT_CHARS: usize = 500;

pub type Validator = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// Check applied to a raw completion before it counts as a success.
#[derive(Clone, Default)]
pub enum ResponseShape {
    #[default]
    Text,
    /// The reply must contain a JSON object.
    Json,
    /// A JSON object that also passes the caller's validator.
    JsonWith(Validator),
}

impl fmt::Debug for ResponseShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("Text"),
            Self::Json => f.write_str("Json"),
            Self::JsonWith(_) => f.write_str("JsonWith(..)"),
        }
    }
}

impl ResponseShape {
    /// JSON that must deserialize into `T`.
    pub fn typed<T: DeserializeOwned + 'static>() -> Self {
        Self::JsonWith(Arc::new(|value: &Value| {
            serde_json::from_value::<T>(value.clone())
                .map(|_| ())
                .map_err(|e| FlowdError::LlmParse(e.to_string()))
        }))
    }

    fn wants_json(&self) -> bool {
        !matches!(self, Self::Text)
    }

    fn check(&self, text: &str) -> Result<Option<Value>> {
        match self {
            Self::Text => Ok(None),
            Self::Json => extract_json(text).map(Some),
            Self::JsonWith(validate) => {
                let value = extract_json(text)?;
                validate(&value)?;
                Ok(Some(value))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnsembleRequest {
    pub messages: Vec<ChatMessage>,
    /// Ordered model ladder.
    pub models: Vec<String>,
    pub metadata: CallMetadata,
    pub max_attempts: u32,
    pub shape: ResponseShape,
}

impl EnsembleRequest {
    pub fn new(messages: Vec<ChatMessage>, models: Vec<String>, metadata: CallMetadata) -> Self {
        Self {
            messages,
            models,
            metadata,
            max_attempts: 1,
            shape: ResponseShape::Text,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn shape(mut self, shape: ResponseShape) -> Self {
        self.shape = shape;
        self
    }
}

#[derive(Debug, Clone)]
pub struct EnsembleResponse {
    pub text: String,
    /// Parsed object for JSON shapes.
    pub json: Option<Value>,
    pub model: String,
    /// 1-based number of the attempt that succeeded.
    pub attempts: u32,
}

/// Executes logical calls against a model ladder with fallback and auditing.
pub struct Ensemble {
    providers: ProviderRegistry,
    records: Arc<dyn CallRecordStore>,
    attempt_timeout: Duration,
    retry: RetryConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl Ensemble {
    pub fn new(providers: ProviderRegistry, records: Arc<dyn CallRecordStore>) -> Self {
        Self {
            providers,
            records,
            attempt_timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
            event_bus: None,
        }
    }

    pub fn from_config(
        providers: ProviderRegistry,
        records: Arc<dyn CallRecordStore>,
        config: &EnsembleConfig,
    ) -> Self {
        Self::new(providers, records)
            .with_attempt_timeout(Duration::from_secs(config.attempt_timeout_secs))
            .with_retry(config.retry.clone())
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_events(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Run one logical call.
    ///
    /// Fails with `EnsembleExhausted` once `max_attempts` attempts failed. A
    /// failure to record an attempt aborts the call with that error.
    pub async fn call(&self, request: EnsembleRequest) -> Result<EnsembleResponse> {
        if request.models.is_empty() {
            return Err(FlowdError::InvalidArgument("ensemble needs at least one model".into()));
        }
        if request.max_attempts == 0 {
            return Err(FlowdError::InvalidArgument("max_attempts must be at least 1".into()));
        }

        let ladder = &request.models;
        let mut last_error = String::new();

        for index in 0..request.max_attempts {
            let model = &ladder[index as usize % ladder.len()];
            let attempt = index + 1;

            if let Some(delay) = backoff_before(index, ladder.len(), &self.retry) {
                debug!(attempt, backoff_ms = delay.as_millis() as u64, "Ladder wrapped, backing off");
                tokio::time::sleep(delay).await;
            }

            let started = Instant::now();
            let result = self.attempt(model, &request).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let (outcome, excerpt_text) = match &result {
                Ok((text, _)) => (CallOutcome::Succeeded, Some(excerpt(text, EXCERPT_CHARS))),
                Err(e) => (CallOutcome::Failed { error: e.to_string() }, None),
            };
            let mut record = LlmCallRecord::new(&request.metadata, model.as_str(), attempt, outcome);
            record.duration_ms = duration_ms;
            record.response_excerpt = excerpt_text;
            self.records.insert_call_record(&record)?;

            if let Some(bus) = &self.event_bus {
                bus.publish(FlowEvent::LlmAttempt {
                    correlation: request.metadata.correlation.clone(),
                    model: model.clone(),
                    attempt,
                    error: result.as_ref().err().map(|e| e.to_string()),
                    duration_ms,
                });
            }

            match result {
                Ok((text, json)) => {
                    info!(
                        usecase = %request.metadata.usecase,
                        model = %model,
                        attempt,
                        duration_ms,
                        "Ensemble call succeeded"
                    );
                    return Ok(EnsembleResponse {
                        text,
                        json,
                        model: model.clone(),
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!(
                        usecase = %request.metadata.usecase,
                        model = %model,
                        attempt,
                        max_attempts = request.max_attempts,
                        error = %e,
                        "Ensemble attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(FlowdError::EnsembleExhausted {
            attempts: request.max_attempts,
            last_error,
        })
    }

    /// Run a call whose reply must be a JSON object deserializable into `T`.
    pub async fn call_typed<T: DeserializeOwned + 'static>(
        &self,
        request: EnsembleRequest,
    ) -> Result<(T, EnsembleResponse)> {
        let response = self.call(request.shape(ResponseShape::typed::<T>())).await?;
        let value = response
            .json
            .clone()
            .ok_or_else(|| FlowdError::LlmParse("missing JSON body".into()))?;
        let typed = serde_json::from_value(value).map_err(|e| FlowdError::LlmParse(e.to_string()))?;
        Ok((typed, response))
    }

    /// Merge `patch` into every call record tagged with `correlation`.
    pub fn enrich(&self, correlation: &CorrelationKey, patch: &Map<String, Value>) -> Result<usize> {
        let touched = self.records.enrich_call_records(correlation, patch)?;
        info!(correlation = %correlation, touched, "LLM call metadata enriched");
        Ok(touched)
    }

    async fn attempt(&self, model: &str, request: &EnsembleRequest) -> Result<(String, Option<Value>)> {
        let provider = self.providers.get(model).ok_or_else(|| FlowdError::ProviderFailure {
            model: model.to_string(),
            message: "no provider configured for model".into(),
        })?;

        let completion = CompletionRequest {
            model: model.to_string(),
            messages: request.messages.clone(),
            json_mode: request.shape.wants_json(),
        };
        let text = tokio::time::timeout(self.attempt_timeout, provider.complete(completion))
            .await
            .map_err(|_| FlowdError::ProviderFailure {
                model: model.to_string(),
                message: format!("timed out after {}s", self.attempt_timeout.as_secs_f32()),
            })??;

        let json = request.shape.check(&text)?;
        Ok((text, json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowd_store::SqliteStore;
    use flowd_test_utils::{Reply, ScriptedProvider};
    use flowd_core::types::PageRequest;
    use serde::Deserialize;
    use serde_json::json;

    struct Harness {
        ensemble: Ensemble,
        provider: Arc<ScriptedProvider>,
        store: Arc<SqliteStore>,
    }

    fn harness(provider: ScriptedProvider, models: &[&str]) -> Harness {
        let provider = Arc::new(provider);
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let registry = ProviderRegistry::new().with_models(models, provider.clone());
        let ensemble = Ensemble::new(registry, store.clone())
            .with_attempt_timeout(Duration::from_secs(5))
            .with_retry(RetryConfig {
                initial_backoff_ms: 100,
                max_backoff_ms: 1000,
            });
        Harness {
            ensemble,
            provider,
            store,
        }
    }

    fn request(models: &[&str], max_attempts: u32) -> EnsembleRequest {
        let metadata = CallMetadata::new(CorrelationKey::new("generator", "1700000000000"), "generator")
            .with_account("acct");
        EnsembleRequest::new(
            vec![ChatMessage::user("name this flow")],
            models.iter().map(|m| m.to_string()).collect(),
            metadata,
        )
        .max_attempts(max_attempts)
    }

    fn records(store: &SqliteStore) -> Vec<LlmCallRecord> {
        let mut items = store
            .list_call_records("acct", None, PageRequest::default())
            .unwrap()
            .items;
        items.sort_by_key(|r| r.attempt);
        items
    }

    #[tokio::test]
    async fn falls_back_down_the_ladder() {
        let h = harness(
            ScriptedProvider::new()
                .fail("a", "rate limited")
                .fail("b", "HTTP 500")
                .text("c", "Daily digest"),
            &["a", "b", "c"],
        );

        let response = h.ensemble.call(request(&["a", "b", "c"], 4)).await.unwrap();
        assert_eq!(response.text, "Daily digest");
        assert_eq!(response.model, "c");
        assert_eq!(response.attempts, 3);
        assert_eq!(h.provider.called_models(), vec!["a", "b", "c"]);

        let recs = records(&h.store);
        assert_eq!(recs.len(), 3);
        assert_eq!(recs.iter().filter(|r| r.outcome.is_success()).count(), 1);
        assert_eq!(recs[2].model, "c");
        assert_eq!(recs[2].response_excerpt.as_deref(), Some("Daily digest"));
        for rec in &recs {
            assert_eq!(rec.metadata["generator"], "1700000000000");
            assert_eq!(rec.metadata["usecase"], "generator");
        }
    }

    #[tokio::test]
    async fn single_attempt_stops_after_first_model() {
        let h = harness(
            ScriptedProvider::new().fail("a", "down").text("b", "ok"),
            &["a", "b"],
        );

        let err = h.ensemble.call(request(&["a", "b"], 1)).await.unwrap_err();
        match err {
            FlowdError::EnsembleExhausted { attempts, last_error } => {
                assert_eq!(attempts, 1);
                assert!(last_error.contains("down"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.provider.called_models(), vec!["a"]);
        assert_eq!(records(&h.store).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wraps_to_top_with_backoff() {
        let h = harness(
            ScriptedProvider::new()
                .fail("a", "flaky")
                .text("a", "second time lucky")
                .fail("b", "down"),
            &["a", "b"],
        );

        let started = Instant::now();
        let response = h.ensemble.call(request(&["a", "b"], 3)).await.unwrap();
        assert_eq!(response.attempts, 3);
        assert_eq!(h.provider.called_models(), vec!["a", "b", "a"]);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_model_times_out_and_falls_back() {
        let h = harness(
            ScriptedProvider::new().reply("a", Reply::Hang).text("b", "fine"),
            &["a", "b"],
        );

        let response = h.ensemble.call(request(&["a", "b"], 2)).await.unwrap();
        assert_eq!(response.model, "b");
        let recs = records(&h.store);
        match &recs[0].outcome {
            CallOutcome::Failed { error } => assert!(error.contains("timed out")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_model_counts_as_failure() {
        let h = harness(ScriptedProvider::new().text("b", "ok"), &["b"]);
        let response = h.ensemble.call(request(&["ghost", "b"], 2)).await.unwrap();
        assert_eq!(response.model, "b");
        assert_eq!(records(&h.store).len(), 2);
    }

    #[tokio::test]
    async fn json_shape_rejects_prose() {
        let h = harness(
            ScriptedProvider::new()
                .text("a", "I think it should run daily.")
                .text("b", "```json\n{\"name\": \"Digest\"}\n```"),
            &["a", "b"],
        );

        let response = h
            .ensemble
            .call(request(&["a", "b"], 2).shape(ResponseShape::Json))
            .await
            .unwrap();
        assert_eq!(response.json.unwrap()["name"], "Digest");
        assert!(h.provider.requests().iter().all(|r| r.json_mode));
    }

    #[tokio::test]
    async fn validator_failure_advances_ladder() {
        let only_daily: Validator = Arc::new(|v: &Value| {
            if v["schedule"] == "daily" {
                Ok(())
            } else {
                Err(FlowdError::LlmParse("wrong schedule".into()))
            }
        });
        let h = harness(
            ScriptedProvider::new()
                .text("a", r#"{"schedule": "hourly"}"#)
                .text("b", r#"{"schedule": "daily"}"#),
            &["a", "b"],
        );

        let response = h
            .ensemble
            .call(request(&["a", "b"], 2).shape(ResponseShape::JsonWith(only_daily)))
            .await
            .unwrap();
        assert_eq!(response.model, "b");
    }

    #[tokio::test]
    async fn typed_call_deserializes() {
        #[derive(Deserialize)]
        struct Naming {
            name: String,
        }
        let h = harness(
            ScriptedProvider::new()
                .text("a", r#"{"title": "wrong key"}"#)
                .text("b", r#"{"name": "Inbox digest"}"#),
            &["a", "b"],
        );

        let (naming, response) = h
            .ensemble
            .call_typed::<Naming>(request(&["a", "b"], 2))
            .await
            .unwrap();
        assert_eq!(naming.name, "Inbox digest");
        assert_eq!(response.attempts, 2);
    }

    #[tokio::test]
    async fn enrich_tags_all_attempts_of_the_call() {
        let h = harness(
            ScriptedProvider::new().fail("a", "down").text("b", "ok"),
            &["a", "b"],
        );
        h.ensemble.call(request(&["a", "b"], 2)).await.unwrap();

        let other = CallMetadata::new(CorrelationKey::new("generator", "other"), "generator")
            .with_account("acct");
        h.ensemble
            .call(EnsembleRequest::new(vec![ChatMessage::user("x")], vec!["b".into()], other))
            .await
            .unwrap();

        let patch = json!({"flowId": "flow-9"}).as_object().cloned().unwrap();
        let touched = h
            .ensemble
            .enrich(&CorrelationKey::new("generator", "1700000000000"), &patch)
            .unwrap();
        assert_eq!(touched, 2);

        let tagged = records(&h.store)
            .into_iter()
            .filter(|r| r.metadata.get("flowId").is_some())
            .count();
        assert_eq!(tagged, 2);
    }

    struct BrokenRecords;

    impl CallRecordStore for BrokenRecords {
        fn insert_call_record(&self, _record: &LlmCallRecord) -> Result<()> {
            Err(FlowdError::Database("disk full".into()))
        }

        fn enrich_call_records(&self, _c: &CorrelationKey, _p: &Map<String, Value>) -> Result<usize> {
            Err(FlowdError::Database("disk full".into()))
        }

        fn list_call_records(
            &self,
            _account_id: &str,
            _flow_id: Option<&flowd_core::types::FlowId>,
            _page: PageRequest,
        ) -> Result<flowd_core::types::Page<LlmCallRecord>> {
            Err(FlowdError::Database("disk full".into()))
        }
    }

    #[tokio::test]
    async fn record_failures_surface() {
        let provider = Arc::new(ScriptedProvider::new().text("a", "ok"));
        let ensemble = Ensemble::new(
            ProviderRegistry::new().with_models(&["a"], provider),
            Arc::new(BrokenRecords),
        );
        let err = ensemble.call(request(&["a"], 1)).await.unwrap_err();
        assert!(matches!(err, FlowdError::Database(_)));
    }

    #[tokio::test]
    async fn rejects_degenerate_requests() {
        let h = harness(ScriptedProvider::new(), &[]);
        assert!(matches!(
            h.ensemble.call(request(&[], 3)).await,
            Err(FlowdError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.ensemble.call(request(&["a"], 0)).await,
            Err(FlowdError::InvalidArgument(_))
        ));
    }
}
