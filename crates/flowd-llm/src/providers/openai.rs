use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use flowd_core::config::ProviderConfig;
use flowd_core::error::{FlowdError, Result};
use flowd_core::traits::{CompletionProvider, CompletionRequest};
use flowd_core::types::{ChatMessage, Role};

use super::presets::{all_preset_names, build_extra_headers, get_preset};

/// OpenAI-compatible client. Works with OpenAI, DeepSeek, Groq, OpenRouter, Gemini's
/// compatibility endpoint, Ollama, vLLM, etc.
pub struct OpenAiProvider {
    http: Client,
    name: String,
    base_url: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
    extra_headers: Vec<(String, String)>,
}

impl OpenAiProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let preset = get_preset(&config.provider);
        let base_url = match (&config.base_url, &preset) {
            (Some(url), _) => url.clone(),
            (None, Some(preset)) => preset.default_base_url.to_string(),
            (None, None) => {
                return Err(FlowdError::Config(format!(
                    "provider '{}' uses unknown preset '{}' without a base_url (known: anthropic, {})",
                    config.name,
                    config.provider,
                    all_preset_names().collect::<Vec<_>>().join(", ")
                )))
            }
        };
        let needs_key = preset.as_ref().map(|p| p.needs_api_key).unwrap_or(true);
        if needs_key && config.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(FlowdError::Config(format!(
                "provider '{}' needs an api_key",
                config.name
            )));
        }
        let extra_headers = match &preset {
            Some(preset) => build_extra_headers(preset, &config.extra_headers),
            None => config
                .extra_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };

        Ok(Self {
            http: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| FlowdError::Config(e.to_string()))?,
            name: config.name.clone(),
            base_url,
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            extra_headers,
        })
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Serialize)]
pub(crate) struct OaiMessage {
    role: &'static str,
    content: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub(crate) fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    messages
        .into_iter()
        .map(|msg| OaiMessage {
            role: match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: msg.content,
        })
        .collect()
}

fn extract_text(model: &str, body: &str) -> Result<String> {
    let parsed: ChatResponse = serde_json::from_str(body).map_err(|e| FlowdError::ProviderFailure {
        model: model.to_string(),
        message: format!("malformed response: {}", e),
    })?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| FlowdError::ProviderFailure {
            model: model.to_string(),
            message: "empty completion".into(),
        })
}

impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            // o-series models reject temperature
            let is_o_series = request.model.starts_with("o1")
                || request.model.starts_with("o3")
                || request.model.starts_with("o4");

            let body = ChatRequest {
                model: request.model.clone(),
                messages: convert_messages(request.messages),
                max_tokens: self.max_tokens,
                temperature: if is_o_series || self.temperature <= 0.0 {
                    None
                } else {
                    Some(self.temperature)
                },
                stream: false,
                response_format: request
                    .json_mode
                    .then_some(ResponseFormat { r#type: "json_object" }),
            };

            let mut req = self.http.post(&self.base_url).json(&body);

            if let Some(api_key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            // Apply extra headers from config (set by presets or user)
            for (k, v) in &self.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req.send().await.map_err(|e| FlowdError::ProviderFailure {
                model: request.model.clone(),
                message: e.to_string(),
            })?;

            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            if !status.is_success() {
                return Err(FlowdError::ProviderFailure {
                    model: request.model,
                    message: format!("HTTP {}: {}", status, text),
                });
            }

            debug!(provider = %self.name, model = %request.model, "Completion received");
            extract_text(&request.model, &text)
        })
    }
}
