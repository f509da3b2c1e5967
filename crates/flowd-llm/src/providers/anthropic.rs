use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use flowd_core::config::ProviderConfig;
use flowd_core::error::{FlowdError, Result};
use flowd_core::traits::{CompletionProvider, CompletionRequest};
use flowd_core::types::{ChatMessage, Role};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client.
pub struct AnthropicProvider {
    http: Client,
    name: String,
    base_url: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnthropicProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                FlowdError::Config(format!("provider '{}' needs an api_key", config.name))
            })?;
        Ok(Self {
            http: Client::new(),
            name: config.name.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_API_URL.to_string()),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

// Anthropic API request types
#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Serialize, Debug, PartialEq)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

// Anthropic API response types
#[derive(Deserialize, Debug)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

/// System messages are lifted into the top-level `system` field; consecutive
/// messages with the same role are merged since the API requires alternation.
fn convert_messages(messages: Vec<ChatMessage>) -> (Option<String>, Vec<ApiMessage>) {
    let mut system = Vec::new();
    let mut out: Vec<ApiMessage> = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::System => {
                system.push(msg.content);
                continue;
            }
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        match out.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&msg.content);
            }
            _ => out.push(ApiMessage {
                role,
                content: msg.content,
            }),
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, out)
}

impl CompletionProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let (system, messages) = convert_messages(request.messages);
            let body = AnthropicRequest {
                model: request.model.clone(),
                max_tokens: self.max_tokens,
                temperature: (self.temperature > 0.0).then_some(self.temperature),
                messages,
                system,
            };

            let response = self
                .http
                .post(&self.base_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(|e| FlowdError::ProviderFailure {
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

            let parsed: AnthropicResponse =
                serde_json::from_str(&text).map_err(|e| FlowdError::ProviderFailure {
                    model: request.model.clone(),
                    message: format!("malformed response: {}", e),
                })?;
            let joined: String = parsed
                .content
                .into_iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text),
                    ContentBlock::Other => None,
                })
                .collect();

            debug!(provider = %self.name, model = %request.model, "Completion received");
            if joined.trim().is_empty() {
                return Err(FlowdError::ProviderFailure {
                    model: request.model,
                    message: "empty completion".into(),
                });
            }
            Ok(joined)
        })
    }
}
