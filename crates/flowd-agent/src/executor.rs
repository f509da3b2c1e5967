use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use flowd_core::call::{CallMetadata, CorrelationKey};
use flowd_core::config::EnsembleConfig;
use flowd_core::error::Result;
use flowd_core::step::{RunOutcome, Step, StepContext};
use flowd_core::traits::StepExecutor;
use flowd_core::types::ChatMessage;
use flowd_llm::{Ensemble, EnsembleRequest};

const NODE_NAME: &str = "respond";
const USECASE: &str = "run_step";

const SYSTEM_PROMPT: &str = r#"You carry out a user's recurring task. Reply with one JSON object and nothing else.

If you cannot finish without information only the user has, reply:
{"action": "ask_user", "question": "<one short question>"}

Otherwise reply:
{"action": "finish", "output": "<result for the user>", "structured_output": {<optional fields>}, "reasoning": "<optional>"}"#;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Decision {
    AskUser {
        question: String,
    },
    Finish {
        output: String,
        #[serde(default)]
        structured_output: Map<String, Value>,
        #[serde(default)]
        reasoning: Option<String>,
    },
}

/// Step executor that asks the model ensemble what a run should do next.
///
/// Every run gets a single `respond` node. Each step sends the task and the
/// conversation so far; the model either asks the user a question at node
/// level or finishes the run.
pub struct LlmStepExecutor {
    ensemble: Arc<Ensemble>,
    models: Vec<String>,
    max_attempts: u32,
}

impl LlmStepExecutor {
    pub fn new(ensemble: Arc<Ensemble>, config: &EnsembleConfig) -> Self {
        Self {
            ensemble,
            models: config.models.clone(),
            max_attempts: config.max_attempts,
        }
    }

    fn messages(ctx: &StepContext) -> Vec<ChatMessage> {
        let mut task = format!("Task: {}", ctx.run.input);
        if let Some(init) = &ctx.flow.metadata.init_message {
            task.push_str(&format!("\nInstructions: {}", init));
        }
        if !ctx.flow.metadata.agent_codes.is_empty() {
            task.push_str(&format!(
                "\nAvailable agents: {}",
                ctx.flow.metadata.agent_codes.join(", ")
            ));
        }
        if let Some(payload) = ctx.run.trigger_input.as_ref().and_then(|t| t.payload.as_ref()) {
            task.push_str(&format!("\nTrigger payload: {}", payload));
        }

        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(task)];
        messages.extend(ctx.run.conversation.iter().cloned());
        if let Some(node) = &ctx.node {
            messages.extend(node.conversation.iter().cloned());
        }
        messages
    }
}

impl StepExecutor for LlmStepExecutor {
    fn step(&self, ctx: StepContext) -> BoxFuture<'_, Result<Step>> {
        Box::pin(async move {
            let Some(node) = &ctx.node else {
                return Ok(Step::StartNode {
                    name: NODE_NAME.to_string(),
                    input: json!({ "task": ctx.run.input }),
                });
            };

            let metadata = CallMetadata::new(CorrelationKey::new("runId", ctx.run.id.as_str()), USECASE)
                .with_account(&ctx.run.account_id)
                .with_extra("flowId", Value::String(ctx.flow.id.to_string()))
                .with_extra("nodeId", Value::String(node.id.to_string()));
            let request = EnsembleRequest::new(Self::messages(&ctx), self.models.clone(), metadata)
                .max_attempts(self.max_attempts);

            let (decision, response) = self.ensemble.call_typed::<Decision>(request).await?;
            debug!(run_id = %ctx.run.id, model = %response.model, attempts = response.attempts, "Step decided");

            Ok(match decision {
                Decision::AskUser { question } => Step::ask_node(question),
                Decision::Finish {
                    output,
                    structured_output,
                    reasoning,
                } => Step::Finish(RunOutcome {
                    output: Some(output),
                    structured_output,
                    reasoning,
                }),
            })
        })
    }
}
