use serde_json::{Map, Value};

use crate::types::{Flow, Node, Run};

/// What a run step executor sees when asked for the next step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub flow: Flow,
    pub run: Run,
    /// The live node, if the run is working on one.
    pub node: Option<Node>,
    /// Number of steps already applied to this run by the current process.
    pub step_index: usize,
}

/// Who a question is addressed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskScope {
    Run,
    /// The live node asks; fails if there is none.
    Node,
}

/// Final result of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub output: Option<String>,
    pub structured_output: Map<String, Value>,
    pub reasoning: Option<String>,
}

/// One instruction returned by a step executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Complete the current node (if any) and make a new one live.
    StartNode { name: String, input: Value },
    /// Update the free-text progress line of the live node, or of the run.
    LiveStatus(String),
    /// Mark the live node completed.
    CompleteNode { output: Value },
    /// Pause and wait for a human answer.
    AskUser {
        scope: AskScope,
        prompt: Map<String, Value>,
    },
    /// Finish the run successfully.
    Finish(RunOutcome),
    /// Record partial structured output without finishing.
    Merge(Map<String, Value>),
}

impl Step {
    pub fn ask_run(question: impl Into<String>) -> Self {
        Self::AskUser {
            scope: AskScope::Run,
            prompt: question_prompt(question),
        }
    }

    pub fn ask_node(question: impl Into<String>) -> Self {
        Self::AskUser {
            scope: AskScope::Node,
            prompt: question_prompt(question),
        }
    }

    pub fn finish(output: impl Into<String>) -> Self {
        Self::Finish(RunOutcome {
            output: Some(output.into()),
            ..RunOutcome::default()
        })
    }
}

fn question_prompt(question: impl Into<String>) -> Map<String, Value> {
    let mut prompt = Map::new();
    prompt.insert("question".into(), Value::String(question.into()));
    prompt
}
