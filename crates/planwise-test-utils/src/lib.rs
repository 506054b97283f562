//! Shared test utilities: a scripted LLM client and config fixtures.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use planwise_core::config::{AppConfig, ModelConfig};
use planwise_core::error::{PlanwiseError, Result};
use planwise_core::traits::LlmClient;
use planwise_core::types::*;
use planwise_core::usage::TokenUsage;

/// A request seen by [`MockLlmClient`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub model: ModelConfig,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<String>,
}

impl RecordedRequest {
    /// Text of the system prompt, if one was sent.
    pub fn system(&self) -> Option<String> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.text())
    }

    /// Text of the last user message that carries text.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::User)
            .map(|m| m.text())
            .find(|t| !t.is_empty())
    }
}

/// LLM client that replays scripted turns in order, one per `chat_stream` call.
#[derive(Default)]
pub struct MockLlmClient {
    turns: Mutex<VecDeque<Vec<StreamDelta>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockLlmClient {
    pub fn new(turns: Vec<Vec<StreamDelta>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_turn(&self, turn: Vec<StreamDelta>) {
        self.turns.lock().unwrap().push_back(turn);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().unwrap().len()
    }
}

impl LlmClient for MockLlmClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.requests.lock().unwrap().push(RecordedRequest {
            model: config.clone(),
            messages,
            tools: tools.iter().map(|t| t.name.clone()).collect(),
        });
        let turn = self.turns.lock().unwrap().pop_front();

        Box::pin(async move {
            let turn =
                turn.ok_or_else(|| PlanwiseError::LlmRequest("mock script exhausted".into()))?;
            let stream = futures::stream::iter(turn.into_iter().map(Ok));
            Ok(Box::pin(stream) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

/// A turn that streams `text` in two chunks and ends the conversation.
pub fn text_turn(text: &str) -> Vec<StreamDelta> {
    let mid = text
        .char_indices()
        .nth(text.chars().count() / 2)
        .map(|(i, _)| i)
        .unwrap_or(0);
    vec![
        StreamDelta::Usage(TokenUsage::new(10, 0)),
        StreamDelta::TextDelta(text[..mid].to_string()),
        StreamDelta::TextDelta(text[mid..].to_string()),
        StreamDelta::Usage(TokenUsage::new(0, 5)),
        StreamDelta::Stop(StopReason::EndTurn),
    ]
}

/// A turn that calls one tool with `input`.
pub fn tool_turn(id: &str, name: &str, input: serde_json::Value) -> Vec<StreamDelta> {
    vec![
        StreamDelta::Usage(TokenUsage::new(10, 0)),
        StreamDelta::ToolUseStart {
            index: 0,
            id: id.to_string(),
            name: name.to_string(),
        },
        StreamDelta::ToolInputDelta {
            index: 0,
            delta: input.to_string(),
        },
        StreamDelta::Usage(TokenUsage::new(0, 5)),
        StreamDelta::Stop(StopReason::ToolUse),
    ]
}

/// Config pointing at a fake provider, with tools running in `working_dir`.
pub fn test_config(working_dir: &Path) -> AppConfig {
    let raw = format!(
        r#"
[model]
provider = "mock"
model_id = "mock-model"

[agent]
max_turns = 8
working_dir = "{}"

[workflow]
max_plan_revisions = 3
clean_artifacts = false

[tools]
python_bin = "sh"
"#,
        working_dir.display()
    );
    toml::from_str(&raw).expect("fixture config parses")
}
