use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use planwise_core::config::{AgentConfig, ModelConfig};
use planwise_core::error::{PlanwiseError, Result};
use planwise_core::traits::LlmClient;
use planwise_core::types::*;
use planwise_core::usage::TokenUsage;
use planwise_tools::ToolRegistry;

/// Accumulator for streaming tool call deltas.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

impl ToolCallAccumulator {
    fn input(&self) -> serde_json::Value {
        if self.input_json.trim().is_empty() {
            return serde_json::json!({});
        }
        serde_json::from_str(&self.input_json).unwrap_or_else(|e| {
            warn!(tool = %self.name, error = %e, "Tool input is not valid JSON");
            serde_json::Value::Null
        })
    }
}

/// A single agent: a system prompt, a model, a tool set and its own
/// conversation. Runs a streaming ReAct loop per message.
pub struct AgentRuntime {
    name: String,
    system_prompt: String,
    model: ModelConfig,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    working_dir: PathBuf,
    max_turns: usize,
    max_tool_output_chars: usize,
    messages: Vec<ChatMessage>,
}

impl AgentRuntime {
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        model: ModelConfig,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let defaults = AgentConfig::default();
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            model,
            llm,
            tools: Arc::new(ToolRegistry::new()),
            working_dir: PathBuf::from("."),
            max_turns: defaults.max_turns,
            max_tool_output_chars: defaults.max_tool_output_chars,
            messages: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_limits(mut self, config: &AgentConfig) -> Self {
        self.max_turns = config.max_turns;
        self.max_tool_output_chars = config.max_tool_output_chars;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The conversation so far, without the system prompt.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Send `message` and loop until the model stops calling tools.
    ///
    /// Every text chunk, reasoning chunk, tool call, tool result and usage
    /// report is sent on `events`, tagged with this agent's name and `source`.
    /// Returns the text of the final assistant turn.
    pub async fn run(
        &mut self,
        message: &str,
        source: &str,
        events: &UnboundedSender<AgentEvent>,
    ) -> Result<String> {
        let emit = |kind: EventKind| {
            // The receiver may have gone away; the run still completes
            let _ = events.send(AgentEvent::new(self.name.clone(), source, kind));
        };

        self.messages.push(ChatMessage::user(message));

        let tool_defs = self.tools.definitions();
        let tool_ctx = ToolContext {
            agent_name: self.name.clone(),
            working_dir: self.working_dir.clone(),
            events: Some(events.clone()),
        };
        let mut run_usage = TokenUsage::default();

        for turn in 0..self.max_turns {
            debug!(agent = %self.name, turn, "Starting agent turn");

            let mut request = Vec::with_capacity(self.messages.len() + 1);
            request.push(ChatMessage::system(self.system_prompt.clone()));
            request.extend(self.messages.iter().cloned());

            let mut stream = self
                .llm
                .chat_stream(&self.model, request, &tool_defs)
                .await?;

            let mut text_content = String::new();
            let mut thinking_content = String::new();
            let mut thinking_signature = None;
            let mut tool_calls: Vec<ToolCallAccumulator> = Vec::new();
            let mut stop_reason = None;

            while let Some(delta) = stream.next().await {
                match delta? {
                    StreamDelta::TextDelta(text) => {
                        emit(EventKind::TextChunk(text.clone()));
                        text_content.push_str(&text);
                    }
                    StreamDelta::ThinkingDelta(text) => {
                        emit(EventKind::Reasoning(text.clone()));
                        thinking_content.push_str(&text);
                    }
                    StreamDelta::ThinkingSignature(sig) => {
                        thinking_signature = Some(sig);
                    }
                    StreamDelta::ToolUseStart { index, id, name } => {
                        while tool_calls.len() <= index {
                            tool_calls.push(ToolCallAccumulator::default());
                        }
                        tool_calls[index].id = id;
                        tool_calls[index].name = name;
                    }
                    StreamDelta::ToolInputDelta { index, delta } => {
                        if let Some(tc) = tool_calls.get_mut(index) {
                            tc.input_json.push_str(&delta);
                        }
                    }
                    StreamDelta::Stop(reason) => stop_reason = Some(reason),
                    StreamDelta::Usage(usage) => {
                        run_usage += usage;
                        emit(EventKind::TokenUsage(usage));
                    }
                    StreamDelta::MessageId(_) => {}
                }
            }
            drop(stream);

            // Providers may leave gaps in the index space
            tool_calls.retain(|tc| !tc.name.is_empty());

            let mut content_blocks = Vec::new();
            if !thinking_content.is_empty() {
                content_blocks.push(ContentBlock::Thinking {
                    thinking: thinking_content,
                    signature: thinking_signature,
                });
            }
            if !text_content.is_empty() {
                content_blocks.push(ContentBlock::Text {
                    text: text_content.clone(),
                });
            }
            let inputs: Vec<serde_json::Value> = tool_calls.iter().map(|tc| tc.input()).collect();
            for (tc, input) in tool_calls.iter().zip(&inputs) {
                content_blocks.push(ContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    input: input.clone(),
                });
            }

            self.messages.push(ChatMessage {
                role: Role::Assistant,
                content: content_blocks,
                timestamp: Some(chrono::Utc::now()),
            });

            if tool_calls.is_empty() {
                if stop_reason == Some(StopReason::MaxTokens) {
                    warn!(agent = %self.name, "LLM hit max tokens");
                }
                info!(
                    agent = %self.name,
                    turns = turn + 1,
                    input_tokens = run_usage.input_tokens,
                    output_tokens = run_usage.output_tokens,
                    "Agent run complete"
                );
                return Ok(text_content);
            }

            let mut result_blocks = Vec::with_capacity(tool_calls.len());
            for (tc, input) in tool_calls.iter().zip(inputs) {
                emit(EventKind::ToolUse {
                    name: tc.name.clone(),
                    input: input.clone(),
                });

                let result = match self.tools.execute(&tc.name, input, tool_ctx.clone()).await {
                    Ok(r) => r,
                    Err(e) => {
                        error!(agent = %self.name, tool = %tc.name, error = %e, "Tool execution failed");
                        ToolResult::error(e.to_string())
                    }
                };
                let result = ToolResult {
                    content: clip(&result.content, self.max_tool_output_chars),
                    is_error: result.is_error,
                };

                emit(EventKind::ToolResult {
                    name: tc.name.clone(),
                    result: result.clone(),
                });

                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: tc.id.clone(),
                    content: result.content,
                    is_error: result.is_error,
                });
            }

            self.messages.push(ChatMessage {
                role: Role::User,
                content: result_blocks,
                timestamp: Some(chrono::Utc::now()),
            });
        }

        Err(PlanwiseError::MaxTurnsExceeded(self.max_turns))
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}\n... (truncated)", &text[..end]),
        None => text.to_string(),
    }
}
