use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use planwise_core::config::ModelConfig;
use planwise_core::error::{PlanwiseError, Result};
use planwise_core::traits::LlmClient;
use planwise_core::types::*;
use planwise_core::usage::TokenUsage;

use crate::streaming::{SseEvent, SseStream};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
}

impl AnthropicClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
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
    system: Option<serde_json::Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
}

#[derive(Serialize)]
struct ThinkingConfig {
    r#type: String,
    budget_tokens: u32,
}

#[derive(Serialize, Debug)]
struct ApiMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Serialize, Debug)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<serde_json::Value>,
}

fn ephemeral() -> serde_json::Value {
    serde_json::json!({ "type": "ephemeral" })
}

// Anthropic API response types
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
#[allow(dead_code)]
enum SseData {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageInfo },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { index: usize, content_block: ContentBlockInfo },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: DeltaInfo },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta { delta: MessageDeltaInfo, usage: Option<UsageInfo> },
    #[serde(rename = "message_stop")]
    MessageStop {},
    #[serde(rename = "ping")]
    Ping {},
    #[serde(rename = "error")]
    Error { error: ApiError },
}

#[derive(Deserialize, Debug)]
struct MessageInfo {
    id: String,
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

impl UsageInfo {
    fn into_usage(self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens).with_cache(
            self.cache_read_input_tokens.unwrap_or(0),
            self.cache_creation_input_tokens.unwrap_or(0),
        )
    }
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
#[allow(dead_code)]
enum ContentBlockInfo {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "redacted_thinking")]
    RedactedThinking {},
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum DeltaInfo {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "signature_delta")]
    SignatureDelta { signature: String },
}

#[derive(Deserialize, Debug)]
struct MessageDeltaInfo {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

fn convert_messages(messages: Vec<ChatMessage>) -> (Option<String>, Vec<ApiMessage>) {
    let mut system = None;
    let mut api_msgs = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::System => {
                system = Some(msg.text());
                continue;
            }
            Role::Assistant => "assistant",
            // Tool results are sent as user messages in Anthropic API
            Role::User | Role::Tool => "user",
        };
        api_msgs.push(ApiMessage {
            role: role.to_string(),
            content: convert_content_blocks(&msg.content),
        });
    }

    (system, api_msgs)
}

fn convert_content_blocks(blocks: &[ContentBlock]) -> serde_json::Value {
    if let [ContentBlock::Text { text }] = blocks {
        return serde_json::Value::String(text.clone());
    }

    let api_blocks: Vec<serde_json::Value> = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(serde_json::json!({
                "type": "text",
                "text": text,
            })),
            ContentBlock::ToolUse { id, name, input } => Some(serde_json::json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            })),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(serde_json::json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            })),
            // The API rejects thinking blocks it cannot verify
            ContentBlock::Thinking {
                thinking,
                signature: Some(signature),
            } => Some(serde_json::json!({
                "type": "thinking",
                "thinking": thinking,
                "signature": signature,
            })),
            ContentBlock::Thinking { signature: None, .. } => None,
        })
        .collect();

    serde_json::Value::Array(api_blocks)
}

fn build_system(system: Option<String>, cache: bool) -> Option<serde_json::Value> {
    let text = system?;
    if cache {
        Some(serde_json::json!([{
            "type": "text",
            "text": text,
            "cache_control": ephemeral(),
        }]))
    } else {
        Some(serde_json::Value::String(text))
    }
}

fn build_tools(tools: &[ToolDefinition], cache: bool) -> Vec<ApiTool> {
    let last = tools.len().saturating_sub(1);
    tools
        .iter()
        .enumerate()
        .map(|(i, t)| ApiTool {
            name: t.name.clone(),
            description: t.description.clone(),
            input_schema: t.input_schema.clone(),
            // A breakpoint on the last tool caches the whole tool list
            cache_control: (cache && i == last).then(ephemeral),
        })
        .collect()
}

fn parse_sse_to_deltas(event: SseEvent) -> Vec<Result<StreamDelta>> {
    if event.data.trim() == "[DONE]" {
        return vec![];
    }

    let parsed: std::result::Result<SseData, _> = serde_json::from_str(&event.data);
    match parsed {
        Ok(data) => match data {
            SseData::MessageStart { message } => {
                let mut deltas = vec![Ok(StreamDelta::MessageId(message.id))];
                if let Some(usage) = message.usage {
                    deltas.push(Ok(StreamDelta::Usage(usage.into_usage())));
                }
                deltas
            }
            SseData::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlockInfo::ToolUse { id, name } => {
                    vec![Ok(StreamDelta::ToolUseStart { index, id, name })]
                }
                _ => vec![],
            },
            SseData::ContentBlockDelta { index, delta } => match delta {
                DeltaInfo::TextDelta { text } => vec![Ok(StreamDelta::TextDelta(text))],
                DeltaInfo::InputJsonDelta { partial_json } => {
                    vec![Ok(StreamDelta::ToolInputDelta {
                        index,
                        delta: partial_json,
                    })]
                }
                DeltaInfo::ThinkingDelta { thinking } => {
                    vec![Ok(StreamDelta::ThinkingDelta(thinking))]
                }
                DeltaInfo::SignatureDelta { signature } => {
                    vec![Ok(StreamDelta::ThinkingSignature(signature))]
                }
            },
            SseData::ContentBlockStop { .. } => vec![],
            SseData::MessageDelta { delta, usage } => {
                let mut deltas = Vec::new();
                if let Some(usage) = usage {
                    debug!(output_tokens = usage.output_tokens, "Token usage");
                    // Input side was already reported by message_start
                    deltas.push(Ok(StreamDelta::Usage(TokenUsage::new(
                        0,
                        usage.output_tokens,
                    ))));
                }
                let stop = match delta.stop_reason.as_deref() {
                    Some("end_turn") => Some(StopReason::EndTurn),
                    Some("tool_use") => Some(StopReason::ToolUse),
                    Some("max_tokens") => Some(StopReason::MaxTokens),
                    Some("stop_sequence") => Some(StopReason::StopSequence),
                    _ => None,
                };
                if let Some(s) = stop {
                    deltas.push(Ok(StreamDelta::Stop(s)));
                }
                deltas
            }
            SseData::MessageStop {} | SseData::Ping {} => vec![],
            SseData::Error { error } => vec![Err(PlanwiseError::LlmStream(error.message))],
        },
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse SSE data");
            vec![]
        }
    }
}

impl LlmClient for AnthropicClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();
        let tools = tools.to_vec();

        Box::pin(async move {
            let api_key = config
                .api_key
                .as_deref()
                .ok_or_else(|| PlanwiseError::Config("Anthropic API key not set".into()))?;

            let base_url = config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);

            let (system, api_messages) = convert_messages(messages);

            let thinking = if config.thinking != ThinkingLevel::Off {
                Some(ThinkingConfig {
                    r#type: "enabled".to_string(),
                    budget_tokens: config.thinking.budget_tokens(),
                })
            } else {
                None
            };

            let body = AnthropicRequest {
                model: config.model_id.clone(),
                max_tokens: config.max_tokens,
                // Must NOT send temperature when thinking is enabled (Anthropic constraint)
                temperature: if thinking.is_some() || config.temperature <= 0.0 {
                    None
                } else {
                    Some(config.temperature)
                },
                messages: api_messages,
                system: build_system(system, config.prompt_cache),
                stream: true,
                tools: build_tools(&tools, config.tool_cache),
                thinking,
            };

            let mut req = self
                .http
                .post(base_url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json");

            for (k, v) in &config.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req
                .json(&body)
                .send()
                .await
                .map_err(|e| PlanwiseError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(PlanwiseError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let sse_stream = SseStream::new(response.bytes_stream());

            let delta_stream = sse_stream
                .map(|event| futures::stream::iter(parse_sse_to_deltas(event)))
                .flatten();

            Ok(Box::pin(delta_stream) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_message_start_reports_cache_usage() {
        let deltas = parse_sse_to_deltas(event(
            r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":12,"output_tokens":1,"cache_creation_input_tokens":300,"cache_read_input_tokens":4000}}}"#,
        ));
        assert_eq!(deltas.len(), 2);
        assert_eq!(
            deltas[0].as_ref().unwrap(),
            &StreamDelta::MessageId("msg_1".into())
        );
        assert_eq!(
            deltas[1].as_ref().unwrap(),
            &StreamDelta::Usage(TokenUsage::new(12, 1).with_cache(4000, 300))
        );
    }

    #[test]
    fn test_message_delta_usage_and_stop() {
        let deltas = parse_sse_to_deltas(event(
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":42}}"#,
        ));
        assert_eq!(deltas.len(), 2);
        assert_eq!(
            deltas[0].as_ref().unwrap(),
            &StreamDelta::Usage(TokenUsage::new(0, 42))
        );
        assert_eq!(
            deltas[1].as_ref().unwrap(),
            &StreamDelta::Stop(StopReason::ToolUse)
        );
    }

    #[test]
    fn test_thinking_and_signature_deltas() {
        let thinking = parse_sse_to_deltas(event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
        ));
        assert_eq!(
            thinking[0].as_ref().unwrap(),
            &StreamDelta::ThinkingDelta("hmm".into())
        );

        let signature = parse_sse_to_deltas(event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig"}}"#,
        ));
        assert_eq!(
            signature[0].as_ref().unwrap(),
            &StreamDelta::ThinkingSignature("sig".into())
        );
    }

    #[test]
    fn test_error_event() {
        let deltas = parse_sse_to_deltas(event(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ));
        assert!(matches!(deltas[0], Err(PlanwiseError::LlmStream(ref m)) if m == "Overloaded"));
    }

    #[test]
    fn test_tool_cache_marks_last_tool_only() {
        let defs = vec![
            ToolDefinition {
                name: "coder".into(),
                description: "d".into(),
                input_schema: serde_json::json!({}),
            },
            ToolDefinition {
                name: "reporter".into(),
                description: "d".into(),
                input_schema: serde_json::json!({}),
            },
        ];
        let tools = build_tools(&defs, true);
        assert!(tools[0].cache_control.is_none());
        assert!(tools[1].cache_control.is_some());

        let tools = build_tools(&defs, false);
        assert!(tools.iter().all(|t| t.cache_control.is_none()));
    }

    #[test]
    fn test_cached_system_prompt_is_block_list() {
        let system = build_system(Some("be brief".into()), true).unwrap();
        assert_eq!(system[0]["cache_control"]["type"], "ephemeral");
        assert_eq!(system[0]["text"], "be brief");

        let plain = build_system(Some("be brief".into()), false).unwrap();
        assert_eq!(plain, serde_json::Value::String("be brief".into()));
    }

    #[test]
    fn test_unsigned_thinking_is_dropped() {
        let blocks = vec![
            ContentBlock::Thinking {
                thinking: "draft".into(),
                signature: None,
            },
            ContentBlock::Text { text: "answer".into() },
        ];
        let value = convert_content_blocks(&blocks);
        let arr = value.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["type"], "text");
    }

    #[test]
    fn test_system_message_is_lifted() {
        let (system, msgs) = convert_messages(vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
        ]);
        assert_eq!(system.as_deref(), Some("sys"));
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[0].content, serde_json::Value::String("hi".into()));
    }
}
