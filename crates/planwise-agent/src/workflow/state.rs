use serde::{Deserialize, Serialize};

use planwise_core::types::{ChatMessage, ContentBlock};
use planwise_core::usage::TokenUsage;

/// One line of the run's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub agent: String,
    pub message: String,
}

/// The user's ask as the coordinator receives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRequest {
    pub request: String,
    pub request_prompt: String,
}

impl WorkflowRequest {
    /// Wrap a raw query in the coordinator's request framing.
    pub fn new(query: impl Into<String>) -> Self {
        let request = query.into();
        let request_prompt = format!("Here is a user request: <user_request>{request}</user_request>");
        Self {
            request,
            request_prompt,
        }
    }
}

/// Everything the nodes of one workflow run share.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    pub request: String,
    pub request_prompt: String,
    /// Conversation handed to the next node. Each node replaces it.
    pub messages: Vec<ChatMessage>,
    history: Vec<HistoryEntry>,
    pub full_plan: String,
    pub plan_revision_requested: bool,
    pub plan_feedback: String,
    pub plan_revision_count: u32,
    /// Findings reported back by worker tools.
    pub clues: String,
    pub token_usage: TokenUsage,
}

impl SharedState {
    pub fn new(request: &WorkflowRequest) -> Self {
        Self {
            request: request.request.clone(),
            request_prompt: request.request_prompt.clone(),
            ..Default::default()
        }
    }

    /// Append-only audit trail, oldest first.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn push_history(&mut self, agent: impl Into<String>, message: impl Into<String>) {
        self.history.push(HistoryEntry {
            agent: agent.into(),
            message: message.into(),
        });
    }

    /// Most recent history entry written by `agent`.
    pub fn last_entry_from(&self, agent: &str) -> Option<&HistoryEntry> {
        self.history.iter().rev().find(|e| e.agent == agent)
    }

    /// Last text block of the last message, or empty.
    pub fn last_message_text(&self) -> String {
        self.messages
            .last()
            .and_then(|m| {
                m.content.iter().rev().find_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    _ => None,
                })
            })
            .unwrap_or_default()
    }
}

/// Per-run context threaded through every node.
///
/// Starts empty; the coordinator creates the shared state.
#[derive(Debug, Default)]
pub struct WorkflowContext {
    pub shared: Option<SharedState>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_prompt_framing() {
        let req = WorkflowRequest::new("analyse sales");
        assert_eq!(req.request, "analyse sales");
        assert_eq!(
            req.request_prompt,
            "Here is a user request: <user_request>analyse sales</user_request>"
        );
    }

    #[test]
    fn test_history_is_append_only() {
        let mut state = SharedState::new(&WorkflowRequest::new("q"));
        state.push_history("coordinator", "hi");
        let snapshot = state.history().to_vec();

        state.push_history("planner", "plan");
        state.push_history("coordinator", "again");

        assert_eq!(&state.history()[..1], &snapshot[..]);
        assert_eq!(state.history().len(), 3);
        assert_eq!(state.last_entry_from("coordinator").unwrap().message, "again");
        assert!(state.last_entry_from("supervisor").is_none());
    }

    #[test]
    fn test_last_message_text() {
        let mut state = SharedState::default();
        assert_eq!(state.last_message_text(), "");
        state.messages = vec![ChatMessage::user("first"), ChatMessage::assistant_text("second")];
        assert_eq!(state.last_message_text(), "second");
    }

    #[test]
    fn test_history_entry_serializes() {
        let entry = HistoryEntry {
            agent: "planner".into(),
            message: "1. load".into(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json, serde_json::json!({"agent": "planner", "message": "1. load"}));
    }
}
