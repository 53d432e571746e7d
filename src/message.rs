//! Conversation content blocks, messages, and the ordered session state.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A single block of content inside a message.
///
/// Tagged by `type` so the wire representation matches the rest of the
/// event/transport layer (see `api::sse`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    UserText {
        text: String,
    },
    AssistantText {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    /// Visible reasoning emitted by the model. Preserved verbatim through
    /// compaction as an opaque continuation token.
    Thinking {
        text: String,
    },
    /// Reasoning the provider returned in redacted form. Never rendered,
    /// never summarized, carried through untouched so the provider can
    /// verify the chain of thought on a later turn.
    RedactedThinking {
        opaque_bytes: String,
    },
}

impl ContentBlock {
    pub fn is_tool_call(&self) -> bool {
        matches!(self, ContentBlock::ToolCall { .. })
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            ContentBlock::ToolCall { id, .. } | ContentBlock::ToolResult { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Who produced a message. Messages must strictly alternate `User`/`Assistant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::UserText { text: text.into() }],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    pub fn tool_result(id: impl Into<String>, name: impl Into<String>, output: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::ToolResult {
                id: id.into(),
                name: name.into(),
                output: output.into(),
                is_error,
            }],
        }
    }

    pub fn tool_calls(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall { id, name, input } => Some((id.as_str(), name.as_str(), input)),
                _ => None,
            })
            .collect()
    }
}

/// The ordered conversation history plus counters for one session.
///
/// Every `ToolCall` block is followed, before the next
/// `UserText`/`AssistantText`-only message, by a `ToolResult` block
/// carrying the same `id`. `role` strictly alternates `User`,
/// `Assistant`, `User`, ... across `messages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    pub messages: Vec<Message>,
    pub turn_count: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl State {
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// IDs of every `ToolCall` that has not yet been answered by a matching
    /// `ToolResult`, in the order they appear.
    pub fn unanswered_tool_calls(&self) -> Vec<String> {
        let mut open: Vec<String> = Vec::new();
        let mut answered: HashSet<String> = HashSet::new();
        for message in &self.messages {
            for block in &message.content {
                match block {
                    ContentBlock::ToolCall { id, .. } => open.push(id.clone()),
                    ContentBlock::ToolResult { id, .. } => {
                        answered.insert(id.clone());
                    }
                    _ => {}
                }
            }
        }
        open.into_iter().filter(|id| !answered.contains(id)).collect()
    }

    /// Verify the pairing invariant holds across the whole history (P1).
    pub fn validate_pairing(&self) -> bool {
        self.unanswered_tool_calls().is_empty()
    }

    /// Drop every message after (and including) the most recent user-authored
    /// message, used to implement `/edit` re-query semantics: editing the
    /// last query is idempotent because it always rewinds to the same point
    /// before re-appending.
    pub fn clear_from_last_to_user_message(&mut self) {
        let Some(last_user_idx) = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::User && m.content.iter().any(|b| matches!(b, ContentBlock::UserText { .. })))
        else {
            return;
        };
        self.messages.truncate(last_user_idx);
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_holds_for_matched_call_and_result() {
        let mut state = State::default();
        state.push(Message::user_text("hi"));
        state.push(Message::assistant(vec![ContentBlock::ToolCall {
            id: "1".into(),
            name: "bash".into(),
            input: serde_json::json!({"command": "ls"}),
        }]));
        state.push(Message::tool_result("1", "bash", "ok", false));
        assert!(state.validate_pairing());
    }

    #[test]
    fn pairing_fails_for_unanswered_call() {
        let mut state = State::default();
        state.push(Message::assistant(vec![ContentBlock::ToolCall {
            id: "1".into(),
            name: "bash".into(),
            input: serde_json::json!({}),
        }]));
        assert!(!state.validate_pairing());
        assert_eq!(state.unanswered_tool_calls(), vec!["1".to_string()]);
    }

    #[test]
    fn clear_from_last_user_message_is_idempotent() {
        let mut state = State::default();
        state.push(Message::user_text("first"));
        state.push(Message::assistant(vec![ContentBlock::AssistantText { text: "ok".into() }]));
        state.push(Message::user_text("second"));
        state.push(Message::assistant(vec![ContentBlock::AssistantText { text: "ok2".into() }]));

        state.clear_from_last_to_user_message();
        assert_eq!(state.messages.len(), 2);

        // Re-applying after appending the same edited query back leaves the
        // same shape each time.
        state.push(Message::user_text("second (edited)"));
        state.push(Message::assistant(vec![ContentBlock::AssistantText { text: "ok3".into() }]));
        state.clear_from_last_to_user_message();
        assert_eq!(state.messages.len(), 2);
    }
}
