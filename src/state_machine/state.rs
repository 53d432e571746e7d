//! Conversation state types.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Crate-wide error taxonomy. Only `Protocol` and an exhausted
/// `LlmProvider` retry budget ever surface out of the turn loop as a hard
/// error; everything else becomes a `ToolResult { is_error: true }` or a
/// logged-and-recovered event (see §7 of the design).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UserInput,
    ToolExecution,
    Workspace,
    Shell,
    LlmProvider,
    Protocol,
    Cancellation,
    ContextOverflow,
}

/// A tool call requested by the LLM, carrying its raw JSON input. Input is
/// re-validated against each tool's JSON schema at dispatch time; the
/// `name`/`input` pair is kept generic here (rather than a closed enum of
/// every known tool) so new tools can register without touching the state
/// machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    /// `message_user` is the terminal tool: calling it always ends the
    /// controller's turn loop for this turn.
    pub fn is_terminal(&self) -> bool {
        self.name == crate::tools::ToolRegistry::TERMINAL_TOOL
    }

    /// `todo_write` is the segment-boundary sentinel the context manager
    /// watches for when deciding where it may compact.
    pub fn is_segment_boundary(&self) -> bool {
        self.name == crate::tools::ToolRegistry::SEGMENT_BOUNDARY_TOOL
    }
}

/// Conversation state machine states (the Elm-architecture "model").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConvState {
    /// Ready for user input, no pending operations.
    #[default]
    Idle,

    /// LLM request in flight, with retry tracking.
    LlmRequesting { attempt: u32 },

    /// A tool call came back confirmation-gated and unapproved; waiting
    /// on the user's `{OnceAllow, AlwaysThisTool, AllowAll, Deny}` decision.
    AwaitingConfirmation { current_tool: ToolCall, summary: String },

    /// Executing the single tool call from the last assistant turn (at
    /// most one tool call may ever be pending at a time).
    ToolExecuting { current_tool: ToolCall },

    /// User requested cancellation of the in-flight LLM request.
    CancellingLlm,

    /// User requested cancellation of the running tool.
    CancellingTool { tool_use_id: String },

    /// Error occurred; displayed to the client, recoverable by the next
    /// user message.
    Error { message: String, error_kind: ErrorKind },

    /// The context manager is compacting the conversation; new user input
    /// is rejected until compaction completes.
    Compacting,

    /// Context window exhausted even after compaction attempts; the
    /// conversation is read-only until the client starts a new session.
    ContextExhausted { summary: String },
}

impl ConvState {
    pub fn is_working(&self) -> bool {
        !matches!(
            self,
            ConvState::Idle | ConvState::Error { .. } | ConvState::ContextExhausted { .. }
        )
    }

    /// Whether the next user-supplied instruction may be accepted, i.e.
    /// the controller is sitting at a resumable boundary.
    pub fn accepts_instruction(&self) -> bool {
        matches!(self, ConvState::Idle | ConvState::Error { .. })
    }
}

/// Immutable per-session configuration.
#[derive(Debug, Clone)]
pub struct ConvContext {
    pub session_id: String,
    pub working_dir: PathBuf,
    pub model_id: String,
    pub context_window: usize,
}

pub const DEFAULT_CONTEXT_WINDOW: usize = 150_000;
pub const MAX_TURNS_PER_INVOCATION: u32 = 200;

impl ConvContext {
    pub fn new(
        session_id: impl Into<String>,
        working_dir: PathBuf,
        model_id: impl Into<String>,
        context_window: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            working_dir,
            model_id: model_id.into(),
            context_window,
        }
    }
}

/// Track confirmation decisions made for this session so repeated calls to
/// the same tool can skip the round-trip once the user has said "always".
#[derive(Debug, Clone, Default)]
pub struct ConfirmationState {
    pub always_allowed_tools: HashSet<String>,
    pub allow_all: bool,
}

impl ConfirmationState {
    pub fn is_pre_approved(&self, tool_name: &str) -> bool {
        self.allow_all || self.always_allowed_tools.contains(tool_name)
    }

    pub fn record(&mut self, tool_name: &str, policy: crate::tools::ConfirmationPolicy) {
        use crate::tools::ConfirmationPolicy;
        match policy {
            ConfirmationPolicy::AlwaysThisTool => {
                self.always_allowed_tools.insert(tool_name.to_string());
            }
            ConfirmationPolicy::AllowAll => self.allow_all = true,
            ConfirmationPolicy::OnceAllow | ConfirmationPolicy::Deny { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_tool_named_message_user() {
        let call = ToolCall::new("1", "message_user", serde_json::json!({}));
        assert!(call.is_terminal());
        let call = ToolCall::new("2", "bash", serde_json::json!({}));
        assert!(!call.is_terminal());
    }

    #[test]
    fn confirmation_state_records_scope_of_approval() {
        let mut state = ConfirmationState::default();
        assert!(!state.is_pre_approved("bash"));

        state.record("bash", crate::tools::ConfirmationPolicy::AlwaysThisTool);
        assert!(state.is_pre_approved("bash"));
        assert!(!state.is_pre_approved("write_file"));

        state.record("write_file", crate::tools::ConfirmationPolicy::AllowAll);
        assert!(state.allow_all);
        assert!(state.is_pre_approved("anything"));
    }
}
