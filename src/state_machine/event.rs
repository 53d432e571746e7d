//! Events that drive state transitions (internal to the turn loop — not
//! to be confused with `crate::events::Event`, the wire format streamed
//! to subscribers).

use super::state::{ErrorKind, ToolCall};
use crate::llm::{ContentBlock, Usage};
use crate::tools::ConfirmationPolicy;

#[derive(Debug, Clone)]
pub enum Event {
    /// A user instruction arrived (possibly with attached file paths).
    UserMessage {
        text: String,
        attachments: Vec<String>,
    },
    /// A previously-cancelled or otherwise-idle session is resuming a
    /// turn loop invocation without fresh user text (`resume = true`).
    ResumeTurn,
    UserCancel,

    LlmResponse {
        content: Vec<ContentBlock>,
        tool_calls: Vec<ToolCall>,
        usage: Usage,
    },
    LlmError {
        message: String,
        error_kind: ErrorKind,
        attempt: u32,
    },
    /// The in-flight LLM request was aborted due to cancellation.
    LlmAborted,
    RetryTimeout {
        attempt: u32,
    },

    /// The user's synchronous decision on a confirmation-gated tool call.
    ConfirmationDecision {
        policy: ConfirmationPolicy,
    },

    ToolComplete {
        tool_use_id: String,
        output: crate::tools::ToolOutput,
    },
    /// The in-flight tool was aborted due to cancellation.
    ToolAborted {
        tool_use_id: String,
    },

    /// The context manager finished compacting; the new message list
    /// replaces everything but the in-progress (final) segment.
    CompactionComplete {
        tokens_before: u64,
        tokens_after: u64,
    },
    CompactionFailed {
        message: String,
    },

    /// The runtime's turn counter for this `run_turn_loop` invocation hit
    /// zero before the agent called the terminal tool.
    MaxTurnsExhausted,
}
