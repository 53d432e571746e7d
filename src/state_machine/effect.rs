//! Effects produced by state transitions.
//!
//! `transition()` is a pure function: it never touches the filesystem, the
//! network, or a clock. Every side effect it wants performed is returned
//! as one of these and carried out by the runtime loop that drives it.

use super::state::ToolCall;
use crate::events::EventBody;
use crate::message::Message;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Effect {
    /// Append a message to conversation state.
    AppendMessage(Message),

    /// Persist the current state (messages + counters) to the store.
    PersistState,

    /// Make an LLM request with the current state as context.
    RequestLlm,

    /// Present a confirmation-gated tool call to the user; the runtime
    /// suspends until a `ConfirmationDecision` event arrives.
    RequestConfirmation { tool: ToolCall, summary: String },

    /// Record the user's confirmation decision against session state so
    /// repeated calls can skip the round-trip (per `ConfirmationPolicy`).
    RecordConfirmation {
        tool_name: String,
        policy: crate::tools::ConfirmationPolicy,
    },

    /// Execute a tool (dispatched by the runtime, off the pure path).
    /// `decision` carries the confirmation policy that just cleared this
    /// call for execution, if any — the runtime passes it straight to
    /// `ToolRegistry::dispatch` so a once-allowed tool doesn't re-trigger
    /// the confirmation gate it already passed.
    ExecuteTool {
        tool: ToolCall,
        decision: Option<crate::tools::ConfirmationPolicy>,
    },

    /// Ask the active tool to stop; it may not actually stop before the
    /// cancellation grace period elapses.
    AbortTool { tool_use_id: String },

    /// Abort the currently running LLM request.
    AbortLlm,

    /// Schedule a retry of the LLM request after `delay` (exponential
    /// backoff with jitter is computed by the runtime, not here).
    ScheduleRetry { delay: Duration, attempt: u32 },

    /// Ask the context manager to compact the conversation before the
    /// next LLM call.
    RequestCompaction,

    /// Emit one event to every subscriber of this session.
    Notify(EventBody),

    /// Terminate the current turn-loop invocation and return this text to
    /// the caller of `run_turn_loop`.
    Terminate { result: String },
}

impl Effect {
    pub fn notify_agent_message(text: impl Into<String>) -> Self {
        Effect::Notify(EventBody::AgentMessage { text: text.into() })
    }

    pub fn notify_thinking(text: impl Into<String>) -> Self {
        Effect::Notify(EventBody::AgentThinking { text: text.into() })
    }

    pub fn notify_tool_call(call: &ToolCall) -> Self {
        Effect::Notify(EventBody::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
        })
    }

    pub fn notify_tool_result(
        id: impl Into<String>,
        name: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Effect::Notify(EventBody::ToolResult {
            id: id.into(),
            name: name.into(),
            output: output.into(),
            is_error,
        })
    }

    pub fn notify_error(message: impl Into<String>) -> Self {
        Effect::Notify(EventBody::Error { message: message.into() })
    }

    pub fn notify_system(message: impl Into<String>) -> Self {
        Effect::Notify(EventBody::System { message: message.into() })
    }
}
