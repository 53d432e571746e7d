//! Property-based tests for the state machine.
//!
//! These target the invariants from the design's property list rather
//! than mechanical round-trips: P1 (tool-call/tool-result pairing), P6
//! (at most one tool call accepted per assistant turn), and P8
//! (deterministic, monotonic event ordering out of a single transition).

use super::state::{ConfirmationState, ConvContext, ConvState, ErrorKind, ToolCall};
use super::{transition, Effect, Event};
use crate::llm::{ContentBlock as LlmBlock, Usage};
use crate::message::Message;
use crate::tools::ToolRegistry;
use proptest::prelude::*;
use std::path::PathBuf;

fn test_context() -> ConvContext {
    ConvContext::new("test-session", PathBuf::from("/tmp/ws"), "test-model", 150_000)
}

fn arb_tool_name() -> impl Strategy<Value = String> {
    prop_oneof![Just("bash".to_string()), Just("read_file".to_string()), Just("message_user".to_string())]
}

fn arb_tool_call() -> impl Strategy<Value = ToolCall> {
    ("[a-z0-9]{4,10}", arb_tool_name()).prop_map(|(id, name)| ToolCall::new(id, name, serde_json::json!({})))
}

fn arb_tool_calls(max: usize) -> impl Strategy<Value = Vec<ToolCall>> {
    prop::collection::vec(arb_tool_call(), 0..=max)
}

proptest! {
    /// P6: any `LlmResponse` carrying 2+ tool calls is rejected outright
    /// (`Error{error_kind: Protocol}`), and the offending assistant
    /// message is never appended — appending it would leave unanswered
    /// tool calls that wedge every subsequent turn.
    #[test]
    fn p6_multi_tool_call_responses_are_rejected(calls in arb_tool_calls(5)) {
        prop_assume!(calls.len() >= 2);
        let content: Vec<LlmBlock> = calls
            .iter()
            .map(|c| LlmBlock::ToolUse { id: c.id.clone(), name: c.name.clone(), input: c.input.clone() })
            .collect();
        let event = Event::LlmResponse { content, tool_calls: calls, usage: Usage::default() };
        let result = transition(
            &ConvState::LlmRequesting { attempt: 0 },
            &test_context(),
            &ConfirmationState::default(),
            &ToolRegistry::standard(),
            event,
        ).unwrap();

        prop_assert!(matches!(
            result.new_state,
            ConvState::Error { error_kind: ErrorKind::Protocol, .. }
        ));
        prop_assert!(!result.effects.iter().any(|e| matches!(e, Effect::AppendMessage(_))));
    }

    /// P6 (single-call path): exactly one tool call always routes to
    /// either `AwaitingConfirmation` or `ToolExecuting`, never straight
    /// back to `Idle` or `Error`.
    #[test]
    fn p6_single_tool_call_always_suspends_for_execution(call in arb_tool_call()) {
        let content = vec![LlmBlock::ToolUse { id: call.id.clone(), name: call.name.clone(), input: call.input.clone() }];
        let event = Event::LlmResponse { content, tool_calls: vec![call], usage: Usage::default() };
        let result = transition(
            &ConvState::LlmRequesting { attempt: 0 },
            &test_context(),
            &ConfirmationState::default(),
            &ToolRegistry::standard(),
            event,
        ).unwrap();

        prop_assert!(matches!(
            result.new_state,
            ConvState::AwaitingConfirmation { .. } | ConvState::ToolExecuting { .. }
        ));
    }

    /// P1: every `AppendMessage` effect produced while handling a tool
    /// completion either carries the matching `tool_use_id` as a
    /// `ToolResult`, or is the plain assistant wrap-up text — the pending
    /// call from `ToolExecuting` is never dropped silently.
    #[test]
    fn p1_tool_complete_always_appends_matching_tool_result(
        id in "[a-z0-9]{4,10}",
        name in arb_tool_name(),
        success in any::<bool>(),
        output in "[a-zA-Z0-9 ]{0,40}",
    ) {
        let call = ToolCall::new(id.clone(), name, serde_json::json!({}));
        let state = ConvState::ToolExecuting { current_tool: call };
        let tool_output = if success {
            crate::tools::ToolOutput::success(output)
        } else {
            crate::tools::ToolOutput::error(output)
        };
        let event = Event::ToolComplete { tool_use_id: id.clone(), output: tool_output };
        let result = transition(
            &state,
            &test_context(),
            &ConfirmationState::default(),
            &ToolRegistry::standard(),
            event,
        ).unwrap();

        let appended_matching_result = result.effects.iter().any(|e| match e {
            Effect::AppendMessage(msg) => message_has_tool_result_for(msg, &id),
            _ => false,
        });
        prop_assert!(appended_matching_result);
    }

    /// P8: transition() is a pure function — the same (state, context,
    /// confirmations, event) always yields the same new state and the
    /// same ordered effect list (compared here by variant shape, since
    /// `Effect` has no `PartialEq`).
    #[test]
    fn p8_transition_is_deterministic(call in arb_tool_call()) {
        let content = vec![LlmBlock::ToolUse { id: call.id.clone(), name: call.name.clone(), input: call.input.clone() }];
        let event_a = Event::LlmResponse { content: content.clone(), tool_calls: vec![call.clone()], usage: Usage::default() };
        let event_b = Event::LlmResponse { content, tool_calls: vec![call], usage: Usage::default() };

        let result_a = transition(
            &ConvState::LlmRequesting { attempt: 0 },
            &test_context(),
            &ConfirmationState::default(),
            &ToolRegistry::standard(),
            event_a,
        ).unwrap();
        let result_b = transition(
            &ConvState::LlmRequesting { attempt: 0 },
            &test_context(),
            &ConfirmationState::default(),
            &ToolRegistry::standard(),
            event_b,
        ).unwrap();

        prop_assert_eq!(result_a.new_state, result_b.new_state);
        prop_assert_eq!(result_a.effects.len(), result_b.effects.len());
        for (a, b) in result_a.effects.iter().zip(result_b.effects.iter()) {
            prop_assert_eq!(effect_shape(a), effect_shape(b));
        }
    }
}

fn message_has_tool_result_for(msg: &Message, tool_use_id: &str) -> bool {
    msg.content.iter().any(|block| matches!(
        block,
        crate::message::ContentBlock::ToolResult { id, .. } if id == tool_use_id
    ))
}

fn effect_shape(e: &Effect) -> &'static str {
    match e {
        Effect::AppendMessage(_) => "append_message",
        Effect::PersistState => "persist_state",
        Effect::RequestLlm => "request_llm",
        Effect::RequestConfirmation { .. } => "request_confirmation",
        Effect::RecordConfirmation { .. } => "record_confirmation",
        Effect::ExecuteTool { .. } => "execute_tool",
        Effect::AbortTool { .. } => "abort_tool",
        Effect::AbortLlm => "abort_llm",
        Effect::ScheduleRetry { .. } => "schedule_retry",
        Effect::RequestCompaction => "request_compaction",
        Effect::Notify(_) => "notify",
        Effect::Terminate { .. } => "terminate",
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    #[test]
    fn idle_accepts_user_message() {
        let result = transition(
            &ConvState::Idle,
            &test_context(),
            &ConfirmationState::default(),
            &ToolRegistry::standard(),
            Event::UserMessage { text: "hello".into(), attachments: vec![] },
        ).unwrap();
        assert_eq!(result.new_state, ConvState::LlmRequesting { attempt: 0 });
    }

    #[test]
    fn cancel_while_tool_executing_is_resumable_not_terminal() {
        let call = ToolCall::new("abc", "bash", serde_json::json!({"command": "sleep 10"}));
        let result = transition(
            &ConvState::ToolExecuting { current_tool: call },
            &test_context(),
            &ConfirmationState::default(),
            &ToolRegistry::standard(),
            Event::UserCancel,
        ).unwrap();
        assert!(matches!(result.new_state, ConvState::CancellingTool { .. }));
        assert!(result.effects.iter().any(|e| matches!(e, Effect::AbortTool { .. })));
    }
}
