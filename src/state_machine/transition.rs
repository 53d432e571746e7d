//! Pure state transition function — the heart of the turn loop (§4.E).
//!
//! Given the current `ConvState`, the immutable `ConvContext`, the
//! session's `ConfirmationState`, the `ToolRegistry` (consulted only for
//! static, side-effect-free metadata — a tool's declared confirmation
//! policy), and an incoming `Event`, `transition()` deterministically
//! produces the next `ConvState` plus an ordered list of `Effect`s for the
//! runtime to carry out. It never performs I/O, never sleeps, never
//! allocates a random ID.

use super::state::{ConfirmationState, ConvContext, ConvState, ErrorKind, ToolCall};
use super::{Effect, Event};
use crate::llm::ContentBlock as LlmBlock;
use crate::message::{ContentBlock, Message};
use crate::tools::ToolRegistry;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

const MAX_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConvState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConvState) -> Self {
        Self { new_state: state, effects: vec![] }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("session is busy; cancel the current operation before sending a new instruction")]
    AgentBusy,
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

/// Exponential backoff with jitter for a retryable `LlmProvider` failure.
/// `attempt` is 1-indexed (the attempt that just failed).
pub fn retry_backoff(attempt: u32) -> Duration {
    let base_ms = 500u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
    let capped_ms = base_ms.min(20_000);
    // Deterministic "jitter" derived from the attempt number rather than a
    // clock/RNG call, so this function stays pure: transition() must
    // produce the same Effect list for the same inputs every time.
    let jitter_ms = (capped_ms / 4) * u64::from(attempt % 3);
    Duration::from_millis(capped_ms + jitter_ms)
}

fn translate_assistant_blocks(blocks: &[LlmBlock]) -> Vec<ContentBlock> {
    blocks
        .iter()
        .map(|b| match b {
            LlmBlock::Text { text } => ContentBlock::AssistantText { text: text.clone() },
            LlmBlock::ToolUse { id, name, input } => ContentBlock::ToolCall {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            },
            LlmBlock::Thinking { text } => ContentBlock::Thinking { text: text.clone() },
            LlmBlock::RedactedThinking { opaque_bytes } => {
                ContentBlock::RedactedThinking { opaque_bytes: opaque_bytes.clone() }
            }
            // A well-behaved provider adapter never puts these in an
            // assistant response; if one slips through, render it inert
            // rather than crash the turn loop.
            LlmBlock::ToolResult { content, .. } => {
                ContentBlock::AssistantText { text: content.clone() }
            }
            LlmBlock::Image { .. } => ContentBlock::AssistantText { text: String::new() },
        })
        .collect()
}

fn final_text(blocks: &[LlmBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            LlmBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

const INTERRUPTED_TEXT: &str = "interrupted, resumable";
const COMPLETED_TEXT: &str = "Completed the task.";

#[allow(clippy::too_many_lines)]
pub fn transition(
    state: &ConvState,
    context: &ConvContext,
    confirmations: &ConfirmationState,
    registry: &ToolRegistry,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ------------------------------------------------------------
        // Starting a turn
        // ------------------------------------------------------------
        (ConvState::Idle, Event::UserMessage { text, attachments }) => {
            let display_text = if attachments.is_empty() {
                text.clone()
            } else {
                format!("{text}\n\n[Attached files: {}]", attachments.join(", "))
            };
            let message = Message::user_text(display_text);
            Ok(TransitionResult::new(ConvState::LlmRequesting { attempt: 0 })
                .with_effect(Effect::AppendMessage(message))
                .with_effect(Effect::Notify(crate::events::EventBody::UserMessage {
                    text,
                    attachments,
                }))
                .with_effect(Effect::Notify(crate::events::EventBody::Processing))
                .with_effect(Effect::RequestCompaction)
                .with_effect(Effect::RequestLlm))
        }
        (ConvState::Idle | ConvState::Error { .. }, Event::ResumeTurn) => {
            Ok(TransitionResult::new(ConvState::LlmRequesting { attempt: 0 })
                .with_effect(Effect::Notify(crate::events::EventBody::Processing))
                .with_effect(Effect::RequestCompaction)
                .with_effect(Effect::RequestLlm))
        }
        (ConvState::Idle, Event::UserCancel) => {
            // Nothing in flight; cancellation is a no-op.
            Ok(TransitionResult::new(ConvState::Idle))
        }

        // ------------------------------------------------------------
        // LLM request in flight
        // ------------------------------------------------------------
        (ConvState::LlmRequesting { .. }, Event::MaxTurnsExhausted) => {
            Ok(TransitionResult::new(ConvState::Idle).with_effect(Effect::Terminate {
                result: "Agent did not complete after max turns".to_string(),
            }))
        }
        (ConvState::LlmRequesting { .. }, Event::UserCancel) => {
            Ok(TransitionResult::new(ConvState::CancellingLlm).with_effect(Effect::AbortLlm))
        }
        (ConvState::LlmRequesting { attempt }, Event::LlmError { message, error_kind, .. }) => {
            let next_attempt = attempt + 1;
            if next_attempt >= MAX_RETRY_ATTEMPTS {
                Ok(TransitionResult::new(ConvState::Error { message: message.clone(), error_kind })
                    .with_effect(Effect::notify_error(message.clone()))
                    .with_effect(Effect::Terminate { result: message }))
            } else {
                Ok(
                    TransitionResult::new(ConvState::LlmRequesting { attempt: next_attempt })
                        .with_effect(Effect::ScheduleRetry {
                            delay: retry_backoff(next_attempt),
                            attempt: next_attempt,
                        }),
                )
            }
        }
        (ConvState::LlmRequesting { attempt }, Event::RetryTimeout { attempt: retried }) => {
            if retried != *attempt {
                return Ok(TransitionResult::new(state.clone()));
            }
            Ok(TransitionResult::new(state.clone()).with_effect(Effect::RequestLlm))
        }
        (
            ConvState::LlmRequesting { .. },
            Event::LlmResponse { content, tool_calls, usage },
        ) => {
            if tool_calls.len() > 1 {
                // P6: an assistant turn may never request more than one
                // tool call. The offending message is never appended —
                // appending it would leave unanswered tool calls wedging
                // every future turn.
                let message = "assistant requested more than one tool call in a single turn"
                    .to_string();
                return Ok(TransitionResult::new(ConvState::Error {
                    message: message.clone(),
                    error_kind: ErrorKind::Protocol,
                })
                .with_effect(Effect::notify_error(message.clone()))
                .with_effect(Effect::Terminate { result: message }));
            }

            let blocks = translate_assistant_blocks(&content);
            let assistant_message = Message::assistant(blocks.clone());

            if tool_calls.is_empty() {
                let text = final_text(&content);
                let mut result = TransitionResult::new(ConvState::Idle);
                if !blocks.is_empty() {
                    result = result.with_effect(Effect::AppendMessage(assistant_message));
                }
                if !text.is_empty() {
                    result = result.with_effect(Effect::notify_agent_message(text.clone()));
                }
                for block in &blocks {
                    if let ContentBlock::Thinking { text } = block {
                        result = result.with_effect(Effect::notify_thinking(text.clone()));
                    }
                }
                return Ok(result
                    .with_effect(Effect::PersistState)
                    .with_effect(Effect::Notify(crate::events::EventBody::StreamComplete))
                    .with_effect(Effect::Terminate { result: text }));
            }

            let call = tool_calls.into_iter().next().expect("checked len == 1 above");
            let mut confirmation = registry
                .get(&call.name)
                .map(|t| t.confirmation(&call.input))
                .unwrap_or_default();

            // Strip boilerplate `cd <cwd> &&` prefixes from the bash
            // confirmation summary so the user sees the command that
            // actually matters, not the directory dance around it.
            if call.name == "bash" {
                if let Some(command) = call.input.get("command").and_then(Value::as_str) {
                    let cwd = context.working_dir.to_string_lossy();
                    let display = crate::tools::bash_check::display_command(command, &cwd);
                    confirmation.summary = confirmation.summary.replacen(command, &display, 1);
                }
            }

            let mut result = TransitionResult::new(state.clone());
            for block in &blocks {
                if let ContentBlock::Thinking { text } = block {
                    result = result.with_effect(Effect::notify_thinking(text.clone()));
                }
            }
            result = result
                .with_effect(Effect::AppendMessage(assistant_message))
                .with_effect(Effect::notify_tool_call(&call))
                .with_effect(Effect::PersistState);
            let _ = usage; // accounted for by the runtime's token counters

            if confirmation.required && !confirmations.is_pre_approved(&call.name) {
                result.new_state = ConvState::AwaitingConfirmation {
                    current_tool: call.clone(),
                    summary: confirmation.summary.clone(),
                };
                Ok(result.with_effect(Effect::RequestConfirmation {
                    tool: call,
                    summary: confirmation.summary,
                }))
            } else {
                result.new_state = ConvState::ToolExecuting { current_tool: call.clone() };
                Ok(result.with_effect(Effect::ExecuteTool { tool: call, decision: None }))
            }
        }
        (ConvState::LlmRequesting { .. }, Event::LlmAborted) => {
            // Race: cancellation landed while a response was already on
            // the wire. Treat exactly like a completed cancellation.
            Ok(cancelled_result())
        }

        // ------------------------------------------------------------
        // Confirmation
        // ------------------------------------------------------------
        (ConvState::AwaitingConfirmation { .. }, Event::UserCancel) => Ok(cancelled_result()),
        (
            ConvState::AwaitingConfirmation { current_tool, .. },
            Event::ConfirmationDecision { policy },
        ) => {
            use crate::tools::ConfirmationPolicy;
            if let ConfirmationPolicy::Deny { alternative_instruction } = &policy {
                let output_text = match alternative_instruction {
                    Some(instruction) => format!(
                        "the user declined to run this tool; do this instead: {instruction}"
                    ),
                    None => "the user declined to run this tool".to_string(),
                };
                let message = Message::tool_result(
                    current_tool.id.clone(),
                    current_tool.name.clone(),
                    output_text.clone(),
                    true,
                );
                return Ok(TransitionResult::new(ConvState::LlmRequesting { attempt: 0 })
                    .with_effect(Effect::AppendMessage(message))
                    .with_effect(Effect::notify_tool_result(
                        current_tool.id.clone(),
                        current_tool.name.clone(),
                        output_text,
                        true,
                    ))
                    .with_effect(Effect::PersistState)
                    .with_effect(Effect::RequestCompaction)
                    .with_effect(Effect::RequestLlm));
            }
            let tool = current_tool.clone();
            Ok(TransitionResult::new(ConvState::ToolExecuting { current_tool: tool.clone() })
                .with_effect(Effect::RecordConfirmation {
                    tool_name: tool.name.clone(),
                    policy: policy.clone(),
                })
                .with_effect(Effect::ExecuteTool { tool, decision: Some(policy) }))
        }

        // ------------------------------------------------------------
        // Tool execution
        // ------------------------------------------------------------
        (ConvState::ToolExecuting { current_tool }, Event::UserCancel) => {
            Ok(TransitionResult::new(ConvState::CancellingTool {
                tool_use_id: current_tool.id.clone(),
            })
            .with_effect(Effect::AbortTool { tool_use_id: current_tool.id.clone() }))
        }
        (ConvState::ToolExecuting { current_tool }, Event::ToolComplete { tool_use_id, output })
            if tool_use_id == current_tool.id =>
        {
            Ok(tool_complete_result(current_tool, &output))
        }
        (
            ConvState::CancellingTool { tool_use_id: pending },
            Event::ToolComplete { tool_use_id, output },
        ) if tool_use_id == *pending => Ok(finish_with_interruption(&tool_use_id, Some(&output))),
        (ConvState::CancellingTool { tool_use_id: pending }, Event::ToolAborted { tool_use_id })
            if tool_use_id == *pending =>
        {
            Ok(finish_with_interruption(&tool_use_id, None))
        }

        // ------------------------------------------------------------
        // Cancellation completion
        // ------------------------------------------------------------
        (ConvState::CancellingLlm, Event::LlmAborted | Event::LlmError { .. }) => {
            Ok(cancelled_result())
        }
        (ConvState::CancellingLlm, Event::LlmResponse { .. }) => Ok(cancelled_result()),

        (current, event) => Err(TransitionError::InvalidTransition(format!(
            "event {event:?} not valid in state {current:?}"
        ))),
    }
}

fn cancelled_result() -> TransitionResult {
    TransitionResult::new(ConvState::Idle)
        .with_effect(Effect::AppendMessage(Message::assistant(vec![ContentBlock::AssistantText {
            text: INTERRUPTED_TEXT.to_string(),
        }])))
        .with_effect(Effect::notify_system("Query cancelled"))
        .with_effect(Effect::PersistState)
        .with_effect(Effect::Terminate { result: INTERRUPTED_TEXT.to_string() })
}

fn finish_with_interruption(
    tool_use_id: &str,
    output: Option<&crate::tools::ToolOutput>,
) -> TransitionResult {
    let (output_text, is_error) = match output {
        Some(o) => (o.output.clone(), !o.success),
        None => ("cancelled by user".to_string(), true),
    };
    TransitionResult::new(ConvState::Idle)
        .with_effect(Effect::AppendMessage(Message::tool_result(
            tool_use_id,
            "",
            output_text.clone(),
            is_error,
        )))
        .with_effect(Effect::notify_tool_result(tool_use_id, "", output_text, is_error))
        .with_effect(Effect::AppendMessage(Message::assistant(vec![ContentBlock::AssistantText {
            text: INTERRUPTED_TEXT.to_string(),
        }])))
        .with_effect(Effect::notify_system("Query cancelled"))
        .with_effect(Effect::PersistState)
        .with_effect(Effect::Terminate { result: INTERRUPTED_TEXT.to_string() })
}

fn tool_complete_result(current_tool: &ToolCall, output: &crate::tools::ToolOutput) -> TransitionResult {
    let is_error = !output.success;
    let message = Message::tool_result(
        current_tool.id.clone(),
        current_tool.name.clone(),
        output.output.clone(),
        is_error,
    );
    let mut result = TransitionResult::new(ConvState::Idle)
        .with_effect(Effect::AppendMessage(message))
        .with_effect(Effect::notify_tool_result(
            current_tool.id.clone(),
            current_tool.name.clone(),
            output.output.clone(),
            is_error,
        ))
        .with_effect(Effect::PersistState);

    if current_tool.is_terminal() {
        let final_answer = current_tool
            .input
            .get("message")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| COMPLETED_TEXT.to_string());
        result = result
            .with_effect(Effect::notify_agent_message(final_answer.clone()))
            .with_effect(Effect::Notify(crate::events::EventBody::StreamComplete))
            .with_effect(Effect::Terminate { result: final_answer });
        result
    } else {
        result.new_state = ConvState::LlmRequesting { attempt: 0 };
        result
            .with_effect(Effect::RequestCompaction)
            .with_effect(Effect::RequestLlm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Usage;
    use crate::tools::ToolOutput;

    fn ctx() -> ConvContext {
        ConvContext::new("s1", std::path::PathBuf::from("/tmp/ws"), "test-model", 150_000)
    }

    #[test]
    fn user_message_starts_llm_request() {
        let result = transition(
            &ConvState::Idle,
            &ctx(),
            &ConfirmationState::default(),
            &ToolRegistry::standard(),
            Event::UserMessage { text: "hi".into(), attachments: vec![] },
        )
        .unwrap();
        assert_eq!(result.new_state, ConvState::LlmRequesting { attempt: 0 });
        assert!(result.effects.iter().any(|e| matches!(e, Effect::RequestLlm)));
    }

    #[test]
    fn multiple_tool_calls_hard_fails_without_appending() {
        let response = Event::LlmResponse {
            content: vec![
                LlmBlock::ToolUse { id: "1".into(), name: "bash".into(), input: serde_json::json!({}) },
                LlmBlock::ToolUse { id: "2".into(), name: "bash".into(), input: serde_json::json!({}) },
            ],
            tool_calls: vec![
                ToolCall::new("1", "bash", serde_json::json!({})),
                ToolCall::new("2", "bash", serde_json::json!({})),
            ],
            usage: Usage::default(),
        };
        let result = transition(
            &ConvState::LlmRequesting { attempt: 0 },
            &ctx(),
            &ConfirmationState::default(),
            &ToolRegistry::standard(),
            response,
        )
        .unwrap();
        assert!(matches!(result.new_state, ConvState::Error { error_kind: ErrorKind::Protocol, .. }));
        assert!(!result.effects.iter().any(|e| matches!(e, Effect::AppendMessage(_))));
    }

    #[test]
    fn terminal_tool_call_goes_through_tool_executing_then_terminates() {
        let call = ToolCall::new("1", "message_user", serde_json::json!({"message": "done"}));
        let response = Event::LlmResponse {
            content: vec![LlmBlock::ToolUse {
                id: "1".into(),
                name: "message_user".into(),
                input: serde_json::json!({"message": "done"}),
            }],
            tool_calls: vec![call.clone()],
            usage: Usage::default(),
        };
        let result = transition(
            &ConvState::LlmRequesting { attempt: 0 },
            &ctx(),
            &ConfirmationState::default(),
            &ToolRegistry::standard(),
            response,
        )
        .unwrap();
        assert_eq!(result.new_state, ConvState::ToolExecuting { current_tool: call.clone() });

        let complete = tool_complete_result(&call, &ToolOutput::success("done"));
        assert_eq!(complete.new_state, ConvState::Idle);
        assert!(complete.effects.iter().any(|e| matches!(e, Effect::Terminate { .. })));
    }

    #[test]
    fn non_terminal_tool_loops_back_to_llm_requesting() {
        let call = ToolCall::new("1", "bash", serde_json::json!({"command": "ls"}));
        let result = tool_complete_result(&call, &ToolOutput::success("file.txt"));
        assert_eq!(result.new_state, ConvState::LlmRequesting { attempt: 0 });
        assert!(result.effects.iter().any(|e| matches!(e, Effect::RequestLlm)));
        assert!(!result.effects.iter().any(|e| matches!(e, Effect::Terminate { .. })));
    }

    #[test]
    fn confirmation_gated_tool_waits_for_decision() {
        let call = ToolCall::new("1", "bash", serde_json::json!({"command": "rm -rf /tmp/x"}));
        let response = Event::LlmResponse {
            content: vec![LlmBlock::ToolUse {
                id: "1".into(),
                name: "bash".into(),
                input: serde_json::json!({"command": "rm -rf /tmp/x"}),
            }],
            tool_calls: vec![call],
            usage: Usage::default(),
        };
        let result = transition(
            &ConvState::LlmRequesting { attempt: 0 },
            &ctx(),
            &ConfirmationState::default(),
            &ToolRegistry::standard(),
            response,
        )
        .unwrap();
        assert!(matches!(result.new_state, ConvState::AwaitingConfirmation { .. }));
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::RequestConfirmation { .. })));
    }

    #[test]
    fn cancellation_mid_tool_is_resumable() {
        let tool_use_id = "1".to_string();
        let result = finish_with_interruption(&tool_use_id, None);
        assert_eq!(result.new_state, ConvState::Idle);
        assert!(result.effects.iter().any(
            |e| matches!(e, Effect::Terminate { result } if result == INTERRUPTED_TEXT)
        ));
    }

    #[test]
    fn retry_backoff_grows_and_is_capped() {
        assert!(retry_backoff(1) < retry_backoff(2));
        assert!(retry_backoff(10) <= Duration::from_millis(20_000 + 20_000 / 4 * 2));
    }

    #[test]
    fn llm_error_exhausts_retries_into_hard_error() {
        let mut st = ConvState::LlmRequesting { attempt: 0 };
        let mut last = transition(
            &st,
            &ctx(),
            &ConfirmationState::default(),
            &ToolRegistry::standard(),
            Event::LlmError { message: "boom".into(), error_kind: ErrorKind::LlmProvider, attempt: 0 },
        )
        .unwrap();
        st = last.new_state.clone();
        for _ in 0..MAX_RETRY_ATTEMPTS {
            last = transition(
                &st,
                &ctx(),
                &ConfirmationState::default(),
                &ToolRegistry::standard(),
                Event::LlmError {
                    message: "boom".into(),
                    error_kind: ErrorKind::LlmProvider,
                    attempt: 0,
                },
            )
            .unwrap();
            st = last.new_state.clone();
        }
        assert!(matches!(st, ConvState::Error { .. }));
    }
}
