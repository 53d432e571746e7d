//! The turn-loop interpreter for the pure state machine in
//! `state_machine` (§4.E/§4.F). `transition()` never performs I/O; this
//! module is the only place that actually calls an LLM, dispatches a
//! tool, sleeps for a retry, or waits on a user confirmation, and feeds
//! the resulting `Event` back into `transition()` until a turn
//! terminates.

use crate::events::EventBody;
use crate::llm::{LlmMessage, LlmRequest, MessageRole, SystemContent};
use crate::message::{ContentBlock as MsgBlock, Message, Role};
use crate::session::Session;
use crate::state_machine::state::{ConvContext, ConvState, ErrorKind, ToolCall, MAX_TURNS_PER_INVOCATION};
use crate::state_machine::{transition, Effect, Event, TransitionError};
use crate::tools::{ConfirmationPolicy, DispatchOutcome, ToolContext, ToolOutput};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long a cancelled tool is given to unwind cleanly before the
/// invocation is abandoned outright.
const TOOL_CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("session is busy; cancel the current operation before sending a new instruction")]
    Busy,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    ContextExhausted(String),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

impl From<TransitionError> for ExecutorError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::AgentBusy => ExecutorError::Busy,
            TransitionError::InvalidTransition(m) => ExecutorError::Protocol(m),
        }
    }
}

fn to_llm_message(message: &Message) -> LlmMessage {
    let role = match message.role {
        Role::User => MessageRole::User,
        Role::Assistant => MessageRole::Assistant,
    };
    let content = message
        .content
        .iter()
        .map(|block| match block {
            MsgBlock::UserText { text } | MsgBlock::AssistantText { text } => {
                crate::llm::ContentBlock::Text { text: text.clone() }
            }
            MsgBlock::ToolCall { id, name, input } => crate::llm::ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            },
            MsgBlock::ToolResult { id, output, is_error, .. } => {
                crate::llm::ContentBlock::tool_result(id.clone(), output.clone(), *is_error)
            }
            MsgBlock::Thinking { text } => crate::llm::ContentBlock::Thinking { text: text.clone() },
            MsgBlock::RedactedThinking { opaque_bytes } => {
                crate::llm::ContentBlock::RedactedThinking { opaque_bytes: opaque_bytes.clone() }
            }
        })
        .collect();
    LlmMessage { role, content }
}

/// What the runtime must do to move a turn forward after `advance()`
/// applied one transition's immediate effects.
enum Suspend {
    Llm { attempt: u32 },
    Tool { tool: ToolCall, decision: Option<ConfirmationPolicy> },
    Confirmation,
    Retry { delay: Duration, attempt: u32 },
}

enum AdvanceOutcome {
    /// Immediate effects applied; nothing further to do until some
    /// external event (a later cancel, a later confirmation) arrives.
    None,
    Suspend(Suspend),
    Done(String),
    ContextExhausted(String),
}

async fn compact_if_needed(session: &Arc<Session>) -> Result<(), String> {
    let history = {
        let inner = session.inner.lock().await;
        if !session.context_manager.budget_exceeded(&inner.history) {
            return Ok(());
        }
        inner.history.clone()
    };

    match session.context_manager.compact(&history, &session.llm).await {
        Ok(Some(compacted)) => {
            session.inner.lock().await.history = compacted;
            return Ok(());
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(error = %err, "todo-aware compaction failed, falling back to full-history compaction");
        }
    }

    match session.context_manager.full_history_compact(&history, &session.llm).await {
        Ok(compacted) => {
            let tokens = crate::context::estimate_state_tokens(&compacted);
            if tokens as usize <= session.context_manager.context_window() {
                session.inner.lock().await.history = compacted;
                Ok(())
            } else {
                Err("conversation exceeds the model's context window even after full-history compaction".to_string())
            }
        }
        Err(err) => Err(format!("compaction failed: {err}")),
    }
}

/// Apply one `transition()` step: compute the next `ConvState`, run every
/// immediate (non-suspending) effect, and report what the caller should
/// wait on next, if anything.
async fn advance(session: &Arc<Session>, ctx: &ConvContext, event: Event) -> Result<AdvanceOutcome, ExecutorError> {
    let (state, confirmations) = {
        let inner = session.inner.lock().await;
        (inner.conv_state.clone(), inner.confirmations.clone())
    };

    let result = transition(&state, ctx, &confirmations, &session.tools, event)?;

    let llm_attempt = match &result.new_state {
        ConvState::LlmRequesting { attempt } => Some(*attempt),
        _ => None,
    };

    session.inner.lock().await.conv_state = result.new_state;

    let mut outcome = AdvanceOutcome::None;
    for effect in result.effects {
        match effect {
            Effect::AppendMessage(message) => {
                session.inner.lock().await.history.push(message);
            }
            Effect::PersistState => {
                let history = session.inner.lock().await.history.clone();
                session.store.save_state(&session.id, &history).await?;
            }
            Effect::Notify(body) => session.events.emit(body).await,
            Effect::RecordConfirmation { tool_name, policy } => {
                session.inner.lock().await.confirmations.record(&tool_name, policy);
            }
            Effect::RequestCompaction => {
                if let Err(message) = compact_if_needed(session).await {
                    session.inner.lock().await.conv_state = ConvState::ContextExhausted { summary: message.clone() };
                    session.events.emit(EventBody::Error { message: message.clone() }).await;
                    return Ok(AdvanceOutcome::ContextExhausted(message));
                }
            }
            Effect::RequestLlm => {
                outcome = AdvanceOutcome::Suspend(Suspend::Llm {
                    attempt: llm_attempt.unwrap_or(0),
                });
            }
            Effect::ExecuteTool { tool, decision } => {
                outcome = AdvanceOutcome::Suspend(Suspend::Tool { tool, decision });
            }
            Effect::RequestConfirmation { .. } => {
                outcome = AdvanceOutcome::Suspend(Suspend::Confirmation);
            }
            Effect::ScheduleRetry { delay, attempt } => {
                outcome = AdvanceOutcome::Suspend(Suspend::Retry { delay, attempt });
            }
            // Cancellation is signalled cooperatively through the shared
            // `CancellationToken`; the suspension helper that is racing
            // against it (`call_llm`, `run_tool`) already observes it the
            // instant `session.cancel()` flips the flag, so there is
            // nothing further to do here.
            Effect::AbortTool { .. } | Effect::AbortLlm => {}
            Effect::Terminate { result } => return Ok(AdvanceOutcome::Done(result)),
        }
    }

    Ok(outcome)
}

fn build_llm_request(session: &Session, history: &crate::message::State) -> LlmRequest {
    let system_prompt = crate::system_prompt::build_system_prompt(session.workspace.root());
    LlmRequest {
        system: vec![SystemContent::cached(system_prompt)],
        messages: history.messages.iter().map(to_llm_message).collect(),
        tools: session.tools.definitions(),
        max_tokens: Some(8192),
        temperature: None,
        thinking_tokens: None,
    }
}

async fn call_llm(session: &Arc<Session>, attempt: u32) -> Event {
    let history = session.inner.lock().await.history.clone();
    let request = build_llm_request(session, &history);
    let cancel = session.cancel_token().await;

    tokio::select! {
        biased;
        () = cancel.cancelled() => Event::LlmAborted,
        result = session.llm.complete(&request) => match result {
            Ok(response) => {
                let tool_calls = response
                    .tool_uses()
                    .into_iter()
                    .map(|(id, name, input)| ToolCall::new(id, name, input.clone()))
                    .collect();
                Event::LlmResponse { content: response.content, tool_calls, usage: response.usage }
            }
            Err(err) => Event::LlmError {
                message: err.message,
                error_kind: ErrorKind::LlmProvider,
                attempt,
            },
        },
    }
}

async fn wait_retry(session: &Arc<Session>, delay: Duration, attempt: u32) -> Event {
    let cancel = session.cancel_token().await;
    tokio::select! {
        biased;
        () = cancel.cancelled() => Event::LlmAborted,
        () = tokio::time::sleep(delay) => Event::RetryTimeout { attempt },
    }
}

async fn wait_confirmation(session: &Arc<Session>) -> Event {
    let cancel = session.cancel_token().await;
    let mut rx = session.confirmation_rx.lock().await;
    tokio::select! {
        biased;
        () = cancel.cancelled() => Event::UserCancel,
        decision = rx.recv() => match decision {
            Some(policy) => Event::ConfirmationDecision { policy },
            None => Event::UserCancel,
        },
    }
}

/// Run a tool, racing the live dispatch against cancellation. On
/// cancellation the FSM is moved into `CancellingTool` immediately (so
/// concurrent observers see the right state while the tool unwinds), then
/// the dispatch is given `TOOL_CANCEL_GRACE` to finish before it is
/// abandoned outright.
async fn run_tool(
    session: &Arc<Session>,
    ctx: &ConvContext,
    tool: ToolCall,
    decision: Option<ConfirmationPolicy>,
) -> Result<Event, ExecutorError> {
    let cancel = session.cancel_token().await;
    let tool_ctx = ToolContext::new(
        cancel.clone(),
        session.id.clone(),
        session.workspace.clone(),
        session.shell_broker.clone(),
        session.llm_registry.clone(),
    );
    let registry = session.tools.clone();
    let tool_use_id = tool.id.clone();
    let name = tool.name.clone();
    let input = tool.input.clone();

    let mut handle = tokio::spawn(async move {
        let mut scratch = crate::tools::ConfirmationState { allow_all: true, ..Default::default() };
        registry.dispatch(&name, input, tool_ctx, &mut scratch, decision).await
    });

    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            // Surface the cancellation in conversation state before we
            // start waiting out the grace period.
            advance(session, ctx, Event::UserCancel).await?;
            match tokio::time::timeout(TOOL_CANCEL_GRACE, &mut handle).await {
                Ok(Ok(DispatchOutcome::Ran(output))) => Event::ToolComplete { tool_use_id, output },
                Ok(Ok(DispatchOutcome::NeedsConfirmation { .. })) | Ok(Err(_)) => {
                    Event::ToolAborted { tool_use_id }
                }
                Err(_) => {
                    handle.abort();
                    Event::ToolAborted { tool_use_id }
                }
            }
        }
        joined = &mut handle => match joined {
            Ok(DispatchOutcome::Ran(output)) => Event::ToolComplete { tool_use_id, output },
            Ok(DispatchOutcome::NeedsConfirmation { .. }) => Event::ToolComplete {
                tool_use_id,
                output: ToolOutput::error("confirmation required but none was supplied"),
            },
            Err(_) => Event::ToolAborted { tool_use_id },
        },
    };
    Ok(outcome)
}

/// Drive the turn loop from `initial` until it terminates, returning the
/// final answer text (or the reason it stopped: cancellation, a hard
/// error, or `Event::MaxTurnsExhausted`).
pub async fn run_turn_loop(session: Arc<Session>, initial: Event) -> Result<String, ExecutorError> {
    let _turn_guard = session.turn_lock.lock().await;
    session.new_invocation_token().await;
    let ctx = session.conv_context();

    let mut event = initial;
    let mut turns_remaining = MAX_TURNS_PER_INVOCATION;
    let mut first_llm_call = true;

    loop {
        match advance(&session, &ctx, event).await? {
            AdvanceOutcome::Done(result) => return Ok(result),
            AdvanceOutcome::ContextExhausted(summary) => return Err(ExecutorError::ContextExhausted(summary)),
            AdvanceOutcome::None => {
                // Only reached by effect-free transitions (the `Idle` +
                // `UserCancel` no-op); every other immediate-only path
                // feeds back into a suspending helper above.
                return Ok(String::new());
            }
            AdvanceOutcome::Suspend(Suspend::Llm { attempt }) => {
                if first_llm_call {
                    first_llm_call = false;
                } else if turns_remaining == 0 {
                    event = Event::MaxTurnsExhausted;
                    continue;
                } else {
                    turns_remaining -= 1;
                }
                event = call_llm(&session, attempt).await;
            }
            AdvanceOutcome::Suspend(Suspend::Tool { tool, decision }) => {
                event = run_tool(&session, &ctx, tool, decision).await?;
            }
            AdvanceOutcome::Suspend(Suspend::Confirmation) => {
                event = wait_confirmation(&session).await;
            }
            AdvanceOutcome::Suspend(Suspend::Retry { delay, attempt }) => {
                event = wait_retry(&session, delay, attempt).await;
            }
        }
    }
}

/// Deliver the user's decision on a confirmation-gated tool call to
/// whichever turn loop is suspended waiting for one.
pub async fn submit_confirmation(session: &Arc<Session>, policy: ConfirmationPolicy) -> Result<(), ExecutorError> {
    session
        .confirmation_tx
        .send(policy)
        .await
        .map_err(|_| ExecutorError::Protocol("no confirmation is pending".to_string()))
}

/// Request cancellation of whatever this session is currently doing. A
/// no-op if the session is idle.
pub async fn cancel(session: &Arc<Session>) {
    session.cancel_token().await.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ContentBlock as LlmContentBlock, LlmError, LlmResponse, LlmService, Usage};
    use crate::state_machine::ConfirmationState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct ScriptedLlm {
        responses: std::sync::Mutex<Vec<LlmResponse>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmService for ScriptedLlm {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(LlmError::unknown("script exhausted"));
            }
            Ok(responses.remove(0))
        }
        fn model_id(&self) -> &str {
            "scripted"
        }
        fn context_window(&self) -> usize {
            150_000
        }
        fn max_image_dimension(&self) -> Option<u32> {
            None
        }
    }

    fn test_session(llm: Arc<dyn LlmService>, data_dir: &std::path::Path, ws_dir: &std::path::Path) -> Arc<Session> {
        let workspace = Arc::new(crate::workspace::WorkspaceGuard::new(ws_dir));
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        Arc::new(Session {
            id: "s1".into(),
            workspace,
            tools: Arc::new(crate::tools::ToolRegistry::standard()),
            shell_broker: Arc::new(crate::shell::PersistentShellBroker::new("orchestrator")),
            llm,
            llm_registry: Arc::new(crate::llm::ModelRegistry::new_empty()),
            model_id: "test-model".into(),
            context_manager: crate::context::ContextManager::new(150_000),
            events: Arc::new(crate::events::EventStream::new("s1")),
            store: crate::store::SessionStore::new(data_dir),
            inner: tokio::sync::Mutex::new(crate::session::SessionInner {
                conv_state: ConvState::Idle,
                history: crate::message::State::default(),
                confirmations: ConfirmationState::default(),
            }),
            cancel: tokio::sync::RwLock::new(tokio_util::sync::CancellationToken::new()),
            confirmation_tx: tx,
            confirmation_rx: tokio::sync::Mutex::new(rx),
            turn_lock: tokio::sync::Mutex::new(()),
        })
    }

    #[tokio::test]
    async fn terminal_tool_ends_the_turn_loop_with_its_message() {
        let llm = Arc::new(ScriptedLlm {
            responses: std::sync::Mutex::new(vec![LlmResponse {
                content: vec![LlmContentBlock::ToolUse {
                    id: "1".into(),
                    name: "message_user".into(),
                    input: serde_json::json!({"message": "all done"}),
                }],
                end_turn: true,
                usage: Usage::default(),
            }]),
            calls: AtomicUsize::new(0),
        });

        let data = TempDir::new().unwrap();
        let ws = TempDir::new().unwrap();
        let session = test_session(llm, data.path(), ws.path());

        let result = run_turn_loop(
            session,
            Event::UserMessage { text: "do it".into(), attachments: vec![] },
        )
        .await
        .unwrap();
        assert_eq!(result, "all done");
    }

    #[tokio::test]
    async fn non_terminal_tool_then_final_text_round_trips_through_two_llm_calls() {
        let llm = Arc::new(ScriptedLlm {
            responses: std::sync::Mutex::new(vec![
                LlmResponse {
                    content: vec![LlmContentBlock::ToolUse {
                        id: "1".into(),
                        name: "think".into(),
                        input: serde_json::json!({"thought": "hm"}),
                    }],
                    end_turn: true,
                    usage: Usage::default(),
                },
                LlmResponse {
                    content: vec![LlmContentBlock::Text { text: "final answer".into() }],
                    end_turn: true,
                    usage: Usage::default(),
                },
            ]),
            calls: AtomicUsize::new(0),
        });

        let data = TempDir::new().unwrap();
        let ws = TempDir::new().unwrap();
        let session = test_session(llm, data.path(), ws.path());

        let result = run_turn_loop(
            session,
            Event::UserMessage { text: "do it".into(), attachments: vec![] },
        )
        .await
        .unwrap();
        assert_eq!(result, "final answer");
    }

    #[tokio::test]
    async fn llm_error_exhausts_retries_into_a_hard_error() {
        let llm = Arc::new(ScriptedLlm {
            responses: std::sync::Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
        });
        let data = TempDir::new().unwrap();
        let ws = TempDir::new().unwrap();
        let session = test_session(llm, data.path(), ws.path());

        // The retry backoff delays are real sleeps (0.5s, ~1s); harmless
        // in a test but this confirms the turn loop still terminates
        // cleanly into the hard-error text rather than looping forever.
        let result = run_turn_loop(
            session,
            Event::UserMessage { text: "do it".into(), attachments: vec![] },
        )
        .await
        .unwrap();
        assert_eq!(result, "script exhausted");
    }

    #[tokio::test]
    async fn confirmation_gated_tool_runs_after_user_approves() {
        let llm = Arc::new(ScriptedLlm {
            responses: std::sync::Mutex::new(vec![
                LlmResponse {
                    content: vec![LlmContentBlock::ToolUse {
                        id: "1".into(),
                        name: "write_file".into(),
                        input: serde_json::json!({"path": "out.txt", "content": "hi"}),
                    }],
                    end_turn: true,
                    usage: Usage::default(),
                },
                LlmResponse {
                    content: vec![LlmContentBlock::ToolUse {
                        id: "2".into(),
                        name: "message_user".into(),
                        input: serde_json::json!({"message": "wrote it"}),
                    }],
                    end_turn: true,
                    usage: Usage::default(),
                },
            ]),
            calls: AtomicUsize::new(0),
        });

        let data = TempDir::new().unwrap();
        let ws = TempDir::new().unwrap();
        let session = test_session(llm, data.path(), ws.path());

        let turn = tokio::spawn(run_turn_loop(
            session.clone(),
            Event::UserMessage { text: "write a file".into(), attachments: vec![] },
        ));

        // Give the turn loop time to reach the confirmation suspension
        // point before the approval is submitted.
        tokio::time::sleep(Duration::from_millis(50)).await;
        submit_confirmation(&session, ConfirmationPolicy::OnceAllow)
            .await
            .unwrap();

        let result = turn.await.unwrap().unwrap();
        assert_eq!(result, "wrote it");
        assert_eq!(
            tokio::fs::read_to_string(ws.path().join("out.txt")).await.unwrap(),
            "hi"
        );
    }

    struct StallingLlm;

    #[async_trait]
    impl LlmService for StallingLlm {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            // Never resolves on its own; the test only cares that
            // cancellation wins the race in `call_llm`'s `tokio::select!`.
            std::future::pending().await
        }
        fn model_id(&self) -> &str {
            "stalling"
        }
        fn context_window(&self) -> usize {
            150_000
        }
        fn max_image_dimension(&self) -> Option<u32> {
            None
        }
    }

    #[tokio::test]
    async fn cancelling_an_in_flight_llm_call_leaves_the_session_resumable() {
        let data = TempDir::new().unwrap();
        let ws = TempDir::new().unwrap();
        let session = test_session(Arc::new(StallingLlm), data.path(), ws.path());

        let turn = tokio::spawn(run_turn_loop(
            session.clone(),
            Event::UserMessage { text: "do it".into(), attachments: vec![] },
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel(&session).await;

        let result = turn.await.unwrap().unwrap();
        assert_eq!(result, "interrupted, resumable");
        assert!(session.inner.lock().await.history.validate_pairing());
    }
}
