//! Todo-aware context compaction (§4.D).
//!
//! Conversation history grows one turn at a time; once it crosses a
//! configurable fraction of the model's context window, the
//! `ContextManager` rewrites `State` in place so the next LLM request
//! fits. Compaction never breaks tool-call/tool-result pairing and never
//! grows the token count it started with.

use crate::llm::{ContentBlock as LlmBlock, LlmMessage, LlmRequest, LlmService, MessageRole, SystemContent};
use crate::message::{ContentBlock, Message, Role, State};
use std::sync::Arc;
use thiserror::Error;

/// Fraction of the context window that triggers auto-compaction before
/// the next LLM request is built.
const AUTO_COMPACT_THRESHOLD: f64 = 0.8;

/// Segments more recent than this many completed `TodoWrite` boundaries
/// are kept verbatim even if the budget is already exceeded — summarizing
/// work the agent just finished erases detail it may still need.
const PRESERVE_RECENT_SEGMENTS: usize = 1;

/// Very rough token estimate: ~4 characters per token, the same
/// approximation used for pre-flight budget checks throughout this crate.
fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(1)
}

fn message_chars(message: &Message) -> u64 {
    message
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::UserText { text }
            | ContentBlock::AssistantText { text }
            | ContentBlock::Thinking { text } => text.len() as u64,
            ContentBlock::ToolCall { input, .. } => input.to_string().len() as u64,
            ContentBlock::ToolResult { output, .. } => output.len() as u64,
            ContentBlock::RedactedThinking { opaque_bytes } => opaque_bytes.len() as u64,
        })
        .sum()
}

/// Estimate the conversation's total token footprint.
pub fn estimate_state_tokens(state: &State) -> u64 {
    state.messages.iter().map(|m| message_chars(m) / 4).sum::<u64>().max(state.messages.len() as u64)
}

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("summarization request failed: {0}")]
    Llm(#[from] crate::llm::LlmError),
}

/// One contiguous run of messages bounded by successful `todo_write` tool
/// results — the unit of work the context manager may choose to replace
/// with a single summary message.
struct Segment {
    start: usize,
    end: usize,
    /// This segment's last message is a successful `todo_write` result,
    /// i.e. the agent itself marked a clean stopping point here.
    closed: bool,
}

fn is_todo_write_success(message: &Message) -> bool {
    message.content.iter().any(|b| matches!(
        b,
        ContentBlock::ToolResult { name, is_error, .. } if name == crate::tools::ToolRegistry::SEGMENT_BOUNDARY_TOOL && !is_error
    ))
}

/// Split `messages` into segments at every successful `todo_write` result.
/// The final segment is always open (it has no closing boundary yet) even
/// if the conversation happens to end exactly on one.
fn segment(messages: &[Message]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut start = 0;
    for (idx, message) in messages.iter().enumerate() {
        if is_todo_write_success(message) {
            segments.push(Segment { start, end: idx + 1, closed: true });
            start = idx + 1;
        }
    }
    if start < messages.len() {
        segments.push(Segment { start, end: messages.len(), closed: false });
    }
    segments
}

/// A segment is a planning segment (Requirements/Design/Tasks) if its
/// first user-authored text mentions that triad — these are cheap to keep
/// and expensive to summarize away, since later turns re-read them often.
fn looks_like_planning_segment(messages: &[Message]) -> bool {
    messages.iter().take(2).any(|m| {
        m.content.iter().any(|b| match b {
            ContentBlock::UserText { text } | ContentBlock::AssistantText { text } => {
                let lower = text.to_lowercase();
                lower.contains("requirements") && lower.contains("design") && lower.contains("tasks")
            }
            _ => false,
        })
    })
}

/// Grow `[start, end)` leftward/rightward until every `ToolCall` inside it
/// has its matching `ToolResult` inside it too — collapsing a segment must
/// never leave a dangling pair behind (P1).
fn widen_to_preserve_pairing(messages: &[Message], mut start: usize, mut end: usize) -> (usize, usize) {
    loop {
        let mut open_ids = std::collections::HashSet::new();
        for message in &messages[start..end] {
            for block in &message.content {
                match block {
                    ContentBlock::ToolCall { id, .. } => {
                        open_ids.insert(id.clone());
                    }
                    ContentBlock::ToolResult { id, .. } => {
                        open_ids.remove(id);
                    }
                    _ => {}
                }
            }
        }
        if open_ids.is_empty() {
            return (start, end);
        }
        // The unmatched id is either a call whose result lives just past
        // `end`, or a result whose call lives just before `start`. Grow
        // whichever side still has room; if neither can grow, the window
        // already spans the whole history and the loop below no-ops.
        if end < messages.len() {
            end += 1;
        } else if start > 0 {
            start -= 1;
        } else {
            return (start, end);
        }
    }
}

const SUMMARY_PROMPT: &str = "Summarize the following slice of an agent's work log into a \
single concise paragraph a future turn can use as context. Preserve concrete facts (file \
paths, commands run, decisions made, values discovered); drop narration and repeated tool \
output. Respond with the summary paragraph only, no preamble.";

fn render_segment_for_summary(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        for block in &message.content {
            match block {
                ContentBlock::UserText { text } => out.push_str(&format!("User: {text}\n")),
                ContentBlock::AssistantText { text } => out.push_str(&format!("Assistant: {text}\n")),
                ContentBlock::ToolCall { name, input, .. } => {
                    out.push_str(&format!("Assistant called {name}({input})\n"));
                }
                ContentBlock::ToolResult { name, output, is_error, .. } => {
                    let tag = if *is_error { "error" } else { "result" };
                    out.push_str(&format!("{name} {tag}: {output}\n"));
                }
                ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
            }
        }
    }
    out
}

async fn summarize(llm: &Arc<dyn LlmService>, transcript: &str) -> Result<String, CompactionError> {
    let request = LlmRequest {
        system: vec![SystemContent::new(SUMMARY_PROMPT)],
        messages: vec![LlmMessage {
            role: MessageRole::User,
            content: vec![LlmBlock::Text { text: transcript.to_string() }],
        }],
        tools: vec![],
        max_tokens: Some(512),
        temperature: Some(0.0),
        thinking_tokens: None,
    };
    let response = llm.complete(&request).await?;
    Ok(response.text())
}

fn summary_message(index: usize, text: String) -> Message {
    Message::assistant(vec![ContentBlock::AssistantText {
        text: format!("[Sub Task {}] {}", index + 1, text),
    }])
}

/// Tracks the token budget for one session and performs todo-aware
/// compaction against its `State`.
pub struct ContextManager {
    context_window: usize,
}

impl ContextManager {
    pub fn new(context_window: usize) -> Self {
        Self { context_window }
    }

    pub fn budget_exceeded(&self, state: &State) -> bool {
        estimate_state_tokens(state) as f64 > self.context_window as f64 * AUTO_COMPACT_THRESHOLD
    }

    /// Auto-triggered compaction: summarize completed, non-planning
    /// segments outside the most recent `PRESERVE_RECENT_SEGMENTS`
    /// window. Returns `None` if nothing was eligible — the caller then
    /// falls back to `full_history_compact`.
    pub async fn compact(
        &self,
        state: &State,
        llm: &Arc<dyn LlmService>,
    ) -> Result<Option<State>, CompactionError> {
        let segments = segment(&state.messages);
        let closed_count = segments.iter().filter(|s| s.closed).count();
        if closed_count == 0 {
            return Ok(None);
        }

        let mut eligible: Vec<usize> = segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.closed)
            .map(|(i, _)| i)
            .collect();
        eligible.truncate(closed_count.saturating_sub(PRESERVE_RECENT_SEGMENTS));
        eligible.retain(|&i| !looks_like_planning_segment(&state.messages[segments[i].start..segments[i].end]));

        if eligible.is_empty() {
            return Ok(None);
        }

        let mut new_messages = Vec::with_capacity(state.messages.len());
        let mut cursor = 0;
        let mut summarized_any = false;

        for (idx, seg) in segments.iter().enumerate() {
            if !eligible.contains(&idx) {
                new_messages.extend_from_slice(&state.messages[cursor.max(seg.start)..seg.end]);
                cursor = seg.end;
                continue;
            }
            let (start, end) = widen_to_preserve_pairing(&state.messages, seg.start, seg.end);
            if start < cursor {
                // Pairing forced this segment to swallow territory already
                // emitted verbatim; nothing left to summarize here.
                continue;
            }
            let transcript = render_segment_for_summary(&state.messages[start..end]);
            let summary = summarize(llm, &transcript).await?;
            new_messages.push(summary_message(idx, summary));
            // Preserve the segment's closing TodoWrite call/result so task
            // structure stays visible even once the work under it is
            // summarized away.
            new_messages.push(state.messages[seg.end - 2].clone());
            new_messages.push(state.messages[seg.end - 1].clone());
            summarized_any = true;
            cursor = end;
        }
        new_messages.extend_from_slice(&state.messages[cursor..]);

        if !summarized_any {
            return Ok(None);
        }

        let mut compacted = state.clone();
        compacted.messages = new_messages;

        debug_assert!(compacted.validate_pairing(), "compaction must preserve tool-call pairing");
        debug_assert!(
            estimate_state_tokens(&compacted) <= estimate_state_tokens(state),
            "compaction must never increase token count"
        );

        Ok(Some(compacted))
    }

    /// User-initiated `/compact`: always replaces the entire history with
    /// one summary, regardless of todo segmentation.
    pub async fn full_history_compact(
        &self,
        state: &State,
        llm: &Arc<dyn LlmService>,
    ) -> Result<State, CompactionError> {
        let transcript = render_segment_for_summary(&state.messages);
        let summary = summarize(llm, &transcript).await?;
        let mut compacted = State::default();
        compacted.turn_count = state.turn_count;
        compacted.push(Message::user_text("[earlier conversation summarized]"));
        compacted.push(summary_message(0, summary));
        Ok(compacted)
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_segment_messages() -> Vec<Message> {
        vec![
            Message::user_text("do the thing"),
            Message::assistant(vec![ContentBlock::ToolCall {
                id: "1".into(),
                name: "todo_write".into(),
                input: serde_json::json!({"todos": []}),
            }]),
            Message::tool_result("1", "todo_write", "recorded 1 todo(s)", false),
        ]
    }

    #[test]
    fn segments_split_on_successful_todo_write() {
        let mut messages = closed_segment_messages();
        messages.push(Message::user_text("next thing"));
        let segments = segment(&messages);
        assert_eq!(segments.len(), 2);
        assert!(segments[0].closed);
        assert!(!segments[1].closed);
    }

    #[test]
    fn unclosed_history_is_a_single_open_segment() {
        let messages = vec![Message::user_text("hi")];
        let segments = segment(&messages);
        assert_eq!(segments.len(), 1);
        assert!(!segments[0].closed);
    }

    #[test]
    fn widening_grows_until_pairing_holds() {
        let messages = vec![
            Message::assistant(vec![ContentBlock::ToolCall {
                id: "1".into(),
                name: "bash".into(),
                input: serde_json::json!({}),
            }]),
            Message::tool_result("1", "bash", "ok", false),
            Message::user_text("next"),
        ];
        // A naive cut at [0, 1) would strand the ToolCall without its
        // ToolResult; widening must pull index 1 in too.
        let (start, end) = widen_to_preserve_pairing(&messages, 0, 1);
        assert_eq!((start, end), (0, 2));
    }

    #[test]
    fn planning_segment_is_recognized_by_its_keywords() {
        let messages = vec![Message::user_text(
            "Here is the Requirements, Design, and Tasks breakdown for this feature",
        )];
        assert!(looks_like_planning_segment(&messages));
    }

    #[test]
    fn budget_exceeded_respects_threshold() {
        let manager = ContextManager::new(100);
        let mut state = State::default();
        for _ in 0..200 {
            state.push(Message::user_text("x".repeat(20)));
        }
        assert!(manager.budget_exceeded(&state));

        let small_manager = ContextManager::new(1_000_000);
        assert!(!small_manager.budget_exceeded(&state));
    }
}
