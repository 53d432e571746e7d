//! The wire event kinds streamed to every subscriber of a session
//! (`EventStream`, §4.F) and the fan-out primitive itself.
//!
//! An `Event` always carries `session_id` and a monotonically increasing
//! `seq` so a transport adapter (WebSocket, stdio CLI, HTTP) can detect
//! gaps or replay loss without this crate knowing anything about the
//! transport.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};

/// The fixed set of event kinds a session ever emits. Transport adapters
/// pass these through unchanged and in order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    ConnectionEstablished,
    AgentInitialized { system_prompt_chars: usize },
    Processing,
    UserMessage { text: String, attachments: Vec<String> },
    AgentThinking { text: String },
    AgentMessage { text: String },
    ToolCall { id: String, name: String, input: Value },
    ToolResult { id: String, name: String, output: String, is_error: bool },
    FileEdit { path: String, total_lines: usize },
    WorkspaceInfo { root: String },
    PromptGenerated { system_prompt: String },
    Error { message: String },
    System { message: String },
    Pong,
    StreamComplete,
}

/// One emission: a `body` plus the session it belongs to and its position
/// in that session's total order.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub content: EventBody,
    pub session_id: String,
    pub seq: u64,
}

impl EventBody {
    fn kind(&self) -> &'static str {
        match self {
            EventBody::ConnectionEstablished => "connection_established",
            EventBody::AgentInitialized { .. } => "agent_initialized",
            EventBody::Processing => "processing",
            EventBody::UserMessage { .. } => "user_message",
            EventBody::AgentThinking { .. } => "agent_thinking",
            EventBody::AgentMessage { .. } => "agent_message",
            EventBody::ToolCall { .. } => "tool_call",
            EventBody::ToolResult { .. } => "tool_result",
            EventBody::FileEdit { .. } => "file_edit",
            EventBody::WorkspaceInfo { .. } => "workspace_info",
            EventBody::PromptGenerated { .. } => "prompt_generated",
            EventBody::Error { .. } => "error",
            EventBody::System { .. } => "system",
            EventBody::Pong => "pong",
            EventBody::StreamComplete => "stream_complete",
        }
    }
}

/// Per-subscriber bounded queue. A slow subscriber drops its own
/// overflow (the sender is told via a synthesized `Error` event on next
/// successful send) rather than blocking — or stalling — any other
/// subscriber or the session that's emitting.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

struct Subscriber {
    tx: mpsc::Sender<Event>,
    dropped: bool,
}

/// Publish/subscribe fan-out for a single session's events. FIFO per
/// subscriber; subscribers may come and go at any time and hold no
/// ownership over the session.
pub struct EventStream {
    session_id: String,
    next_seq: std::sync::atomic::AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber_id: std::sync::atomic::AtomicU64,
}

impl EventStream {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            next_seq: std::sync::atomic::AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Register a new subscriber; returns a handle that can be used to
    /// unsubscribe and a receiver for events from this point forward.
    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = self
            .next_subscriber_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.subscribers
            .lock()
            .await
            .insert(id, Subscriber { tx, dropped: false });
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().await.remove(&id);
    }

    /// Emit one event to every current subscriber, assigning it the next
    /// sequence number for this session. Never blocks on a slow
    /// subscriber: a full queue marks that subscriber as having dropped
    /// events, surfaced as a single synthesized `Error` the next time it
    /// has room.
    pub async fn emit(&self, body: EventBody) {
        let seq = self.next_seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let event = Event {
            kind: body.kind(),
            content: body,
            session_id: self.session_id.clone(),
            seq,
        };

        let mut subscribers = self.subscribers.lock().await;
        for subscriber in subscribers.values_mut() {
            if subscriber.dropped {
                let notice = Event {
                    kind: "error",
                    content: EventBody::Error {
                        message: "one or more events were dropped; subscriber fell behind".into(),
                    },
                    session_id: self.session_id.clone(),
                    seq,
                };
                if subscriber.tx.try_send(notice).is_ok() {
                    subscriber.dropped = false;
                }
                continue;
            }
            if subscriber.tx.try_send(event.clone()).is_err() {
                subscriber.dropped = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_are_delivered_in_order() {
        let stream = EventStream::new("s1");
        let (_id, mut rx) = stream.subscribe().await;

        stream.emit(EventBody::Processing).await;
        stream.emit(EventBody::AgentMessage { text: "hi".into() }).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert!(matches!(second.content, EventBody::AgentMessage { .. }));
    }

    #[tokio::test]
    async fn unsubscribed_receiver_gets_nothing_further() {
        let stream = EventStream::new("s1");
        let (id, mut rx) = stream.subscribe().await;
        stream.unsubscribe(id).await;
        stream.emit(EventBody::Processing).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_fast_one() {
        let stream = EventStream::new("s1");
        let (_slow_id, slow_rx) = stream.subscribe().await;
        let (_fast_id, mut fast_rx) = stream.subscribe().await;
        drop(slow_rx); // channel is now permanently closed, try_send will err

        for _ in 0..(SUBSCRIBER_QUEUE_DEPTH + 5) {
            stream.emit(EventBody::Processing).await;
        }
        // The fast subscriber's queue only holds SUBSCRIBER_QUEUE_DEPTH
        // messages; this just proves the emit loop never awaited on the
        // dead receiver and the fast one kept receiving.
        assert!(fast_rx.recv().await.is_some());
    }
}
