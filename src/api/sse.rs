//! Server-Sent Events transport adapter over a session's `EventStream`.

use axum::response::sse::{Event as AxumEvent, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Adapt one subscriber's receiver into an axum SSE stream. Each
/// `crate::events::Event` is sent as a named SSE event carrying its JSON
/// body, so a client can dispatch on `event.type` without re-parsing.
pub fn sse_stream(
    rx: tokio::sync::mpsc::Receiver<crate::events::Event>,
) -> Sse<impl Stream<Item = Result<AxumEvent, Infallible>>> {
    let stream = ReceiverStream::new(rx).map(|event| Ok(event_to_axum(event)));

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

fn event_to_axum(event: crate::events::Event) -> AxumEvent {
    let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
    AxumEvent::default().event(event.kind).data(data)
}
