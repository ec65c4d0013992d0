//! SSE (Server-Sent Events) streaming for token-by-token responses.
//!
//! Converts a channel of GenerationEvents into an SSE stream. Events arrive
//! in strict generation order; warnings (e.g. cache-load fallback) travel
//! in-stream so the caller always observes a degradation.

use axum::response::sse::Event;
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::inference::engine::GenerationEvent;

/// One streamed chunk.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Token {
        index: usize,
        text: String,
    },
    Warning {
        message: String,
    },
    Done {
        completion_tokens: usize,
        used_cache: Option<String>,
        fallback: bool,
    },
    Cancelled {
        completion_tokens: usize,
    },
    Error {
        message: String,
    },
}

impl From<GenerationEvent> for StreamChunk {
    fn from(event: GenerationEvent) -> Self {
        match event {
            GenerationEvent::Token { index, text } => StreamChunk::Token { index, text },
            GenerationEvent::Warning { message } => StreamChunk::Warning { message },
            GenerationEvent::Done {
                completion_tokens,
                used_cache,
                fallback,
            } => StreamChunk::Done {
                completion_tokens,
                used_cache,
                fallback,
            },
            GenerationEvent::Cancelled { completion_tokens } => {
                StreamChunk::Cancelled { completion_tokens }
            }
            GenerationEvent::Error(message) => StreamChunk::Error { message },
        }
    }
}

/// Convert a generation event receiver into an SSE stream, terminated by a
/// `[DONE]` sentinel.
pub fn generation_to_sse_stream(
    rx: mpsc::Receiver<GenerationEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    ReceiverStream::new(rx)
        .map(|event| {
            let chunk = StreamChunk::from(event);
            let data = serde_json::to_string(&chunk).unwrap_or_default();
            Ok(Event::default().data(data))
        })
        .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))))
}
