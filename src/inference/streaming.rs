//! SSE streaming response parser for OpenAI-compatible chat completions.
//!
//! Reads a response body as a byte stream, splits on SSE boundaries
//! (`data: …\n\n`), parses each chunk as JSON, and yields the text deltas.
//! Event boundaries are found on raw bytes so a multi-byte character split
//! across network reads is decoded intact.

use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use super::errors::InferenceError;
use super::types::ChatCompletionChunk;

// ─── SSE parser ──────────────────────────────────────────────────────────────

/// Parse an SSE byte stream into text deltas.
///
/// Empty deltas and keep-alives are skipped; `data: [DONE]` ends the stream.
pub fn parse_sse_stream<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<String, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    stream::unfold(
        (byte_stream, Vec::<u8>::new(), false),
        |(mut byte_stream, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(event_end) = find_event_end(&buffer) {
                    let event: Vec<u8> = buffer.drain(..event_end + 2).collect();
                    let event = String::from_utf8_lossy(&event[..event_end]).into_owned();

                    match process_event(&event) {
                        EventOutcome::Token(token) => {
                            return Some((Ok(token), (byte_stream, buffer, false)))
                        }
                        EventOutcome::Skip => continue,
                        EventOutcome::Done => return None,
                        EventOutcome::Failed(e) => {
                            return Some((Err(e), (byte_stream, buffer, false)))
                        }
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(bytes.as_ref()),
                    Some(Err(e)) => {
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, buffer, true),
                        ));
                    }
                    None => {
                        // Stream ended without a trailing blank line.
                        let rest = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        if rest.is_empty() {
                            return None;
                        }
                        return match process_event(&rest) {
                            EventOutcome::Token(token) => {
                                Some((Ok(token), (byte_stream, buffer, true)))
                            }
                            EventOutcome::Failed(e) => Some((Err(e), (byte_stream, buffer, true))),
                            EventOutcome::Skip | EventOutcome::Done => None,
                        };
                    }
                }
            }
        },
    )
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

enum EventOutcome {
    Token(String),
    Skip,
    Done,
    Failed(InferenceError),
}

/// Process a single SSE event (may contain multiple `data:` lines).
fn process_event(event: &str) -> EventOutcome {
    let mut data_content = String::new();

    for line in event.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
            let data = data.trim();
            if data == "[DONE]" {
                return EventOutcome::Done;
            }
            data_content.push_str(data);
        }
    }

    if data_content.is_empty() {
        return EventOutcome::Skip;
    }

    let chunk: ChatCompletionChunk = match serde_json::from_str(&data_content) {
        Ok(chunk) => chunk,
        Err(e) => {
            return EventOutcome::Failed(InferenceError::StreamError {
                reason: format!("failed to parse SSE chunk: {e} (data: {data_content})"),
            })
        }
    };

    match chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
    {
        Some(content) if !content.is_empty() => EventOutcome::Token(content),
        _ => EventOutcome::Skip,
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Extract the assistant text from a non-streaming response body.
pub fn parse_non_streaming_response(body: &str) -> Result<String, InferenceError> {
    #[derive(Deserialize)]
    struct NonStreamResponse {
        choices: Vec<NonStreamChoice>,
    }

    #[derive(Deserialize)]
    struct NonStreamChoice {
        message: NonStreamMessage,
    }

    #[derive(Deserialize)]
    struct NonStreamMessage {
        content: Option<String>,
    }

    let resp: NonStreamResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse non-streaming response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::StreamError {
            reason: "empty choices array".into(),
        })?;

    Ok(choice.message.content.unwrap_or_default())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
