//! Reconstructs the assistant's text from a buffered chat event stream.
//!
//! The chat endpoint answers with line-oriented `data: <json>` events. Only
//! `text-delta` events carry text; everything else is ignored. Parsing is
//! lenient: a `data:` line that is not valid JSON contributes nothing, so a
//! truncated stream still yields whatever text could be decoded.

use serde::Deserialize;
use tracing::{debug, warn};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ChatStreamEvent {
    TextStart,
    TextDelta {
        #[serde(default)]
        delta: String,
    },
    TextEnd,
    Finish,
    Error {
        #[serde(default, rename = "errorText")]
        error_text: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Output of [`decode_event_stream_with_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedStream {
    /// Concatenated `text-delta` fragments, trimmed.
    pub text: String,
    /// Number of `data:` lines that decoded to an event.
    pub events: usize,
    /// Number of `data:` lines whose payload was not valid JSON.
    pub skipped_lines: usize,
}

/// Decodes a chat event stream body into the assistant's text.
pub fn decode_event_stream(body: &str) -> String {
    decode_event_stream_with_stats(body).text
}

/// Like [`decode_event_stream`], but also reports how many lines were skipped.
pub fn decode_event_stream_with_stats(body: &str) -> DecodedStream {
    let mut text = String::new();
    let mut events = 0;
    let mut skipped_lines = 0;

    for line in body.lines() {
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            continue;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        if payload.trim() == DONE_SENTINEL {
            continue;
        }
        match serde_json::from_str::<ChatStreamEvent>(payload) {
            Ok(event) => {
                events += 1;
                match event {
                    ChatStreamEvent::TextDelta { delta } => text.push_str(&delta),
                    ChatStreamEvent::Error { error_text } => {
                        warn!(
                            error = error_text.as_deref().unwrap_or("<no error text>"),
                            "Chat stream reported an error event"
                        );
                    }
                    ChatStreamEvent::TextStart
                    | ChatStreamEvent::TextEnd
                    | ChatStreamEvent::Finish
                    | ChatStreamEvent::Other => {}
                }
            }
            Err(_) => skipped_lines += 1,
        }
    }

    if skipped_lines > 0 {
        debug!(skipped_lines, events, "Skipped malformed chat stream lines");
    }

    DecodedStream {
        text: text.trim().to_string(),
        events,
        skipped_lines,
    }
}
