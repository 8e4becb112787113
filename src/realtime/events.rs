//! Realtime websocket event model (spec §4.3 step C.6-C.9, §7 item 6).
//!
//! A typed enum over the subset of server events this orchestrator acts on,
//! plus a reader task that turns frames into them. Unknown event types
//! deserialize to `Other` rather than failing the stream, since the
//! realtime transport adds event types over time.

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Error codes the agent may surface that are expected and must not tear
/// down the call (spec §7 item 6).
pub const NON_FATAL_ERROR_CODES: &[&str] = &[
    "cannot_update_voice",
    "unknown_parameter",
    "conversation_already_has_active_response",
];

#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    SessionCreated,
    SessionUpdated,
    ResponseDone,
    TranscriptionCompleted { transcript: String },
    OutputAudioTranscriptDone { transcript: String },
    Error { code: String, message: String },
    Other,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    transcript: Option<String>,
    error: Option<RawError>,
}

#[derive(Debug, Deserialize)]
struct RawError {
    code: Option<String>,
    message: Option<String>,
}

pub fn parse_event(text: &str) -> RealtimeEvent {
    let raw: RawEvent = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!("⚠️ unparseable realtime event frame: {}", e);
            return RealtimeEvent::Other;
        }
    };

    match raw.kind.as_str() {
        "session.created" => RealtimeEvent::SessionCreated,
        "session.updated" => RealtimeEvent::SessionUpdated,
        "response.done" => RealtimeEvent::ResponseDone,
        "conversation.item.input_audio_transcription.completed" => RealtimeEvent::TranscriptionCompleted {
            transcript: raw.transcript.unwrap_or_default(),
        },
        "response.output_audio_transcript.done" => RealtimeEvent::OutputAudioTranscriptDone {
            transcript: raw.transcript.unwrap_or_default(),
        },
        "error" => {
            let err = raw.error.unwrap_or(RawError { code: None, message: None });
            RealtimeEvent::Error {
                code: err.code.unwrap_or_default(),
                message: err.message.unwrap_or_default(),
            }
        }
        _ => RealtimeEvent::Other,
    }
}

pub fn is_non_fatal(code: &str) -> bool {
    NON_FATAL_ERROR_CODES.contains(&code)
}

/// Drains a websocket stream, forwarding parsed events to `tx`. Returns when
/// the socket closes or errors; the caller decides what that means for the
/// call (normal disconnect vs. transport failure).
pub async fn run_reader<S>(mut stream: S, tx: mpsc::UnboundedSender<RealtimeEvent>)
where
    S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let event = parse_event(&text);
                debug!("📨 realtime event: {:?}", event);
                if tx.send(event).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("⚠️ realtime websocket error: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transcription_completed() {
        let raw = r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"hello doctor"}"#;
        match parse_event(raw) {
            RealtimeEvent::TranscriptionCompleted { transcript } => assert_eq!(transcript, "hello doctor"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_error_with_code() {
        let raw = r#"{"type":"error","error":{"code":"cannot_update_voice","message":"voice locked"}}"#;
        match parse_event(raw) {
            RealtimeEvent::Error { code, .. } => assert!(is_non_fatal(&code)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_other_not_an_error() {
        let raw = r#"{"type":"some.future.event"}"#;
        assert!(matches!(parse_event(raw), RealtimeEvent::Other));
    }

    #[test]
    fn garbage_frame_is_other() {
        assert!(matches!(parse_event("not json"), RealtimeEvent::Other));
    }
}
