use devflow_core::protocol::{decode_message, EventEnvelope, FrameError, ServerMessage};
use devflow_core::DomainEvent;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// One inbound unit as the transport delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    /// A WebSocket text frame carrying a full server message.
    Text(String),
    /// A Server-Sent Events frame: event name plus data body.
    Sse { event: String, data: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("sse `{event}` body is not valid json: {message}")]
    SseBody { event: String, message: String },
    #[error("event payload rejected: {0}")]
    Event(String),
}

/// Turns raw transport messages into typed server messages. Failures are
/// logged and counted; they never reach the reconciliation engine.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    max_frame_bytes: usize,
    dropped: u64,
}

impl EventDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            dropped: 0,
        }
    }

    /// Messages discarded as malformed so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn decode(&mut self, raw: &RawMessage) -> Option<ServerMessage> {
        match self.try_decode(raw) {
            Ok(message) => Some(message),
            Err(err) => {
                self.dropped += 1;
                warn!(event = "live_decode_error", error = %err, dropped = self.dropped);
                None
            }
        }
    }

    pub fn try_decode(&self, raw: &RawMessage) -> Result<ServerMessage, DecodeError> {
        match raw {
            RawMessage::Text(text) => Ok(decode_message(text, self.max_frame_bytes)?),
            RawMessage::Sse { event, data } => self.decode_sse(event, data),
        }
    }

    fn decode_sse(&self, event: &str, data: &str) -> Result<ServerMessage, DecodeError> {
        if data.len() > self.max_frame_bytes {
            return Err(FrameError::OversizedFrame {
                size: data.len(),
                max: self.max_frame_bytes,
            }
            .into());
        }
        let name = event.trim();
        match name {
            "ping" | "heartbeat" | "keepalive" => return Ok(ServerMessage::Pong),
            "connected" | "subscribed" => return Ok(ServerMessage::Subscribed),
            "error" => {
                let message = serde_json::from_str::<Value>(data)
                    .ok()
                    .and_then(|body| {
                        body.get("message")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| data.trim().to_string());
                return Ok(ServerMessage::Error { message });
            }
            _ => {}
        }

        let body: Value = serde_json::from_str(data).map_err(|err| DecodeError::SseBody {
            event: name.to_string(),
            message: err.to_string(),
        })?;
        if name.is_empty() || name == "message" {
            if body.get("event").is_none() {
                debug!(event = "live_sse_full_message");
                return serde_json::from_value(body)
                    .map_err(|err| FrameError::Decode(err.to_string()).into());
            }
            return self.envelope_event(body, None);
        }
        self.envelope_event(body, Some(name))
    }

    fn envelope_event(
        &self,
        body: Value,
        kind: Option<&str>,
    ) -> Result<ServerMessage, DecodeError> {
        let event = match body {
            Value::Object(mut map) if map.contains_key("event") => {
                map.remove("event").unwrap_or(Value::Null)
            }
            other => other,
        };
        let event = DomainEvent::from_value(event, kind)
            .map_err(|err| DecodeError::Event(err.to_string()))?;
        Ok(ServerMessage::Event {
            envelope: EventEnvelope { event },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_core::protocol::DEFAULT_MAX_FRAME_BYTES;
    use devflow_core::EventKind;

    fn decoder() -> EventDecoder {
        EventDecoder::new(DEFAULT_MAX_FRAME_BYTES)
    }

    fn sse(event: &str, data: &str) -> RawMessage {
        RawMessage::Sse {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    fn event_kind(message: Option<ServerMessage>) -> Option<EventKind> {
        match message {
            Some(ServerMessage::Event { envelope }) => envelope.event.kind(),
            _ => None,
        }
    }

    #[test]
    fn websocket_event_frame_decodes() {
        let mut decoder = decoder();
        let message = decoder.decode(&RawMessage::Text(
            r#"{"type":"event","envelope":{"event":{"type":"session.started","task_id":"t1","session_id":"s1"}}}"#
                .to_string(),
        ));
        assert_eq!(event_kind(message), Some(EventKind::SessionStarted));
        assert_eq!(decoder.dropped(), 0);
    }

    #[test]
    fn malformed_frames_are_dropped_and_counted() {
        let mut decoder = decoder();
        for raw in [
            "not json",
            r#"{"envelope":{}}"#,
            r#"{"type":"welcome"}"#,
            r#"{"type":"event","envelope":{"event":{"type":"task.status_changed","task_id":"t1"}}}"#,
        ] {
            assert_eq!(decoder.decode(&RawMessage::Text(raw.to_string())), None);
        }
        assert_eq!(decoder.dropped(), 4);
        assert_eq!(
            decoder.decode(&RawMessage::Text(r#"{"type":"pong"}"#.to_string())),
            Some(ServerMessage::Pong)
        );
    }

    #[test]
    fn sse_named_event_uses_header_as_kind() {
        let mut decoder = decoder();
        let message = decoder.decode(&sse(
            "task.status_changed",
            r#"{"event":{"task_id":"t1","to_status":"review"}}"#,
        ));
        assert_eq!(event_kind(message), Some(EventKind::TaskStatusChanged));

        let bare = decoder.decode(&sse("phase.completed", r#"{"task_id":"t1","phase":"coding"}"#));
        assert_eq!(event_kind(bare), Some(EventKind::PhaseCompleted));
    }

    #[test]
    fn sse_default_event_accepts_envelope_or_full_message() {
        let mut decoder = decoder();
        let envelope = decoder.decode(&sse(
            "message",
            r#"{"event":{"type":"workspace.merged","task_id":"t1"}}"#,
        ));
        assert_eq!(event_kind(envelope), Some(EventKind::WorkspaceMerged));

        let full = decoder.decode(&sse("", r#"{"type":"subscribed"}"#));
        assert_eq!(full, Some(ServerMessage::Subscribed));
    }

    #[test]
    fn sse_control_events_map_to_server_messages() {
        let mut decoder = decoder();
        assert_eq!(decoder.decode(&sse("ping", "")), Some(ServerMessage::Pong));
        assert_eq!(
            decoder.decode(&sse("error", r#"{"message":"unknown task"}"#)),
            Some(ServerMessage::Error {
                message: "unknown task".to_string()
            })
        );
        assert_eq!(
            decoder.decode(&sse("error", "filter rejected")),
            Some(ServerMessage::Error {
                message: "filter rejected".to_string()
            })
        );
    }

    #[test]
    fn sse_garbage_body_is_dropped() {
        let mut decoder = decoder();
        assert_eq!(decoder.decode(&sse("task.created", "{oops")), None);
        assert_eq!(decoder.decode(&sse("message", r#"{"event":{}}"#)), None);
        assert_eq!(decoder.dropped(), 2);
    }
}
