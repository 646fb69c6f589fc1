//! Host-side events emitted by the engine.
//!
//! The engine never talks to an event bus directly; the host supplies an
//! [`EventSink`] at supervisor construction and receives every lifecycle,
//! media, and error notification through it. Payloads are JSON objects
//! carrying at least `streamId`.

use std::sync::Arc;

use serde_json::{json, Value};

/// Kinds of host-side events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionEstablished,
    ConnectionFailed,
    ConnectionTimeout,
    ConnectionDegraded,
    ConnectionClosed,
    StreamStarted,
    StreamStopped,
    StreamError,
    StreamBufferOverrun,
    StreamHeartbeat,
    StreamTimeout,
    StreamInvalidInput,
    MediaPlayStart,
    MediaPlayComplete,
    MediaCleared,
    TranscriptionReceived,
    MessageReceived,
}

impl EventKind {
    /// Wire name of the event, as published on the host event bus.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ConnectionEstablished => "connection_established",
            EventKind::ConnectionFailed => "connection_failed",
            EventKind::ConnectionTimeout => "connection_timeout",
            EventKind::ConnectionDegraded => "connection_degraded",
            EventKind::ConnectionClosed => "connection_closed",
            EventKind::StreamStarted => "stream_started",
            EventKind::StreamStopped => "stream_stopped",
            EventKind::StreamError => "stream_error",
            EventKind::StreamBufferOverrun => "stream_buffer_overrun",
            EventKind::StreamHeartbeat => "stream_heartbeat",
            EventKind::StreamTimeout => "stream_timeout",
            EventKind::StreamInvalidInput => "stream_invalid_input",
            EventKind::MediaPlayStart => "media_play_start",
            EventKind::MediaPlayComplete => "media_play_complete",
            EventKind::MediaCleared => "media_cleared",
            EventKind::TranscriptionReceived => "transcription_received",
            EventKind::MessageReceived => "message_received",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single host-side event.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub kind: EventKind,
    /// Session id of the owning call
    pub call_id: String,
    /// JSON payload, always carrying `streamId`
    pub payload: Value,
}

impl StreamEvent {
    /// Event with the bare `{"streamId": ...}` payload.
    pub fn bare(kind: EventKind, call_id: &str, stream_id: &str) -> Self {
        Self {
            kind,
            call_id: call_id.to_string(),
            payload: json!({ "streamId": stream_id }),
        }
    }

    /// Event carrying a `reason` next to the stream id.
    pub fn with_reason(kind: EventKind, call_id: &str, stream_id: &str, reason: &str) -> Self {
        Self {
            kind,
            call_id: call_id.to_string(),
            payload: json!({ "streamId": stream_id, "reason": reason }),
        }
    }

    /// Event carrying an opaque passthrough payload (raw consumer JSON).
    pub fn passthrough(kind: EventKind, call_id: &str, stream_id: &str, raw: &str) -> Self {
        let payload = match serde_json::from_str::<Value>(raw) {
            Ok(value) => json!({ "streamId": stream_id, "payload": value }),
            Err(_) => json!({ "streamId": stream_id, "payload": raw }),
        };
        Self {
            kind,
            call_id: call_id.to_string(),
            payload,
        }
    }
}

/// Callback through which the engine publishes host-side events.
pub type EventSink = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Sink that drops every event, for hosts that do not subscribe.
pub fn null_sink() -> EventSink {
    Arc::new(|_event| {})
}
