//! Wire message types.
//!
//! Outbound (engine → consumer), one JSON object per text frame:
//! - `start` — handshake with call id, tracks, and media format
//! - `media` — one base64 audio chunk with media-clock timestamp
//! - `stop`  — final frame of a drained stream
//! - `playedStream` — a named checkpoint has been played out
//! - `incorrectPayload` — the consumer sent something unusable
//! - `media.cleared` — acknowledgement of a clear request
//!
//! Inbound (consumer → engine): `media.play`, `media.checkpoint`,
//! `media.clear`, `transcription.send`. Anything else is answered with
//! `incorrectPayload` and dropped.
//!
//! Field casing is part of the wire contract: `stream_id` everywhere
//! except `media.cleared`, which historically carries camelCase
//! `streamId` and is preserved for compatibility.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::codec::StreamCodec;
use crate::errors::ProtocolError;

// =============================================================================
// Outbound messages
// =============================================================================

/// `start` — first frame after the connection is established.
#[derive(Debug, Clone, Serialize)]
pub struct StartMessage {
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    pub event: &'static str,
    pub start: StartBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_headers: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartBody {
    #[serde(rename = "callId")]
    pub call_id: String,
    pub stream_id: String,
    pub tracks: Vec<&'static str>,
    #[serde(rename = "mediaFormat")]
    pub media_format: MediaFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaFormat {
    pub encoding: &'static str,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
}

impl StartMessage {
    pub fn new(
        sequence_number: u64,
        call_id: &str,
        stream_id: &str,
        tracks: Vec<&'static str>,
        codec: StreamCodec,
        sample_rate: u32,
        extra_headers: Option<String>,
    ) -> Self {
        Self {
            sequence_number,
            event: "start",
            start: StartBody {
                call_id: call_id.to_string(),
                stream_id: stream_id.to_string(),
                tracks,
                media_format: MediaFormat {
                    encoding: codec.encoding_name(),
                    sample_rate,
                },
            },
            extra_headers,
        }
    }
}

/// `media` — one audio chunk.
#[derive(Debug, Clone, Serialize)]
pub struct MediaMessage {
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    pub stream_id: String,
    pub event: &'static str,
    pub media: MediaBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_headers: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaBody {
    pub track: &'static str,
    /// Microseconds since stream start, as a decimal string
    pub timestamp: String,
    /// Transmitted chunk count, 1-based
    pub chunk: u64,
    /// Base64 (standard alphabet, padded) audio bytes
    pub payload: String,
}

impl MediaMessage {
    pub fn new(
        sequence_number: u64,
        stream_id: &str,
        track: &'static str,
        timestamp_micros: u64,
        chunk: u64,
        payload_b64: String,
        extra_headers: Option<String>,
    ) -> Self {
        Self {
            sequence_number,
            stream_id: stream_id.to_string(),
            event: "media",
            media: MediaBody {
                track,
                timestamp: timestamp_micros.to_string(),
                chunk,
                payload: payload_b64,
            },
            extra_headers,
        }
    }
}

/// `stop` — final frame of a drained stream.
#[derive(Debug, Clone, Serialize)]
pub struct StopMessage {
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    pub stream_id: String,
    pub event: &'static str,
    pub stop: StopBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_headers: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopBody {
    #[serde(rename = "callId")]
    pub call_id: String,
}

impl StopMessage {
    pub fn new(
        sequence_number: u64,
        call_id: &str,
        stream_id: &str,
        extra_headers: Option<String>,
    ) -> Self {
        Self {
            sequence_number,
            stream_id: stream_id.to_string(),
            event: "stop",
            stop: StopBody {
                call_id: call_id.to_string(),
            },
            extra_headers,
        }
    }
}

/// `playedStream` — playback passed a named checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PlayedMessage {
    pub event: &'static str,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    pub stream_id: String,
    pub name: String,
}

impl PlayedMessage {
    pub fn new(sequence_number: u64, stream_id: &str, name: &str) -> Self {
        Self {
            event: "playedStream",
            sequence_number,
            stream_id: stream_id.to_string(),
            name: name.to_string(),
        }
    }
}

/// `incorrectPayload` — the consumer sent something the engine cannot use.
#[derive(Debug, Clone, Serialize)]
pub struct IncorrectPayloadMessage {
    pub event: &'static str,
    pub stream_id: String,
    /// The offending inbound message, echoed back
    pub payload: String,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
}

impl IncorrectPayloadMessage {
    pub fn new(sequence_number: u64, stream_id: &str, payload: &str) -> Self {
        Self {
            event: "incorrectPayload",
            stream_id: stream_id.to_string(),
            payload: payload.to_string(),
            sequence_number,
        }
    }
}

/// `media.cleared` — acknowledgement of `media.clear`.
///
/// Note the camelCase `streamId`; this is the one message where the
/// historical casing differs, kept for wire compatibility.
#[derive(Debug, Clone, Serialize)]
pub struct ClearedMessage {
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    #[serde(rename = "streamId")]
    pub stream_id: String,
    pub event: &'static str,
}

impl ClearedMessage {
    pub fn new(sequence_number: u64, stream_id: &str) -> Self {
        Self {
            sequence_number,
            stream_id: stream_id.to_string(),
            event: "media.cleared",
        }
    }
}

/// Serialize an outbound message; outbound types cannot fail to encode.
pub fn encode<T: Serialize>(message: &T) -> String {
    serde_json::to_string(message).unwrap_or_default()
}

// =============================================================================
// Inbound messages
// =============================================================================

/// A validated inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    MediaPlay(PlayAudio),
    /// Checkpoint name from the top-level `name` field; absent names are
    /// ignored by the session with a warning
    MediaCheckpoint { name: Option<String> },
    MediaClear,
    /// Raw JSON is forwarded to the host untouched
    TranscriptionSend,
}

/// Validated `media.play` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayAudio {
    /// Base64 audio, not yet decoded
    pub payload: String,
    /// Codec of the carried audio; `raw`/`wav` map to PCM16
    pub codec: StreamCodec,
    /// Declared sample rate, coerced into {8000, 16000}
    pub sample_rate: u32,
}

#[derive(Debug, Deserialize)]
struct PlayMediaRaw {
    payload: Option<String>,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    #[serde(rename = "sampleRate")]
    sample_rate: Option<u32>,
}

/// Parse and validate one inbound text frame.
///
/// The error variants carry the exact reason strings echoed in the
/// `incorrectPayload` acknowledgement.
pub fn parse_inbound(raw: &str) -> Result<InboundEvent, ProtocolError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| ProtocolError::InvalidJson)?;
    let event = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingEvent)?;

    match event {
        "media.play" => {
            let media = value.get("media").ok_or(ProtocolError::MissingMedia)?;
            let media: PlayMediaRaw = serde_json::from_value(media.clone())
                .map_err(|_| ProtocolError::MissingMedia)?;

            let payload = media.payload.ok_or(ProtocolError::MissingPayload)?;
            let content_type = media.content_type.ok_or(ProtocolError::MissingContentType)?;
            let declared_rate = media.sample_rate.ok_or(ProtocolError::MissingSampleRate)?;

            let sample_rate = if declared_rate == 8000 || declared_rate == 16000 {
                declared_rate
            } else {
                debug!(declared_rate, "unsupported sample rate, defaulting to 8000");
                8000
            };

            let codec = match content_type.as_str() {
                "audio/x-l16" | "raw" | "wav" => StreamCodec::L16,
                "audio/x-mulaw" => {
                    if sample_rate != 8000 {
                        return Err(ProtocolError::CodecRateMismatch);
                    }
                    StreamCodec::Ulaw
                }
                _ => return Err(ProtocolError::UnsupportedContentType),
            };

            Ok(InboundEvent::MediaPlay(PlayAudio {
                payload,
                codec,
                sample_rate,
            }))
        }
        "media.checkpoint" => Ok(InboundEvent::MediaCheckpoint {
            name: value
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        "media.clear" => Ok(InboundEvent::MediaClear),
        "transcription.send" => Ok(InboundEvent::TranscriptionSend),
        _ => Err(ProtocolError::UnknownEvent),
    }
}
