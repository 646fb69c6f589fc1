//! Error types for the streaming engine.
//!
//! Each layer owns a small error enum; `StreamError` folds them together
//! for the public API surface. The capture path and the inbound parse path
//! never surface these to the host directly — failures there are turned
//! into events (see `session`).

use thiserror::Error;

/// Result alias used across the engine.
pub type StreamResult<T> = Result<T, StreamError>;

/// Configuration and command-validation errors.
///
/// These refuse the operation without mutating session state.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// URL could not be parsed or has no host
    #[error("invalid websocket uri: {0}")]
    InvalidUrl(String),

    /// Scheme outside ws/wss/http/https
    #[error("invalid uri scheme: {0}")]
    InvalidScheme(String),

    /// Track must be inbound, outbound, or both
    #[error("invalid track: {0}")]
    InvalidTrack(String),

    /// Rate must be a positive multiple of 8000
    #[error("invalid sample rate: {0}")]
    InvalidRate(String),

    /// Bidirectional flag must be 0 or 1
    #[error("invalid bidirectional flag: {0}")]
    InvalidBidirectional(String),

    /// A stream with this id is already attached to the call
    #[error("stream already attached: {0}")]
    StreamExists(String),
}

/// Audio buffer errors at chunk granularity.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// Remaining capacity is smaller than one chunk
    #[error("buffer full")]
    Full,

    /// Fewer than one chunk of data is buffered
    #[error("buffer empty")]
    Empty,
}

/// Codec and resampling errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Resampler construction failed
    #[error("resampler init failed: {0}")]
    ResamplerInit(String),

    /// Resampler processing failed
    #[error("resampler process failed: {0}")]
    Resample(String),
}

/// Inbound protocol violations.
///
/// The embedded string is the reason reported back to the consumer in the
/// `incorrectPayload` acknowledgement.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid Json")]
    InvalidJson,

    #[error("No event key")]
    MissingEvent,

    #[error("Invalid event")]
    UnknownEvent,

    #[error("media key not available")]
    MissingMedia,

    #[error("payload not available")]
    MissingPayload,

    #[error("Incorrect ContentType")]
    MissingContentType,

    #[error("sampleRate not available")]
    MissingSampleRate,

    #[error("Unsupported combination of codec, samplerate")]
    CodecRateMismatch,

    #[error("Invalid Content type")]
    UnsupportedContentType,

    #[error("invalid base64 payload")]
    BadBase64,
}

/// Transport-layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("not connected")]
    NotConnected,
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Lookup by (call, stream) found nothing
    #[error("no stream {stream_id} on call {call_id}")]
    NoSuchStream { call_id: String, stream_id: String },

    /// Engine is shutting down
    #[error("engine stopped")]
    EngineStopped,

    /// Transport worker runtime could not be brought up; fatal at process
    /// scope
    #[error("engine init failed: {0}")]
    Init(String),
}
