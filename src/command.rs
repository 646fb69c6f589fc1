//! The `uuid_audio_stream` command surface.
//!
//! One verb per invocation over space-separated tokens:
//!
//! ```text
//! uuid_audio_stream <call-uuid> <stream-id> start <url> <track> [codec] <rate> <timeout> <bidi> [metadata]
//! uuid_audio_stream <call-uuid> <stream-id> stop [reason]
//! uuid_audio_stream <call-uuid> <stream-id> pause
//! uuid_audio_stream <call-uuid> <stream-id> resume
//! uuid_audio_stream <call-uuid> <stream-id> graceful-shutdown [reason]
//! uuid_audio_stream <call-uuid> <stream-id> send_text <json-text>
//! ```
//!
//! The codec token (`l16` | `mulaw`) is optional and defaults to `l16`.
//! The surface is fire-and-forget: a verb that is accepted and dispatched
//! answers `+OK Success`; failures after dispatch arrive asynchronously as
//! host events.

use std::sync::Arc;

use tracing::{debug, error};

use crate::codec::StreamCodec;
use crate::session::Direction;
use crate::supervisor::{StartParams, Supervisor};

/// Command responses.
pub const RESPONSE_OK: &str = "+OK Success";
pub const RESPONSE_ERR: &str = "-ERR Operation Failed";

/// Usage string returned for malformed argument lists.
pub const USAGE: &str = "-USAGE: uuid_audio_stream <uuid> <streamid> \
[start | stop | send_text | pause | resume | graceful-shutdown] [wss-url] \
[inbound | outbound | both] [l16 | mulaw] [8000 | 16000 | 8k | 16k] \
[timeout] [bidirectional] [metadata]";

/// Call sample rate assumed when no host supplies one.
const DEFAULT_CALL_RATE: u32 = 8000;

/// Verb dispatcher over a running engine.
pub struct CommandSurface {
    supervisor: Arc<Supervisor>,
}

impl CommandSurface {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    /// Dispatch one command line and produce its response body.
    pub fn dispatch(&self, line: &str) -> String {
        let mut tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() == Some(&"uuid_audio_stream") {
            tokens.remove(0);
        }
        debug!(command = line, "dispatching");

        if tokens.len() < 3 {
            return USAGE.to_string();
        }
        let call_id = tokens[0];
        let stream_id = tokens[1];
        let verb = tokens[2];

        let outcome = match verb.to_ascii_lowercase().as_str() {
            "start" => {
                if tokens.len() < 8 {
                    return USAGE.to_string();
                }
                self.start(call_id, stream_id, &tokens[3..])
            }
            "stop" => self
                .supervisor
                .stop_stream(call_id, stream_id, join_rest(&tokens, 3).as_deref())
                .is_ok(),
            "pause" => self.supervisor.pause_stream(call_id, stream_id).is_ok(),
            "resume" => self.supervisor.resume_stream(call_id, stream_id).is_ok(),
            "graceful-shutdown" => self
                .supervisor
                .graceful_shutdown(call_id, stream_id, join_rest(&tokens, 3).as_deref())
                .is_ok(),
            "send_text" => match join_rest(&tokens, 3) {
                Some(text) => self
                    .supervisor
                    .send_text(call_id, stream_id, &text)
                    .is_ok(),
                None => return USAGE.to_string(),
            },
            other => {
                error!(verb = other, "unsupported command");
                false
            }
        };

        if outcome {
            RESPONSE_OK.to_string()
        } else {
            RESPONSE_ERR.to_string()
        }
    }

    fn start(&self, call_id: &str, stream_id: &str, args: &[&str]) -> bool {
        // args: <url> <track> [codec] <rate> <timeout> <bidi> [metadata]
        let url = args[0];
        let track = args[1];

        let direction = match Direction::parse(track) {
            Some(direction) => direction,
            None => {
                error!(track, "invalid track, must be inbound, outbound, or both");
                return false;
            }
        };

        let (codec, rest) = if args[2].eq_ignore_ascii_case("l16")
            || args[2].eq_ignore_ascii_case("mulaw")
        {
            (StreamCodec::parse(args[2]), &args[3..])
        } else {
            (StreamCodec::L16, &args[2..])
        };

        if rest.len() < 3 {
            return false;
        }

        let wire_rate = match parse_rate(rest[0]) {
            Some(rate) => rate,
            None => {
                error!(rate = rest[0], "invalid sample rate");
                return false;
            }
        };
        let timeout_secs = match rest[1].parse::<u64>() {
            Ok(timeout) => timeout,
            Err(_) => {
                error!(timeout = rest[1], "invalid timeout");
                return false;
            }
        };
        let bidirectional = match rest[2] {
            "0" => false,
            "1" => true,
            other => {
                error!(bidi = other, "invalid bidirectional flag");
                return false;
            }
        };
        let metadata = if rest.len() > 3 {
            Some(rest[3..].join(" "))
        } else {
            None
        };

        let params = StartParams {
            service_url: url.to_string(),
            direction,
            codec,
            wire_rate,
            call_rate: DEFAULT_CALL_RATE,
            timeout_secs,
            bidirectional,
            metadata,
        };

        match self.supervisor.start_stream(call_id, stream_id, params) {
            Ok(()) => true,
            Err(e) => {
                error!(stream_id, error = %e, "start failed");
                false
            }
        }
    }
}

/// Accepted rate tokens: a positive multiple of 8000, or the `8k`/`16k`
/// shorthands.
fn parse_rate(token: &str) -> Option<u32> {
    let rate = match token {
        "8k" => 8000,
        "16k" => 16000,
        other => other.parse::<u32>().ok()?,
    };
    (rate > 0 && rate % 8000 == 0).then_some(rate)
}

fn join_rest(tokens: &[&str], from: usize) -> Option<String> {
    if tokens.len() > from {
        Some(tokens[from..].join(" "))
    } else {
        None
    }
}
