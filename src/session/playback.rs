//! Playback injection for bidirectional sessions.
//!
//! Audio returned by the consumer (`media.play`) accumulates in a write
//! buffer after base64 decode, mu-law expansion, and sample-rate
//! reconciliation to the call rate. The host's write-replace hook mixes
//! one frame at a time into the outgoing call leg; named checkpoints
//! registered through `media.checkpoint` fire as the playback pointer
//! passes their byte position.

use std::collections::VecDeque;

use base64::prelude::*;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{g711, FftResampler, Resampler, StreamCodec};
use crate::errors::ProtocolError;
use crate::protocol::PlayAudio;

/// A named byte position in the received playback stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub name: String,
    pub position: u64,
}

/// Result of appending one `media.play` payload.
#[derive(Debug, Clone, Copy)]
pub struct StoreOutcome {
    /// Bytes appended to the write buffer after conversion
    pub appended: usize,
    /// The buffer was empty before this append
    pub playback_started: bool,
}

/// Result of registering a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Added,
    /// No media received yet, or the checkpoint carried no name
    Ignored,
}

/// Result of one write-replace mix pass.
#[derive(Debug, Default)]
pub struct MixResult {
    /// A full frame was mixed into the outgoing audio
    pub mixed: bool,
    /// Checkpoints crossed by this frame, in registration order
    pub crossed: Vec<String>,
}

struct PlaybackInner {
    buffer: BytesMut,
    bytes_received: u64,
    bytes_played: u64,
    checkpoints: VecDeque<Checkpoint>,
    /// Lazily created with the first mismatched rate and reused for the
    /// session's lifetime
    resampler: Option<FftResampler>,
}

/// Write-side playback state, one per bidirectional session.
pub struct PlaybackState {
    stream_id: String,
    call_rate: u32,
    inner: Mutex<PlaybackInner>,
}

impl PlaybackState {
    pub fn new(stream_id: &str, call_rate: u32) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            call_rate,
            inner: Mutex::new(PlaybackInner {
                buffer: BytesMut::new(),
                bytes_received: 0,
                bytes_played: 0,
                checkpoints: VecDeque::new(),
                resampler: None,
            }),
        }
    }

    /// Decode and append one `media.play` payload.
    pub fn store(&self, play: &PlayAudio) -> Result<StoreOutcome, ProtocolError> {
        let raw = BASE64_STANDARD
            .decode(&play.payload)
            .map_err(|_| ProtocolError::BadBase64)?;

        let pcm_bytes = match play.codec {
            StreamCodec::Ulaw => g711::decode_to_le_bytes(&raw),
            StreamCodec::L16 => raw,
        };

        let mut inner = self.inner.lock();
        let converted = if play.codec == StreamCodec::L16 && play.sample_rate != self.call_rate {
            if inner.resampler.is_none() {
                info!(
                    stream_id = %self.stream_id,
                    received = play.sample_rate,
                    call = self.call_rate,
                    "initializing playback resampler"
                );
                inner.resampler = FftResampler::new(play.sample_rate, self.call_rate).ok();
            }
            match inner.resampler.as_mut() {
                Some(resampler) => {
                    let samples: Vec<i16> = pcm_bytes
                        .chunks_exact(2)
                        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                        .collect();
                    match resampler.process(&samples) {
                        Ok(out) => {
                            let mut bytes = Vec::with_capacity(out.len() * 2);
                            for sample in out {
                                bytes.extend_from_slice(&sample.to_le_bytes());
                            }
                            bytes
                        }
                        Err(e) => {
                            warn!(stream_id = %self.stream_id, error = %e, "playback resample failed, dropping payload");
                            return Ok(StoreOutcome {
                                appended: 0,
                                playback_started: false,
                            });
                        }
                    }
                }
                None => pcm_bytes,
            }
        } else {
            pcm_bytes
        };

        let playback_started = inner.buffer.is_empty() && !converted.is_empty();
        inner.buffer.extend_from_slice(&converted);
        inner.bytes_received += converted.len() as u64;

        Ok(StoreOutcome {
            appended: converted.len(),
            playback_started,
        })
    }

    /// Register a checkpoint at the current received position.
    pub fn checkpoint(&self, name: Option<&str>) -> CheckpointOutcome {
        let name = match name {
            Some(name) => name,
            None => {
                info!(stream_id = %self.stream_id, "checkpoint without name, ignoring");
                return CheckpointOutcome::Ignored;
            }
        };

        let mut inner = self.inner.lock();
        if inner.bytes_received == 0 {
            warn!(
                stream_id = %self.stream_id,
                name,
                "checkpoint without prior media messages, ignoring"
            );
            return CheckpointOutcome::Ignored;
        }

        let position = inner.bytes_received;
        debug!(
            stream_id = %self.stream_id,
            name,
            position,
            "checkpoint registered"
        );
        inner.checkpoints.push_back(Checkpoint {
            name: name.to_string(),
            position,
        });
        CheckpointOutcome::Added
    }

    /// Drop all buffered audio, checkpoints, and counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        info!(
            stream_id = %self.stream_id,
            received = inner.bytes_received,
            played = inner.bytes_played,
            "clearing playback buffer"
        );
        inner.buffer.clear();
        for checkpoint in inner.checkpoints.drain(..) {
            info!(stream_id = %self.stream_id, name = %checkpoint.name, "dropping checkpoint");
        }
        inner.bytes_received = 0;
        inner.bytes_played = 0;
    }

    /// Mix exactly one frame of buffered playback into `frame`, with
    /// 16-bit saturation. Does nothing when less than one full frame is
    /// buffered.
    pub fn mix_into(&self, frame: &mut [i16]) -> MixResult {
        let frame_bytes = frame.len() * 2;
        let mut inner = self.inner.lock();
        if inner.buffer.len() < frame_bytes {
            return MixResult::default();
        }

        let mut chunk = inner.buffer.split_to(frame_bytes);
        for sample in frame.iter_mut() {
            let injected = chunk.get_i16_le() as i32;
            let mixed = (*sample as i32 + injected).clamp(-32767, 32767);
            *sample = mixed as i16;
        }
        inner.bytes_played += frame_bytes as u64;

        let mut crossed = Vec::new();
        let played = inner.bytes_played;
        while inner
            .checkpoints
            .front()
            .is_some_and(|head| played >= head.position)
        {
            if let Some(head) = inner.checkpoints.pop_front() {
                info!(
                    stream_id = %self.stream_id,
                    name = %head.name,
                    played,
                    "checkpoint played"
                );
                crossed.push(head.name);
            }
        }

        MixResult {
            mixed: true,
            crossed,
        }
    }

    /// Bytes of decoded audio received so far.
    pub fn bytes_received(&self) -> u64 {
        self.inner.lock().bytes_received
    }

    /// Bytes of decoded audio mixed into the outgoing leg so far.
    pub fn bytes_played(&self) -> u64 {
        self.inner.lock().bytes_played
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play_l16(samples: &[i16], rate: u32) -> PlayAudio {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        PlayAudio {
            payload: BASE64_STANDARD.encode(&bytes),
            codec: StreamCodec::L16,
            sample_rate: rate,
        }
    }

    #[test]
    fn store_and_mix_one_frame() {
        let playback = PlaybackState::new("s-1", 8000);
        let outcome = playback.store(&play_l16(&[100i16; 160], 8000)).unwrap();
        assert_eq!(outcome.appended, 320);
        assert!(outcome.playback_started);
        assert_eq!(playback.bytes_received(), 320);

        let mut frame = [50i16; 160];
        let result = playback.mix_into(&mut frame);
        assert!(result.mixed);
        assert!(frame.iter().all(|&s| s == 150));
        assert_eq!(playback.bytes_played(), 320);
    }

    #[test]
    fn mix_requires_full_frame() {
        let playback = PlaybackState::new("s-1", 8000);
        playback.store(&play_l16(&[1i16; 100], 8000)).unwrap();

        let mut frame = [0i16; 160];
        let result = playback.mix_into(&mut frame);
        assert!(!result.mixed);
        assert_eq!(playback.bytes_played(), 0);
    }

    #[test]
    fn mix_saturates_at_16bit_extremes() {
        let playback = PlaybackState::new("s-1", 8000);
        playback.store(&play_l16(&[30000i16; 160], 8000)).unwrap();
        playback.store(&play_l16(&[-30000i16; 160], 8000)).unwrap();

        let mut high = [30000i16; 160];
        assert!(playback.mix_into(&mut high).mixed);
        assert!(high.iter().all(|&s| s == 32767));

        let mut low = [-30000i16; 160];
        assert!(playback.mix_into(&mut low).mixed);
        assert!(low.iter().all(|&s| s == -32767));
    }

    #[test]
    fn mulaw_payload_doubles_into_pcm() {
        let playback = PlaybackState::new("s-1", 8000);
        let encoded: Vec<u8> = g711::encode_slice(&[1000i16; 160]);
        let play = PlayAudio {
            payload: BASE64_STANDARD.encode(&encoded),
            codec: StreamCodec::Ulaw,
            sample_rate: 8000,
        };
        let outcome = playback.store(&play).unwrap();
        assert_eq!(outcome.appended, 320);
    }

    #[test]
    fn checkpoints_fire_in_order_once_played() {
        let playback = PlaybackState::new("s-1", 8000);
        playback.store(&play_l16(&[1i16; 160], 8000)).unwrap();
        assert_eq!(playback.checkpoint(Some("A")), CheckpointOutcome::Added);
        playback.store(&play_l16(&[1i16; 160], 8000)).unwrap();
        assert_eq!(playback.checkpoint(Some("B")), CheckpointOutcome::Added);

        let mut frame = [0i16; 160];
        let first = playback.mix_into(&mut frame);
        assert_eq!(first.crossed, vec!["A".to_string()]);

        let second = playback.mix_into(&mut frame);
        assert_eq!(second.crossed, vec!["B".to_string()]);
    }

    #[test]
    fn checkpoint_without_media_or_name_is_ignored() {
        let playback = PlaybackState::new("s-1", 8000);
        assert_eq!(playback.checkpoint(Some("A")), CheckpointOutcome::Ignored);
        playback.store(&play_l16(&[1i16; 10], 8000)).unwrap();
        assert_eq!(playback.checkpoint(None), CheckpointOutcome::Ignored);
    }

    #[test]
    fn clear_resets_everything() {
        let playback = PlaybackState::new("s-1", 8000);
        playback.store(&play_l16(&[1i16; 320], 8000)).unwrap();
        playback.checkpoint(Some("A"));
        playback.clear();

        assert_eq!(playback.bytes_received(), 0);
        assert_eq!(playback.bytes_played(), 0);
        let mut frame = [0i16; 160];
        assert!(!playback.mix_into(&mut frame).mixed);
        // A cleared checkpoint never fires even after new media plays out.
        playback.store(&play_l16(&[1i16; 160], 8000)).unwrap();
        assert!(playback.mix_into(&mut frame).crossed.is_empty());
    }

    #[test]
    fn sixteen_k_payload_resamples_to_call_rate() {
        let playback = PlaybackState::new("s-1", 8000);
        // Ten 20 ms frames at 16 kHz become ~ten frames at 8 kHz.
        let mut appended = 0;
        for _ in 0..10 {
            appended += playback
                .store(&play_l16(&[0i16; 320], 16000))
                .unwrap()
                .appended;
        }
        assert!(
            (2600..=3400).contains(&appended),
            "expected ~3200 bytes after downsampling, got {appended}"
        );
    }

    #[test]
    fn bad_base64_is_rejected() {
        let playback = PlaybackState::new("s-1", 8000);
        let play = PlayAudio {
            payload: "not-base64!".to_string(),
            codec: StreamCodec::L16,
            sample_rate: 8000,
        };
        assert!(matches!(
            playback.store(&play),
            Err(ProtocolError::BadBase64)
        ));
    }
}
