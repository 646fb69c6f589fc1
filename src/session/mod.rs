//! Per-call streaming session: the state machine gluing capture, buffers,
//! transport, and playback together.
//!
//! A session owns its ring buffers, control queue, playback state,
//! sequence counter, and scheduled tasks. The transport holds only the
//! session key and reaches the session through the supervisor's registry.
//! The capture path writes into the ring buffers; the transport's writable
//! pump reads from them; a per-session mutex serialises the capture-side
//! conversion state.

pub mod playback;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::prelude::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::buffer::{ControlQueue, Priority, RingFrameBuffer};
use crate::codec::{g711, FftResampler, Resampler, StreamCodec};
use crate::errors::{BufferError, StreamResult};
use crate::events::{EventKind, EventSink, StreamEvent};
use crate::protocol::messages::encode;
use crate::protocol::{
    parse_inbound, ClearedMessage, InboundEvent, IncorrectPayloadMessage, MediaMessage,
    PlayedMessage, StartMessage, StopMessage,
};
use crate::scheduler::{Scheduler, TaskHandle, HEARTBEAT_SECS};
use crate::supervisor::{SessionKey, WorkerCmd};
use crate::transport::{Endpoint, LinkState, GRACEFUL_SHUTDOWN_BUDGET_SECS, MAX_CONNECTION_ATTEMPTS};

use playback::PlaybackState;

/// Stream termination reasons recorded on the session.
pub const TERMINATION_API_REQUEST: &str = "API Request";
pub const TERMINATION_STREAM_TIMEOUT: &str = "Stream Timeout";
pub const TERMINATION_CONNECTION_ERROR: &str = "Connection error";
pub const TERMINATION_CALL_HANGUP: &str = "Call Hangup";

/// Which direction(s) of the call this session transmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    Both,
}

impl Direction {
    /// Parse the `track` token of the start command.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            "both" => Some(Direction::Both),
            _ => None,
        }
    }

    /// Tracks advertised in the `start` message.
    pub fn tracks(&self) -> Vec<&'static str> {
        match self {
            Direction::Inbound => vec!["inbound"],
            Direction::Outbound => vec!["outbound"],
            Direction::Both => vec!["inbound", "outbound"],
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
            Direction::Both => "both",
        }
    }
}

/// Capture leg a frame was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureDirection {
    /// Caller-to-system audio
    Inbound,
    /// System-to-caller audio
    Outbound,
}

/// Parameters of one stream, fixed at start.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub service_url: String,
    pub direction: Direction,
    pub codec: StreamCodec,
    /// Sample rate of the call's telephony codec
    pub call_rate: u32,
    /// Sample rate advertised and transmitted on the wire
    pub wire_rate: u32,
    pub bidirectional: bool,
    /// Stream-end timeout in seconds; 0 disables
    pub timeout_secs: u64,
    /// Opaque JSON attached to wire messages as `extra_headers`
    pub metadata: Option<String>,
}

/// One action for the transport's writable pump.
#[derive(Debug)]
pub(crate) enum PumpAction {
    /// Nothing to send this pass
    Idle,
    /// Send one text frame, then run another pass
    Send(String),
    /// Send a close frame and finish the link
    Close,
}

enum AudioBuffers {
    Single(RingFrameBuffer),
    Dual {
        inbound: RingFrameBuffer,
        outbound: RingFrameBuffer,
    },
}

/// Per-leg capture conversion state, guarded by the session mutex.
#[derive(Default)]
struct LegState {
    resampler: Option<FftResampler>,
    /// Wire-encoded bytes not yet forming a full chunk
    pending: Vec<u8>,
}

#[derive(Default)]
struct CaptureState {
    main: LegState,
    outbound: LegState,
}

/// Shared state of one streaming session.
pub struct SessionShared {
    call_id: String,
    stream_id: String,
    settings: StreamSettings,
    endpoint: Endpoint,
    chunk_size: usize,

    buffers: AudioBuffers,
    control: ControlQueue,
    playback: Option<PlaybackState>,
    capture: Mutex<CaptureState>,

    sequence: AtomicU64,
    link_state: Mutex<LinkState>,
    attempts: AtomicU32,
    switch_flag: AtomicBool,

    paused: AtomicBool,
    graceful: AtomicBool,
    graceful_deadline: Mutex<Option<Instant>>,
    start_sent: AtomicBool,
    stop_sent: AtomicBool,
    /// CONNECT_SUCCESS already emitted for this session
    started: AtomicBool,
    /// Host-initiated teardown; suppresses reconnects and error cleanup
    closing: AtomicBool,
    /// Cleanup completed; no further events may be emitted
    closed: AtomicBool,
    invalid_input_notified: AtomicBool,

    termination_reason: Mutex<Option<&'static str>>,
    started_at: Mutex<Option<Instant>>,
    ended_at: Mutex<Option<Instant>>,
    tasks: Mutex<Vec<TaskHandle>>,

    events: EventSink,
    worker_tx: mpsc::Sender<WorkerCmd>,
}

impl SessionShared {
    pub(crate) fn new(
        call_id: &str,
        stream_id: &str,
        settings: StreamSettings,
        endpoint: Endpoint,
        buffer_secs: u32,
        events: EventSink,
        worker_tx: mpsc::Sender<WorkerCmd>,
    ) -> Arc<Self> {
        let chunk_size = settings.codec.frame_size(settings.wire_rate);
        // 50 chunks per second of audio
        let capacity = chunk_size * 50 * buffer_secs as usize;

        let buffers = match settings.direction {
            Direction::Both => AudioBuffers::Dual {
                inbound: RingFrameBuffer::new(chunk_size, capacity),
                outbound: RingFrameBuffer::new(chunk_size, capacity),
            },
            _ => AudioBuffers::Single(RingFrameBuffer::new(chunk_size, capacity)),
        };

        let playback = settings
            .bidirectional
            .then(|| PlaybackState::new(stream_id, settings.call_rate));

        info!(
            stream_id,
            call_id,
            track = settings.direction.label(),
            wire_rate = settings.wire_rate,
            call_rate = settings.call_rate,
            chunk_size,
            "session created"
        );

        Arc::new(Self {
            call_id: call_id.to_string(),
            stream_id: stream_id.to_string(),
            settings,
            endpoint,
            chunk_size,
            buffers,
            control: ControlQueue::new(),
            playback,
            capture: Mutex::new(CaptureState::default()),
            sequence: AtomicU64::new(0),
            link_state: Mutex::new(LinkState::Idle),
            attempts: AtomicU32::new(0),
            switch_flag: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            graceful: AtomicBool::new(false),
            graceful_deadline: Mutex::new(None),
            start_sent: AtomicBool::new(false),
            stop_sent: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            invalid_input_notified: AtomicBool::new(false),
            termination_reason: Mutex::new(None),
            started_at: Mutex::new(None),
            ended_at: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            events,
            worker_tx,
        })
    }

    // -------------------------------------------------------------------------
    // Identity and state
    // -------------------------------------------------------------------------

    pub fn key(&self) -> SessionKey {
        session_key(&self.call_id, &self.stream_id)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn link_state(&self) -> LinkState {
        *self.link_state.lock()
    }

    pub(crate) fn set_link_state(&self, state: LinkState) {
        *self.link_state.lock() = state;
    }

    pub fn termination_reason(&self) -> Option<&'static str> {
        *self.termination_reason.lock()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_graceful(&self) -> bool {
        self.graceful.load(Ordering::SeqCst)
    }

    pub(crate) fn draining(&self) -> bool {
        self.is_graceful() || self.link_state() == LinkState::Disconnecting
    }

    pub(crate) fn bump_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn attempts_exhausted(&self) -> bool {
        self.attempts.load(Ordering::SeqCst) > MAX_CONNECTION_ATTEMPTS
    }

    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn emit(&self, event: StreamEvent) {
        if !self.is_closed() {
            (self.events)(event);
        }
    }

    fn emit_payload(&self, kind: EventKind, payload: Value) {
        self.emit(StreamEvent {
            kind,
            call_id: self.call_id.clone(),
            payload,
        });
    }

    /// Ask the pinned transport worker for a writable pass.
    pub(crate) fn wake(&self) {
        let _ = self.worker_tx.try_send(WorkerCmd::Wake { key: self.key() });
    }

    fn buffers_empty(&self) -> bool {
        match &self.buffers {
            AudioBuffers::Single(buffer) => !buffer.has_data(),
            AudioBuffers::Dual { inbound, outbound } => {
                !inbound.has_data() && !outbound.has_data()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Writable pump
    // -------------------------------------------------------------------------

    /// Decide the next wire message, one per writable pass.
    pub(crate) fn next_outbound(&self) -> PumpAction {
        if self.is_graceful() {
            let deadline_passed = self
                .graceful_deadline
                .lock()
                .map(|at| Instant::now() >= at)
                .unwrap_or(false);
            if deadline_passed {
                error!(
                    stream_id = %self.stream_id,
                    "graceful drain exceeded its budget, closing the connection"
                );
                self.set_link_state(LinkState::Disconnecting);
                return PumpAction::Close;
            }

            if self.buffers_empty() && !self.stop_sent.swap(true, Ordering::SeqCst) {
                let message = StopMessage::new(
                    self.next_seq(),
                    &self.call_id,
                    &self.stream_id,
                    self.settings.metadata.clone(),
                );
                self.set_link_state(LinkState::Disconnecting);
                info!(stream_id = %self.stream_id, "stop message sent");
                return PumpAction::Send(encode(&message));
            }
        }

        if !self.start_sent.swap(true, Ordering::SeqCst) {
            let message = StartMessage::new(
                self.next_seq(),
                &self.call_id,
                &self.stream_id,
                self.settings.direction.tracks(),
                self.settings.codec,
                self.settings.wire_rate,
                self.settings.metadata.clone(),
            );
            info!(stream_id = %self.stream_id, "start message sent");
            return PumpAction::Send(encode(&message));
        }

        if let Some(text) = self.control.pop() {
            return PumpAction::Send(text);
        }

        if self.link_state() == LinkState::Disconnecting {
            info!(stream_id = %self.stream_id, "closing the websocket connection");
            return PumpAction::Close;
        }

        let both = self.settings.direction == Direction::Both;
        let (buffer, track): (&RingFrameBuffer, &'static str) = match &self.buffers {
            AudioBuffers::Single(buffer) => (buffer, self.settings.direction.label()),
            AudioBuffers::Dual { inbound, outbound } => {
                if self.switch_flag.load(Ordering::SeqCst) {
                    (outbound, "outbound")
                } else {
                    (inbound, "inbound")
                }
            }
        };

        // Contended lock: skip this pass, keep the switch as-is.
        let mut guard = match buffer.try_lock() {
            Some(guard) => guard,
            None => return PumpAction::Idle,
        };

        match guard.read_chunk() {
            Err(BufferError::Empty) | Err(BufferError::Full) => {
                if both {
                    self.switch_flag.fetch_xor(true, Ordering::SeqCst);
                }
                PumpAction::Idle
            }
            Ok(chunk) => {
                let message = MediaMessage::new(
                    self.next_seq(),
                    &self.stream_id,
                    track,
                    chunk.timestamp_micros,
                    chunk.chunk_index,
                    BASE64_STANDARD.encode(&chunk.data),
                    self.settings.metadata.clone(),
                );
                if both {
                    self.switch_flag.fetch_xor(true, Ordering::SeqCst);
                }
                PumpAction::Send(encode(&message))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Capture path
    // -------------------------------------------------------------------------

    /// Accept one 20 ms frame from the host's media hook.
    ///
    /// Always succeeds from the host's point of view: frames arriving
    /// while paused, draining, or disconnected are silently discarded so
    /// the host never tears down its hook over transient engine state.
    pub fn push_frame(
        &self,
        leg: CaptureDirection,
        samples: &[i16],
        comfort_noise: bool,
    ) -> StreamResult<()> {
        if comfort_noise {
            return Ok(());
        }
        if self.is_closed()
            || self.paused.load(Ordering::SeqCst)
            || self.is_graceful()
            || self.link_state() != LinkState::Connected
        {
            return Ok(());
        }

        // Contended with a transport callback: skip this frame.
        let mut capture = match self.capture.try_lock() {
            Some(guard) => guard,
            None => return Ok(()),
        };

        let (buffer, leg_state) = match (&self.buffers, self.settings.direction, leg) {
            (AudioBuffers::Single(buffer), Direction::Inbound, CaptureDirection::Inbound) => {
                (buffer, &mut capture.main)
            }
            (AudioBuffers::Single(buffer), Direction::Outbound, CaptureDirection::Outbound) => {
                (buffer, &mut capture.main)
            }
            (AudioBuffers::Dual { inbound, .. }, _, CaptureDirection::Inbound) => {
                (inbound, &mut capture.main)
            }
            (AudioBuffers::Dual { outbound, .. }, _, CaptureDirection::Outbound) => {
                (outbound, &mut capture.outbound)
            }
            // Frame for a leg this session does not transmit
            _ => return Ok(()),
        };

        let needs_resample = self.settings.call_rate != self.settings.wire_rate;
        let converted: Vec<i16> = if needs_resample {
            if leg_state.resampler.is_none() {
                match FftResampler::new(self.settings.call_rate, self.settings.wire_rate) {
                    Ok(resampler) => leg_state.resampler = Some(resampler),
                    Err(e) => {
                        error!(stream_id = %self.stream_id, error = %e, "capture resampler init failed");
                        self.emit_payload(
                            EventKind::StreamError,
                            json!({ "streamId": self.stream_id, "reason": e.to_string() }),
                        );
                        return Ok(());
                    }
                }
            }
            match leg_state.resampler.as_mut() {
                Some(resampler) => match resampler.process(samples) {
                    Ok(out) => out,
                    Err(e) => {
                        warn!(stream_id = %self.stream_id, error = %e, "capture resample failed, dropping frame");
                        return Ok(());
                    }
                },
                None => return Ok(()),
            }
        } else {
            samples.to_vec()
        };

        match self.settings.codec {
            StreamCodec::Ulaw => leg_state.pending.extend(g711::encode_slice(&converted)),
            StreamCodec::L16 => {
                leg_state.pending.reserve(converted.len() * 2);
                for sample in &converted {
                    leg_state.pending.extend_from_slice(&sample.to_le_bytes());
                }
            }
        }

        while leg_state.pending.len() >= self.chunk_size {
            let chunk: Vec<u8> = leg_state.pending.drain(..self.chunk_size).collect();
            let mut guard = buffer.lock();
            match guard.write_chunk(&chunk) {
                Ok(outcome) => {
                    if let Some(milestone) = outcome.degraded_milestone {
                        error!(
                            stream_id = %self.stream_id,
                            milestone,
                            in_use = guard.in_use(),
                            capacity = buffer.capacity(),
                            "degraded connection, consumer is not keeping up"
                        );
                        drop(guard);
                        self.emit(StreamEvent::bare(
                            EventKind::ConnectionDegraded,
                            &self.call_id,
                            &self.stream_id,
                        ));
                    }
                }
                Err(_) => {
                    drop(guard);
                    drop(capture);
                    self.on_buffer_overrun();
                    return Ok(());
                }
            }
        }
        drop(capture);

        self.wake();
        Ok(())
    }

    fn on_buffer_overrun(&self) {
        error!(stream_id = %self.stream_id, "buffer write failed after saturation, shutting down");
        self.emit(StreamEvent::bare(
            EventKind::StreamBufferOverrun,
            &self.call_id,
            &self.stream_id,
        ));
        self.emit(StreamEvent::bare(
            EventKind::ConnectionTimeout,
            &self.call_id,
            &self.stream_id,
        ));
        *self.termination_reason.lock() = Some(TERMINATION_CONNECTION_ERROR);
        self.initiate_graceful();
    }

    // -------------------------------------------------------------------------
    // Playback path
    // -------------------------------------------------------------------------

    /// Mix buffered playback into an outgoing 20 ms frame.
    ///
    /// Returns whether anything was mixed. Fires `playedStream` wire
    /// messages and `media_play_complete` events for every checkpoint the
    /// playback pointer passed.
    pub fn mix_playback(&self, frame: &mut [i16]) -> bool {
        let playback = match &self.playback {
            Some(playback) => playback,
            None => return false,
        };
        if self.is_closed() {
            return false;
        }

        let result = playback.mix_into(frame);
        for name in &result.crossed {
            let message = PlayedMessage::new(self.next_seq(), &self.stream_id, name);
            self.control.push(Priority::High, encode(&message));
            self.emit_payload(
                EventKind::MediaPlayComplete,
                json!({ "streamId": self.stream_id, "name": name }),
            );
        }
        if !result.crossed.is_empty() {
            self.wake();
        }
        result.mixed
    }

    // -------------------------------------------------------------------------
    // Inbound messages
    // -------------------------------------------------------------------------

    /// Handle one reassembled inbound text frame.
    pub(crate) fn handle_inbound(&self, raw: &str) {
        if !self.settings.bidirectional {
            if serde_json::from_str::<Value>(raw).is_ok() {
                self.emit(StreamEvent::passthrough(
                    EventKind::MessageReceived,
                    &self.call_id,
                    &self.stream_id,
                    raw,
                ));
            } else {
                debug!(stream_id = %self.stream_id, "ignoring non-JSON ingress on one-way stream");
            }
            return;
        }

        let playback = match &self.playback {
            Some(playback) => playback,
            None => return,
        };

        match parse_inbound(raw) {
            Err(e) => self.report_incorrect_payload(raw, &e.to_string()),
            Ok(InboundEvent::MediaPlay(play)) => match playback.store(&play) {
                Ok(outcome) => {
                    debug!(
                        stream_id = %self.stream_id,
                        appended = outcome.appended,
                        "media.play stored"
                    );
                    if outcome.playback_started {
                        self.emit(StreamEvent::bare(
                            EventKind::MediaPlayStart,
                            &self.call_id,
                            &self.stream_id,
                        ));
                    }
                }
                Err(e) => self.report_incorrect_payload(raw, &e.to_string()),
            },
            Ok(InboundEvent::MediaCheckpoint { name }) => {
                playback.checkpoint(name.as_deref());
            }
            Ok(InboundEvent::MediaClear) => {
                playback.clear();
                let message = ClearedMessage::new(self.next_seq(), &self.stream_id);
                self.control.push(Priority::Critical, encode(&message));
                self.emit(StreamEvent::bare(
                    EventKind::MediaCleared,
                    &self.call_id,
                    &self.stream_id,
                ));
                self.wake();
            }
            Ok(InboundEvent::TranscriptionSend) => {
                self.emit(StreamEvent::passthrough(
                    EventKind::TranscriptionReceived,
                    &self.call_id,
                    &self.stream_id,
                    raw,
                ));
            }
        }
    }

    /// Answer unusable ingress, at most once per session.
    fn report_incorrect_payload(&self, payload: &str, reason: &str) {
        if self.invalid_input_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            stream_id = %self.stream_id,
            reason,
            payload = %payload.chars().take(300).collect::<String>(),
            "invalid message received"
        );
        let message = IncorrectPayloadMessage::new(self.next_seq(), &self.stream_id, payload);
        self.control.push(Priority::Normal, encode(&message));
        self.wake();
        self.emit_payload(
            EventKind::StreamInvalidInput,
            json!({ "streamId": self.stream_id, "reason": reason }),
        );
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Pause or resume capture. Buffered audio is kept; the media clock
    /// resumes where it left off.
    pub fn set_paused(&self, paused: bool) {
        info!(stream_id = %self.stream_id, "{}", if paused { "pause" } else { "resume" });
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Queue a host-supplied text frame for transmission.
    ///
    /// Silently dropped while the link is not connected, like every other
    /// fire-and-forget command effect.
    pub fn send_text(&self, text: &str) {
        if self.link_state() != LinkState::Connected {
            warn!(stream_id = %self.stream_id, "send_text while not connected, dropping");
            return;
        }
        self.control.push(Priority::Normal, text.to_string());
        self.wake();
    }

    /// Begin a graceful drain: transmit buffered audio, then `stop`, then
    /// close, within the 60 s budget.
    pub fn graceful_shutdown(&self, reason: Option<&str>) {
        let (text, termination) = match reason {
            Some(text) => (text, TERMINATION_STREAM_TIMEOUT),
            None => ("", TERMINATION_API_REQUEST),
        };
        info!(stream_id = %self.stream_id, reason = text, "graceful-shutdown");
        self.emit(StreamEvent::with_reason(
            EventKind::StreamStopped,
            &self.call_id,
            &self.stream_id,
            text,
        ));
        *self.termination_reason.lock() = Some(termination);
        *self.ended_at.lock() = Some(Instant::now());
        self.initiate_graceful();
    }

    fn initiate_graceful(&self) {
        if !self.graceful.swap(true, Ordering::SeqCst) {
            *self.graceful_deadline.lock() =
                Some(Instant::now() + Duration::from_secs(GRACEFUL_SHUTDOWN_BUDGET_SECS));
        }
        self.wake();
    }

    /// Stop immediately: force-close the link without draining.
    pub fn stop(&self, reason: Option<&str>) {
        let text = reason.unwrap_or("");
        info!(stream_id = %self.stream_id, reason = text, "stop");
        if self.started_at.lock().is_none() {
            warn!(stream_id = %self.stream_id, "got stop before the stream ever started");
        }
        self.emit(StreamEvent::with_reason(
            EventKind::StreamStopped,
            &self.call_id,
            &self.stream_id,
            text,
        ));
        *self.termination_reason.lock() = Some(TERMINATION_API_REQUEST);
        *self.ended_at.lock() = Some(Instant::now());
        self.force_close();
    }

    /// Close without reconnecting, as used by stop and call teardown.
    pub(crate) fn force_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.attempts
            .store(MAX_CONNECTION_ATTEMPTS + 1, Ordering::SeqCst);
        self.set_link_state(LinkState::Disconnecting);
        let _ = self
            .worker_tx
            .try_send(WorkerCmd::Disconnect { key: self.key() });
    }

    // -------------------------------------------------------------------------
    // Transport notices
    // -------------------------------------------------------------------------

    /// The link reached Connected.
    pub(crate) fn on_established(self: &Arc<Self>, scheduler: &Scheduler) {
        self.attempts.store(0, Ordering::SeqCst);
        self.set_link_state(LinkState::Connected);

        if !self.started.swap(true, Ordering::SeqCst) {
            info!(stream_id = %self.stream_id, call_id = %self.call_id, "connection successful");
            *self.started_at.lock() = Some(Instant::now());
            self.emit_payload(
                EventKind::ConnectionEstablished,
                json!({
                    "streamId": self.stream_id,
                    "serverUrl": self.settings.service_url,
                }),
            );

            let mut tasks = self.tasks.lock();

            let weak = Arc::downgrade(self);
            tasks.push(scheduler.schedule_periodic(
                Duration::from_secs(HEARTBEAT_SECS),
                move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(session) = weak.upgrade() {
                            session.emit(StreamEvent::bare(
                                EventKind::StreamHeartbeat,
                                &session.call_id,
                                &session.stream_id,
                            ));
                        }
                    }
                },
            ));

            if self.settings.timeout_secs > 0 {
                let weak = Arc::downgrade(self);
                tasks.push(scheduler.schedule_once(
                    Duration::from_secs(self.settings.timeout_secs),
                    move || async move {
                        if let Some(session) = weak.upgrade() {
                            info!(stream_id = %session.stream_id, "stream-end timer invoked");
                            session.emit(StreamEvent::bare(
                                EventKind::StreamTimeout,
                                &session.call_id,
                                &session.stream_id,
                            ));
                            session.graceful_shutdown(Some("TIMEOUT REACHED"));
                        }
                    },
                ));
            }
        }

        // Drive the start message out without waiting for captured audio.
        self.wake();
    }

    /// Connect attempts exhausted without ever reaching the consumer.
    pub(crate) fn on_connect_failed(&self, reason: &str) {
        warn!(stream_id = %self.stream_id, reason, "connection failed");
        self.set_link_state(LinkState::Failed);
        self.emit(StreamEvent::with_reason(
            EventKind::ConnectionFailed,
            &self.call_id,
            &self.stream_id,
            reason,
        ));
        if !self.is_closing() {
            *self.termination_reason.lock() = Some(TERMINATION_CONNECTION_ERROR);
        }
    }

    /// The far end closed an established link and reconnects are spent.
    pub(crate) fn on_connection_dropped(&self) {
        warn!(stream_id = %self.stream_id, "connection dropped from far end");
        self.emit(StreamEvent::bare(
            EventKind::ConnectionClosed,
            &self.call_id,
            &self.stream_id,
        ));
        if !self.is_closing() {
            *self.termination_reason.lock() = Some(TERMINATION_CONNECTION_ERROR);
        }
    }

    /// We closed the link ourselves (graceful drain or forced stop).
    pub(crate) fn on_closed_gracefully(&self) {
        info!(stream_id = %self.stream_id, "connection closed gracefully");
    }

    /// A retry is about to be scheduled after a transient failure.
    pub(crate) fn on_retry_scheduled(&self, attempt: u32, reason: &str) {
        warn!(
            stream_id = %self.stream_id,
            attempt,
            reason,
            "connection error, retrying"
        );
        if attempt == 1 {
            self.emit(StreamEvent::bare(
                EventKind::ConnectionDegraded,
                &self.call_id,
                &self.stream_id,
            ));
        }
    }

    pub(crate) fn worker_sender(&self) -> mpsc::Sender<WorkerCmd> {
        self.worker_tx.clone()
    }

    /// Final cleanup: cancel scheduled tasks and fence further events.
    pub(crate) fn finish(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.cancel();
        }
        let mut ended = self.ended_at.lock();
        if ended.is_none() {
            *ended = Some(Instant::now());
        }
        info!(stream_id = %self.stream_id, call_id = %self.call_id, "session cleanup complete");
    }
}

/// Registry key of a session: one per (call, stream) pair.
pub fn session_key(call_id: &str, stream_id: &str) -> SessionKey {
    format!("{call_id}:{stream_id}")
}
