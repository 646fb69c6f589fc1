//! Process-wide engine lifecycle and the transport worker contexts.
//!
//! The supervisor owns the session registry and a pool of transport
//! workers. Each worker consumes its own bounded command channel; a
//! session is pinned to one worker round-robin at connect time and stays
//! there for life. Session teardown is the sole writer that removes a
//! registry entry, and it always runs on the worker, never inside a
//! transport callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

use crate::codec::StreamCodec;
use crate::config::EngineConfig;
use crate::errors::{ConfigError, StreamError, StreamResult};
use crate::events::{EventKind, EventSink, StreamEvent};
use crate::scheduler::Scheduler;
use crate::session::{
    session_key, CaptureDirection, Direction, SessionShared, StreamSettings,
};
use crate::transport::client::{run_link, LinkSettings};
use crate::transport::Endpoint;

/// Registry key: one session per (call, stream) pair.
pub type SessionKey = String;

/// Commands consumed by a transport worker.
#[derive(Debug)]
pub(crate) enum WorkerCmd {
    /// Spawn the connection driver for a freshly registered session
    Connect { key: SessionKey },
    /// Run a writable pass on the session's link
    Wake { key: SessionKey },
    /// The session wants its link closed; drive the pump once more
    Disconnect { key: SessionKey },
    /// The link finished; remove the session from the registry
    Finished { key: SessionKey },
}

/// Per-worker command channel depth. Wake commands are lossy refresh
/// requests, so a full channel only delays a pump pass.
const WORKER_QUEUE_DEPTH: usize = 1024;

/// Parameters of a `start` command, validated by the command surface.
#[derive(Debug, Clone)]
pub struct StartParams {
    pub service_url: String,
    pub direction: Direction,
    pub codec: StreamCodec,
    /// Wire sample rate, a positive multiple of 8000
    pub wire_rate: u32,
    /// Sample rate of the call's telephony codec
    pub call_rate: u32,
    /// Stream-end timeout in seconds; 0 disables
    pub timeout_secs: u64,
    pub bidirectional: bool,
    /// Opaque JSON forwarded as `extra_headers`
    pub metadata: Option<String>,
}

struct EngineShared {
    config: EngineConfig,
    sessions: DashMap<SessionKey, Arc<SessionShared>>,
    workers: Vec<mpsc::Sender<WorkerCmd>>,
    next_worker: AtomicUsize,
    events: EventSink,
    scheduler: Scheduler,
    stopped: AtomicBool,
}

/// The engine: explicit init at construction, explicit teardown via
/// [`Supervisor::shutdown`].
pub struct Supervisor {
    shared: Arc<EngineShared>,
    runtime: Option<Runtime>,
}

impl Supervisor {
    /// Build the engine with its own multi-threaded runtime. This is the
    /// standalone mode used by the binary.
    pub fn new(config: EngineConfig, events: EventSink) -> StreamResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.service_threads)
            .thread_name("callstream-transport")
            .enable_all()
            .build()
            .map_err(|e| StreamError::Init(e.to_string()))?;
        let handle = runtime.handle().clone();
        Ok(Self::build(config, events, handle, Some(runtime)))
    }

    /// Build the engine on an already running runtime (embedding hosts
    /// and tests).
    pub fn attached(config: EngineConfig, events: EventSink) -> Self {
        Self::build(config, events, Handle::current(), None)
    }

    fn build(
        config: EngineConfig,
        events: EventSink,
        handle: Handle,
        runtime: Option<Runtime>,
    ) -> Self {
        info!(
            subprotocol = %config.subprotocol,
            service_threads = config.service_threads,
            buffer_secs = config.buffer_secs,
            "starting streaming engine"
        );

        let mut workers = Vec::with_capacity(config.service_threads);
        let mut receivers = Vec::with_capacity(config.service_threads);
        for _ in 0..config.service_threads {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            workers.push(tx);
            receivers.push(rx);
        }

        let shared = Arc::new(EngineShared {
            config,
            sessions: DashMap::new(),
            workers,
            next_worker: AtomicUsize::new(0),
            events,
            scheduler: Scheduler::new(handle.clone()),
            stopped: AtomicBool::new(false),
        });

        for (index, rx) in receivers.into_iter().enumerate() {
            handle.spawn(worker_loop(index, shared.clone(), rx));
        }

        Self { shared, runtime }
    }

    // -------------------------------------------------------------------------
    // Command operations
    // -------------------------------------------------------------------------

    /// Attach a new stream to a call and schedule its first connect.
    pub fn start_stream(
        &self,
        call_id: &str,
        stream_id: &str,
        params: StartParams,
    ) -> StreamResult<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(StreamError::EngineStopped);
        }

        let endpoint = Endpoint::parse(&params.service_url)?;
        let key = session_key(call_id, stream_id);

        let worker_index =
            self.shared.next_worker.fetch_add(1, Ordering::SeqCst) % self.shared.workers.len();
        let worker_tx = self.shared.workers[worker_index].clone();

        let settings = StreamSettings {
            service_url: params.service_url.clone(),
            direction: params.direction,
            codec: params.codec,
            call_rate: params.call_rate,
            wire_rate: params.wire_rate,
            bidirectional: params.bidirectional,
            timeout_secs: params.timeout_secs,
            metadata: params.metadata.clone(),
        };

        let session = SessionShared::new(
            call_id,
            stream_id,
            settings,
            endpoint,
            self.shared.config.buffer_secs,
            self.shared.events.clone(),
            worker_tx.clone(),
        );

        match self.shared.sessions.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                error!(stream_id, call_id, "stream already attached");
                return Err(ConfigError::StreamExists(stream_id.to_string()).into());
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(session);
            }
        }

        if worker_tx.try_send(WorkerCmd::Connect { key: key.clone() }).is_err() {
            self.shared.sessions.remove(&key);
            error!(stream_id, "transport worker unavailable");
            return Err(StreamError::EngineStopped);
        }

        (self.shared.events)(StreamEvent::bare(
            EventKind::StreamStarted,
            call_id,
            stream_id,
        ));
        Ok(())
    }

    /// Stop a stream immediately, without draining buffered audio.
    pub fn stop_stream(
        &self,
        call_id: &str,
        stream_id: &str,
        reason: Option<&str>,
    ) -> StreamResult<()> {
        self.session(call_id, stream_id)?.stop(reason);
        Ok(())
    }

    /// Drain buffered audio, send `stop`, then close, within the 60 s
    /// budget.
    pub fn graceful_shutdown(
        &self,
        call_id: &str,
        stream_id: &str,
        reason: Option<&str>,
    ) -> StreamResult<()> {
        self.session(call_id, stream_id)?.graceful_shutdown(reason);
        Ok(())
    }

    pub fn pause_stream(&self, call_id: &str, stream_id: &str) -> StreamResult<()> {
        self.session(call_id, stream_id)?.set_paused(true);
        Ok(())
    }

    pub fn resume_stream(&self, call_id: &str, stream_id: &str) -> StreamResult<()> {
        self.session(call_id, stream_id)?.set_paused(false);
        Ok(())
    }

    /// Queue an opaque text frame for transmission on the stream.
    pub fn send_text(&self, call_id: &str, stream_id: &str, text: &str) -> StreamResult<()> {
        self.session(call_id, stream_id)?.send_text(text);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Host media hooks
    // -------------------------------------------------------------------------

    /// Capture hook: one 20 ms frame from the call.
    pub fn push_frame(
        &self,
        call_id: &str,
        stream_id: &str,
        leg: CaptureDirection,
        samples: &[i16],
        comfort_noise: bool,
    ) -> StreamResult<()> {
        self.session(call_id, stream_id)?
            .push_frame(leg, samples, comfort_noise)
    }

    /// Write-replace hook: mix buffered playback into an outgoing frame.
    /// Returns whether anything was mixed.
    pub fn mix_playback(&self, call_id: &str, stream_id: &str, frame: &mut [i16]) -> bool {
        match self.session(call_id, stream_id) {
            Ok(session) => session.mix_playback(frame),
            Err(_) => false,
        }
    }

    // -------------------------------------------------------------------------
    // Introspection and teardown
    // -------------------------------------------------------------------------

    /// Look up a live session.
    pub fn session(&self, call_id: &str, stream_id: &str) -> StreamResult<Arc<SessionShared>> {
        self.shared
            .sessions
            .get(&session_key(call_id, stream_id))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StreamError::NoSuchStream {
                call_id: call_id.to_string(),
                stream_id: stream_id.to_string(),
            })
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Force-close every session and stop the engine.
    pub fn shutdown(mut self) {
        info!("stopping streaming engine");
        self.shared.stopped.store(true, Ordering::SeqCst);
        for entry in self.shared.sessions.iter() {
            entry.value().force_close();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// One transport worker: local link table fed by the worker's own bounded
/// channel.
async fn worker_loop(
    index: usize,
    shared: Arc<EngineShared>,
    mut rx: mpsc::Receiver<WorkerCmd>,
) {
    let mut links: HashMap<SessionKey, Arc<Notify>> = HashMap::new();
    info!(worker = index, "transport worker started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCmd::Connect { key } => {
                let session = match shared.sessions.get(&key) {
                    Some(entry) => entry.value().clone(),
                    None => {
                        warn!(worker = index, key = %key, "connect for unknown session");
                        continue;
                    }
                };
                let wake = Arc::new(Notify::new());
                links.insert(key, wake.clone());
                let settings = LinkSettings {
                    subprotocol: shared.config.subprotocol.clone(),
                    auth: shared.config.auth.clone(),
                    tls: shared.config.tls,
                };
                tokio::spawn(run_link(
                    session,
                    settings,
                    shared.scheduler.clone(),
                    wake,
                ));
            }
            WorkerCmd::Wake { key } | WorkerCmd::Disconnect { key } => {
                if let Some(wake) = links.get(&key) {
                    wake.notify_one();
                }
            }
            WorkerCmd::Finished { key } => {
                links.remove(&key);
                if let Some((_, session)) = shared.sessions.remove(&key) {
                    session.finish();
                }
            }
        }
    }

    info!(worker = index, "transport worker stopped");
}
