//! In-process WebSocket mock consumer for integration tests.
//!
//! Accepts engine connections, records every text frame it receives, and
//! lets tests inject control messages back toward the engine. A scripted
//! rejection budget makes reconnect behaviour testable: the first N
//! connections are dropped before the handshake completes.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};

use callstream::{EventKind, EventSink, StreamEvent};

pub struct MockState {
    /// Connections to drop before the handshake; negative means none left
    reject_remaining: AtomicI64,
    rejected: AtomicU32,
    connections: AtomicU32,
    closes: AtomicU32,
    received: Mutex<Vec<Value>>,
    injector: Mutex<Option<mpsc::Sender<String>>>,
}

pub struct MockConsumer {
    port: u16,
    state: Arc<MockState>,
}

impl MockConsumer {
    /// Bind on an ephemeral port and serve connections until dropped.
    pub async fn spawn(reject_first: i64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock consumer");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(MockState {
            reject_remaining: AtomicI64::new(reject_first),
            rejected: AtomicU32::new(0),
            connections: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            received: Mutex::new(Vec::new()),
            injector: Mutex::new(None),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    handle_connection(stream, state).await;
                });
            }
        });

        Self { port, state }
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/stream", self.port)
    }

    pub fn connection_count(&self) -> u32 {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn rejected_count(&self) -> u32 {
        self.state.rejected.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Parsed text frames received so far, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().expect("received lock").clone()
    }

    /// Frames with the given `event` value.
    pub fn received_events(&self, event: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|value| value["event"] == event)
            .collect()
    }

    /// Send a text frame to the engine over the active connection.
    pub async fn inject(&self, text: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let sender = self.state.injector.lock().expect("injector lock").clone();
            if let Some(sender) = sender {
                sender.send(text.to_string()).await.expect("inject send");
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no active connection to inject into"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until the recorded frames satisfy `predicate`.
    pub async fn wait_for(&self, predicate: impl Fn(&[Value]) -> bool, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.received()) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "mock consumer wait timed out; received: {:#?}",
                self.received()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<MockState>) {
    if state.reject_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
        state.rejected.fetch_add(1, Ordering::SeqCst);
        // Dropping the TCP stream before the handshake fails the
        // client's connect attempt.
        return;
    }

    let callback = |req: &Request, mut response: Response| {
        if let Some(proto) = req.headers().get("Sec-WebSocket-Protocol") {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", proto.clone());
        }
        Ok(response)
    };
    let Ok(socket) = accept_hdr_async(stream, callback).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut write, mut read) = socket.split();

    let (tx, mut rx) = mpsc::channel::<String>(32);
    *state.injector.lock().expect("injector lock") = Some(tx);

    loop {
        tokio::select! {
            Some(text) = rx.recv() => {
                if write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let value = serde_json::from_str(&text)
                        .unwrap_or_else(|_| Value::String(text.to_string()));
                    state.received.lock().expect("received lock").push(value);
                }
                Some(Ok(Message::Close(_))) => {
                    state.closes.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            }
        }
    }

    *state.injector.lock().expect("injector lock") = None;
}

// =============================================================================
// Host event capture
// =============================================================================

/// Captures engine events for assertions.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<StreamEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> EventSink {
        let events = self.events.clone();
        Arc::new(move |event| {
            events.lock().expect("event lock").push(event);
        })
    }

    pub fn all(&self) -> Vec<StreamEvent> {
        self.events.lock().expect("event lock").clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.all().iter().filter(|event| event.kind == kind).count()
    }

    pub fn find(&self, kind: EventKind) -> Option<StreamEvent> {
        self.all().into_iter().find(|event| event.kind == kind)
    }

    pub async fn wait_for(&self, kind: EventKind, timeout: Duration) -> StreamEvent {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.find(kind) {
                return event;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "event {kind:?} never arrived; saw {:?}",
                self.all().iter().map(|e| e.kind).collect::<Vec<_>>()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Poll until `predicate` holds.
pub async fn wait_until(predicate: impl Fn() -> bool, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
