//! Per-session WebSocket connection driver.
//!
//! One task per session, pinned to a transport worker. The driver owns the
//! socket for the whole link lifetime: it performs the handshake (with
//! sub-protocol, optional Basic auth, and the TLS knobs), retries failed
//! connects up to the attempt cap, and then serves the link — draining the
//! session's writable pump one message per pass and dispatching inbound
//! text frames back into the session.

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{BasicAuth, TlsOptions};
use crate::errors::TransportError;
use crate::scheduler::Scheduler;
use crate::session::{PumpAction, SessionShared};
use crate::supervisor::WorkerCmd;
use crate::transport::{
    tls, LinkState, KEEPALIVE_PING_SECS, MAX_CONNECTION_ATTEMPTS, MAX_RECV_BUF,
    RECONNECT_DELAY_SECS,
};

/// Handshake parameters shared by every session of the engine.
#[derive(Clone)]
pub struct LinkSettings {
    pub subprotocol: String,
    pub auth: Option<BasicAuth>,
    pub tls: TlsOptions,
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

enum ServeEnd {
    /// We sent the close frame (graceful drain or forced stop)
    LocalClose,
    /// The far end closed or the socket failed
    RemoteClose,
}

/// Drive one session's link until it is finished, then report back to the
/// worker so the supervisor can remove the session.
pub(crate) async fn run_link(
    session: Arc<SessionShared>,
    settings: LinkSettings,
    scheduler: Scheduler,
    wake: Arc<Notify>,
) {
    let mut first_attempt = true;
    loop {
        if session.is_closing() {
            session.set_link_state(LinkState::Disconnected);
            break;
        }

        session.set_link_state(if first_attempt {
            LinkState::Connecting
        } else {
            LinkState::Reconnecting
        });
        first_attempt = false;
        let attempt = session.bump_attempt();

        match connect(&session, &settings).await {
            Ok(socket) => {
                session.on_established(&scheduler);
                match serve(socket, &session, &wake).await {
                    ServeEnd::LocalClose => {
                        session.set_link_state(LinkState::Disconnected);
                        session.on_closed_gracefully();
                        break;
                    }
                    ServeEnd::RemoteClose => {
                        if session.is_closing() || session.attempts_exhausted() {
                            session.set_link_state(LinkState::Disconnected);
                            session.on_connection_dropped();
                            break;
                        }
                        session.on_retry_scheduled(1, "connection closed by far end");
                        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                    }
                }
            }
            Err(e) => {
                if attempt >= MAX_CONNECTION_ATTEMPTS {
                    session.on_connect_failed(&e.to_string());
                    break;
                }
                session.on_retry_scheduled(attempt, &e.to_string());
                tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
            }
        }
    }

    // Hand the key back to the worker; the supervisor removes the session
    // from the registry there, never from inside a transport callback.
    let _ = session
        .worker_sender()
        .send(WorkerCmd::Finished { key: session.key() })
        .await;
}

async fn connect(
    session: &SessionShared,
    settings: &LinkSettings,
) -> Result<WsStream, TransportError> {
    let endpoint = session.endpoint();
    let url = endpoint.ws_url();
    debug!(
        stream_id = %session.stream_id(),
        host = %endpoint.host,
        path = %endpoint.path,
        "attempting connection"
    );

    let mut request = http::Request::builder()
        .uri(&url)
        .header("Host", format!("{}:{}", endpoint.host, endpoint.port))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Sec-WebSocket-Protocol", settings.subprotocol.clone());
    if let Some(auth) = &settings.auth {
        let token = BASE64_STANDARD.encode(format!("{}:{}", auth.user, auth.password));
        request = request.header("Authorization", format!("Basic {token}"));
    }
    let request = request
        .body(())
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

    let connector = tls::build_connector(endpoint.use_tls, &settings.tls)?;
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_RECV_BUF);
    ws_config.max_frame_size = Some(MAX_RECV_BUF);

    let (socket, _response) =
        connect_async_tls_with_config(request, Some(ws_config), false, connector)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
    Ok(socket)
}

/// Serve an established link until either side closes it.
async fn serve(socket: WsStream, session: &Arc<SessionShared>, wake: &Notify) -> ServeEnd {
    let (mut sink, mut stream) = socket.split();

    let ping_period = Duration::from_secs(KEEPALIVE_PING_SECS);
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);

    // The graceful drain cannot rely on capture wakeups (capture discards
    // frames while draining), so poll the pump until the stop goes out.
    let drain_period = Duration::from_millis(100);
    let mut drain_tick =
        tokio::time::interval_at(tokio::time::Instant::now() + drain_period, drain_period);

    loop {
        // One message per pass, highest-priority work first.
        loop {
            match session.next_outbound() {
                PumpAction::Idle => break,
                PumpAction::Send(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        warn!(stream_id = %session.stream_id(), error = %e, "send failed");
                        return ServeEnd::RemoteClose;
                    }
                }
                PumpAction::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.flush().await;
                    return ServeEnd::LocalClose;
                }
            }
        }

        tokio::select! {
            _ = wake.notified() => {}
            _ = drain_tick.tick(), if session.draining() => {}
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return ServeEnd::RemoteClose;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => session.handle_inbound(&text),
                Some(Ok(Message::Binary(_))) => {
                    warn!(stream_id = %session.stream_id(), "received binary frame, discarding");
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        return ServeEnd::RemoteClose;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(stream_id = %session.stream_id(), "socket closed by far end");
                    return ServeEnd::RemoteClose;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(stream_id = %session.stream_id(), error = %e, "websocket error");
                    return ServeEnd::RemoteClose;
                }
            }
        }
    }
}
