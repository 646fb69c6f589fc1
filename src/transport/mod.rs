//! WebSocket transport: endpoint resolution, TLS setup, and the
//! per-session connection driver.

pub mod client;
pub mod tls;

use std::fmt;

use crate::errors::ConfigError;

/// Maximum connection attempts before the link is declared failed.
pub const MAX_CONNECTION_ATTEMPTS: u32 = 3;

/// Delay between reconnection attempts, seconds.
pub const RECONNECT_DELAY_SECS: u64 = 1;

/// Hard budget for a graceful drain before the socket is torn down,
/// seconds.
pub const GRACEFUL_SHUTDOWN_BUDGET_SECS: u64 = 60;

/// Largest accepted inbound message: five minutes of 16 kHz PCM16
/// (~19 MB). Larger messages are dropped.
pub const MAX_RECV_BUF: usize = 16000 * 2 * 60 * 5;

/// Interval between keepalive pings on an idle connection, seconds.
pub const KEEPALIVE_PING_SECS: u64 = 20;

/// Lifecycle of one WebSocket link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Disconnected,
    /// Terminal: attempts exhausted
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "Idle",
            LinkState::Connecting => "Connecting",
            LinkState::Connected => "Connected",
            LinkState::Reconnecting => "Reconnecting",
            LinkState::Disconnecting => "Disconnecting",
            LinkState::Disconnected => "Disconnected",
            LinkState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Resolved remote endpoint of the consumer service.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub use_tls: bool,
}

impl Endpoint {
    /// Parse a service URL. Accepted schemes: `ws`, `wss`, `http`,
    /// `https`; the secure schemes imply TLS and default to port 443,
    /// the plain ones to port 80.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let parsed = url::Url::parse(raw).map_err(|_| ConfigError::InvalidUrl(raw.to_string()))?;

        let use_tls = match parsed.scheme() {
            "wss" | "https" => true,
            "ws" | "http" => false,
            other => return Err(ConfigError::InvalidScheme(other.to_string())),
        };

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidUrl(raw.to_string()))?
            .to_string();
        let port = parsed
            .port()
            .unwrap_or(if use_tls { 443 } else { 80 });

        let mut path = parsed.path().to_string();
        if path.is_empty() {
            path = "/".to_string();
        }
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            host,
            port,
            path,
            use_tls,
        })
    }

    /// The ws/wss URL used for the client handshake.
    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}
