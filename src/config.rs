//! Engine configuration from environment variables.
//!
//! All knobs live under the `CALLSTREAM_` prefix and are read once when the
//! [`Supervisor`](crate::supervisor::Supervisor) is constructed. Invalid
//! values fall back to defaults with a warning; configuration never aborts
//! the process.

use std::env;

use tracing::warn;

/// Default WebSocket sub-protocol offered during the handshake.
pub const DEFAULT_SUBPROTOCOL: &str = "audio.freeswitch.org";

/// Default number of transport worker contexts.
pub const DEFAULT_SERVICE_THREADS: usize = 2;

/// Default ring-buffer depth in seconds of audio.
pub const DEFAULT_BUFFER_SECS: u32 = 40;

/// TLS certificate-validation knobs (development relaxations).
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsOptions {
    /// Accept self-signed server certificates
    pub allow_selfsigned: bool,
    /// Skip server-certificate hostname verification
    pub skip_hostname_check: bool,
    /// Accept expired server certificates
    pub allow_expired: bool,
}

/// Optional HTTP Basic credentials attached to the handshake.
///
/// The Authorization header is only added when both user and password are
/// configured.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

/// Process-wide engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sub-protocol name offered in the WebSocket handshake
    pub subprotocol: String,
    /// Number of transport worker contexts, clamped to 1..=5
    pub service_threads: usize,
    /// Ring-buffer depth in seconds, clamped to 1..=40
    pub buffer_secs: u32,
    /// TLS relaxation flags
    pub tls: TlsOptions,
    /// HTTP Basic credentials for the handshake
    pub auth: Option<BasicAuth>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            subprotocol: DEFAULT_SUBPROTOCOL.to_string(),
            service_threads: DEFAULT_SERVICE_THREADS,
            buffer_secs: DEFAULT_BUFFER_SECS,
            tls: TlsOptions::default(),
            auth: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `CALLSTREAM_*` environment variables.
    pub fn from_env() -> Self {
        let subprotocol = env::var("CALLSTREAM_SUBPROTOCOL_NAME")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SUBPROTOCOL.to_string());

        let service_threads = clamped_usize(
            "CALLSTREAM_SERVICE_THREADS",
            DEFAULT_SERVICE_THREADS,
            1,
            5,
        );
        let buffer_secs =
            clamped_usize("CALLSTREAM_BUFFER_SECS", DEFAULT_BUFFER_SECS as usize, 1, 40) as u32;

        let tls = TlsOptions {
            allow_selfsigned: env_flag("CALLSTREAM_ALLOW_SELFSIGNED"),
            skip_hostname_check: env_flag("CALLSTREAM_SKIP_SERVER_CERT_HOSTNAME_CHECK"),
            allow_expired: env_flag("CALLSTREAM_ALLOW_EXPIRED"),
        };

        let auth = match (
            env::var("CALLSTREAM_HTTP_AUTH_USER").ok().filter(|s| !s.is_empty()),
            env::var("CALLSTREAM_HTTP_AUTH_PASSWORD").ok().filter(|s| !s.is_empty()),
        ) {
            (Some(user), Some(password)) => Some(BasicAuth { user, password }),
            _ => None,
        };

        Self {
            subprotocol,
            service_threads,
            buffer_secs,
            tls,
            auth,
        }
    }
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn clamped_usize(name: &str, default: usize, min: usize, max: usize) -> usize {
    match env::var(name) {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(v) => v.clamp(min, max),
            Err(_) => {
                warn!(var = name, value = %raw, "unparseable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
