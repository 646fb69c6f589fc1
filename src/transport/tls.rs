//! TLS connector honoring the certificate-validation knobs.
//!
//! The three relaxations are development conveniences and map onto the
//! native-tls builder: self-signed and expired certificates both require
//! accepting invalid certificates; hostname mismatch is its own switch.

use native_tls::TlsConnector;
use tokio_tungstenite::Connector;
use tracing::warn;

use crate::config::TlsOptions;
use crate::errors::TransportError;

/// Build the tungstenite connector for a session.
///
/// Returns `None` for plaintext endpoints so the caller can pass it
/// straight to the connect call.
pub fn build_connector(
    use_tls: bool,
    options: &TlsOptions,
) -> Result<Option<Connector>, TransportError> {
    if !use_tls {
        return Ok(None);
    }

    let mut builder = TlsConnector::builder();
    if options.allow_selfsigned || options.allow_expired {
        warn!(
            selfsigned = options.allow_selfsigned,
            expired = options.allow_expired,
            "accepting invalid server certificates"
        );
        builder.danger_accept_invalid_certs(true);
    }
    if options.skip_hostname_check {
        warn!("skipping server certificate hostname verification");
        builder.danger_accept_invalid_hostnames(true);
    }

    let connector = builder
        .build()
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(Some(Connector::NativeTls(connector)))
}
