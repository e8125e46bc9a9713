use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failures while establishing or handing off a tunnel through the proxy.
#[derive(Error, Debug)]
pub enum DialError {
    #[error("dialing proxy {proxy:?} failed: {source}")]
    ProxyUnreachable {
        proxy: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with proxy {proxy:?} failed: {source}")]
    TlsHandshakeFailed {
        proxy: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on tunnel to {target} via proxy {proxy}: {source}")]
    Io {
        proxy: String,
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("reading HTTP response from CONNECT to {target} via proxy {proxy} failed: {reason}")]
    MalformedProxyResponse {
        proxy: String,
        target: String,
        reason: String,
    },

    #[error("proxy error from {proxy} while dialing {target}: {status}")]
    ProxyRejected {
        proxy: String,
        target: String,
        status: String,
    },

    #[error("unexpected {count} bytes of buffered data from CONNECT proxy {proxy:?}")]
    UnexpectedBufferedData { proxy: String, count: usize },

    #[error("CONNECT to {target} via proxy {proxy} did not complete within {after:?}")]
    Timeout {
        proxy: String,
        target: String,
        after: Duration,
    },

    #[error("tunnel to {target} was already handed off and cannot be dialed again")]
    TunnelClosed { target: String },
}

impl DialError {
    /// Short machine-readable name of the failure, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            DialError::ProxyUnreachable { .. } => "proxy_unreachable",
            DialError::TlsHandshakeFailed { .. } => "tls_handshake_failed",
            DialError::Io { .. } => "io",
            DialError::MalformedProxyResponse { .. } => "malformed_proxy_response",
            DialError::ProxyRejected { .. } => "proxy_rejected",
            DialError::UnexpectedBufferedData { .. } => "unexpected_buffered_data",
            DialError::Timeout { .. } => "timeout",
            DialError::TunnelClosed { .. } => "tunnel_closed",
        }
    }
}

pub type Result<T> = std::result::Result<T, DialError>;
