//! Tunnel establishment through an HTTP CONNECT proxy.
//!
//! This module provides the pieces shared by every protocol client:
//! - [`open_tunnel`] - TLS to the proxy, CONNECT handshake, response checks
//! - [`TunnelConnection`] - the ready byte stream to the target
//! - [`TunnelConnector`] - single-use connection factory for tonic and hyper

mod connection;
mod dialer;
mod handshake;

pub use connection::{TunnelConnection, TunnelConnector};
pub use dialer::open_tunnel;

use std::fmt;
use std::time::Duration;

use crate::tls::TlsContext;

/// A `host:port` pair, formatted without bracket insertion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    pub host: String,
    pub port: u16,
}

impl Authority {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything [`open_tunnel`] needs for one dial.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub proxy: Authority,
    pub target: Authority,
    pub tls: TlsContext,
    /// Bound on the TLS connect plus CONNECT round trip.
    pub timeout: Option<Duration>,
}

impl TunnelRequest {
    pub fn new(proxy: Authority, target: Authority, tls: TlsContext) -> Self {
        Self {
            proxy,
            target,
            tls,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}
