//! Protocol clients that run one request through the tunnel.
//!
//! This module provides:
//! - [`Probe`] - one application request over a supplied connection factory
//! - [`GrpcProbe`] - unary `SayHello` call with a fixed deadline
//! - [`HttpProbe`] - single `GET` over HTTP/1.1 or HTTP/2
//! - [`execute`] - dial once, then hand the tunnel to a probe

mod grpc;
mod http;

pub use self::grpc::GrpcProbe;
pub use self::http::HttpProbe;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::ProxyOptions;
use crate::tls::TlsContext;
use crate::tunnel::{open_tunnel, Authority, TunnelConnector, TunnelRequest};

/// A protocol client that performs exactly one request.
#[tonic::async_trait]
pub trait Probe: Send + Sync {
    /// Where the tunnel must lead.
    fn target(&self) -> &Authority;

    /// Run the request over `connector` and return what was logged.
    async fn run(&self, connector: TunnelConnector) -> Result<String>;
}

/// Load TLS material, dial the tunnel once and run `probe` over it.
pub async fn execute<P: Probe>(probe: &P, options: &ProxyOptions) -> Result<String> {
    let tls = TlsContext::load(&options.tls, &options.proxy.host)
        .context("failed to load TLS material for the proxy")?;
    let request = TunnelRequest::new(options.proxy.clone(), probe.target().clone(), tls)
        .with_timeout(options.dial_timeout);

    probe_through(probe, &request).await
}

pub async fn probe_through<P: Probe>(probe: &P, request: &TunnelRequest) -> Result<String> {
    let tunnel = open_tunnel(request)
        .await
        .inspect_err(|e| debug!(kind = e.kind(), "tunnel dial failed"))
        .context("failed to get dialer for client")?;
    info!(proxy = %tunnel.proxy(), target = %tunnel.target(), "tunnel established");

    probe.run(TunnelConnector::new(tunnel)).await
}
