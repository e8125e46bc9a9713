//! Demo target services that the probes tunnel to.
//!
//! - [`greeter`] - gRPC `hello.Greeter`
//! - [`hello`] - plain HTTP hello pages

pub mod greeter;
pub mod hello;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

/// Bind a listener for one of the demo services.
pub async fn bind(address: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", address, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", address, port))?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))
}
