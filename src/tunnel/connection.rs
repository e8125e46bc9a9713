use std::fmt;
use std::future::{ready, Ready};
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tower_service::Service;
use tracing::debug;

use super::Authority;
use crate::error::DialError;

/// A CONNECTed byte stream to the target, carried inside the proxy TLS session.
pub struct TunnelConnection {
    stream: TlsStream<TcpStream>,
    proxy: Authority,
    target: Authority,
}

impl TunnelConnection {
    pub(super) fn new(stream: TlsStream<TcpStream>, proxy: Authority, target: Authority) -> Self {
        Self {
            stream,
            proxy,
            target,
        }
    }

    pub fn proxy(&self) -> &Authority {
        &self.proxy
    }

    pub fn target(&self) -> &Authority {
        &self.target
    }
}

impl fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("proxy", &self.proxy)
            .field("target", &self.target)
            .finish()
    }
}

impl AsyncRead for TunnelConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.get_mut().stream), cx, buf)
    }
}

impl AsyncWrite for TunnelConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().stream), cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write_vectored(Pin::new(&mut self.get_mut().stream), cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        AsyncWrite::is_write_vectored(&self.stream)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().stream), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().stream), cx)
    }
}

pin_project! {
    /// The tunnel as seen by hyper and tonic.
    #[derive(Debug)]
    pub struct TunnelIo {
        #[pin]
        inner: TokioIo<TunnelConnection>,
    }
}

impl TunnelIo {
    fn new(tunnel: TunnelConnection) -> Self {
        Self {
            inner: TokioIo::new(tunnel),
        }
    }
}

impl Connection for TunnelIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl Read for TunnelIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Read::poll_read(self.project().inner, cx, buf)
    }
}

impl Write for TunnelIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Write::poll_write(self.project().inner, cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Write::poll_write_vectored(self.project().inner, cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        Write::is_write_vectored(&self.inner)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Write::poll_flush(self.project().inner, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Write::poll_shutdown(self.project().inner, cx)
    }
}

/// Connection factory handing out one already-dialed tunnel.
///
/// The URI a transport asks for is ignored since the tunnel is bound to its
/// target. The first call yields the tunnel; every later call fails with
/// [`DialError::TunnelClosed`], so a transport that drops the connection
/// cannot silently reconnect around the proxy.
#[derive(Clone)]
pub struct TunnelConnector {
    slot: Arc<Mutex<Option<TunnelConnection>>>,
    target: Authority,
}

impl TunnelConnector {
    pub fn new(tunnel: TunnelConnection) -> Self {
        let target = tunnel.target().clone();
        Self {
            slot: Arc::new(Mutex::new(Some(tunnel))),
            target,
        }
    }

    /// Take the tunnel, or fail if it was already handed out.
    pub fn acquire(&self) -> Result<TunnelConnection, DialError> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| DialError::TunnelClosed {
                target: self.target.to_string(),
            })
    }

    pub fn is_exhausted(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl fmt::Debug for TunnelConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConnector")
            .field("target", &self.target)
            .field("exhausted", &self.is_exhausted())
            .finish()
    }
}

impl Service<Uri> for TunnelConnector {
    type Response = TunnelIo;
    type Error = DialError;
    type Future = Ready<Result<TunnelIo, DialError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        debug!(%dst, target = %self.target, "transport requested tunnel");
        ready(self.acquire().map(TunnelIo::new))
    }
}
