//! Plain HTTP hello service.
//!
//! Speaks HTTP/1.1 and HTTP/2 prior knowledge on the same port so both HTTP
//! probe modes have something to talk to.

use std::convert::Infallible;
use std::future::Future;

use anyhow::Result;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const OK_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head>\n<title>OK!</title>\n</head>\n<body>\n<p>Everything is ok</p>\n</body>\n</html>";
const NOT_FOUND_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head>\n<title>NOT FOUND!</title>\n</head>\n<body>\n<p>Lost..</p>\n</body>\n</html>";

/// Status and body for a request line.
pub fn route(method: &Method, path: &str) -> (StatusCode, &'static str) {
    match (method, path) {
        (&Method::GET, "/") => (StatusCode::OK, "ok"),
        (&Method::GET, "/ok") => (StatusCode::OK, OK_PAGE),
        _ => (StatusCode::NOT_FOUND, NOT_FOUND_PAGE),
    }
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    info!("Request: {} {} {:?}", req.method(), req.uri(), req.version());
    let (status, body) = route(req.method(), req.uri().path());

    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    Ok(response)
}

/// Serve on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let addr = listener.local_addr()?;
    info!("start http server on {}", addr);
    info!("available path: http://{}/ok", addr);

    tokio::pin!(shutdown);
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        info!("Connection from {}", peer);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(err) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service_fn(handle))
                .await
            {
                debug!("Connection from {} ended: {:?}", peer, err);
            }
        });
    }

    info!("http server stopped");
    Ok(())
}
