use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::debug;

use super::handshake::{read_response, write_connect};
use super::{TunnelConnection, TunnelRequest};
use crate::error::{DialError, Result};

/// Open a TLS session to the proxy and CONNECT through it to the target.
///
/// The returned connection carries no buffered bytes: anything the proxy sent
/// past the response head fails the dial instead.
pub async fn open_tunnel(request: &TunnelRequest) -> Result<TunnelConnection> {
    match request.timeout {
        Some(limit) => tokio::time::timeout(limit, dial(request))
            .await
            .map_err(|_| DialError::Timeout {
                proxy: request.proxy.to_string(),
                target: request.target.to_string(),
                after: limit,
            })?,
        None => dial(request).await,
    }
}

async fn dial(request: &TunnelRequest) -> Result<TunnelConnection> {
    let proxy = request.proxy.to_string();
    let target = request.target.to_string();

    debug!(%proxy, %target, "dialing proxy");
    let tcp = TcpStream::connect((request.proxy.host.as_str(), request.proxy.port))
        .await
        .map_err(|source| DialError::ProxyUnreachable {
            proxy: proxy.clone(),
            source,
        })?;

    let mut stream = request
        .tls
        .connector()
        .connect(request.tls.server_name().clone(), tcp)
        .await
        .map_err(|source| DialError::TlsHandshakeFailed {
            proxy: proxy.clone(),
            source,
        })?;

    write_connect(&mut stream, &request.target)
        .await
        .map_err(|source| DialError::Io {
            proxy: proxy.clone(),
            target: target.clone(),
            source,
        })?;
    debug!(%proxy, %target, "sent CONNECT");

    let mut reader = BufReader::new(stream);
    let response = read_response(&mut reader)
        .await
        .map_err(|e| DialError::MalformedProxyResponse {
            proxy: proxy.clone(),
            target: target.clone(),
            reason: e.to_string(),
        })?;

    if !response.is_success() {
        return Err(DialError::ProxyRejected {
            proxy,
            target,
            status: response.status_text,
        });
    }

    // The client speaks first on the tunneled session, so the proxy has no
    // business sending anything past the head yet.
    let buffered = reader.buffer().len();
    if buffered > 0 {
        return Err(DialError::UnexpectedBufferedData {
            proxy,
            count: buffered,
        });
    }

    debug!(
        %proxy,
        %target,
        status = %response.status_text,
        version = ?response.version,
        headers = response.headers.len(),
        proxy_agent = response.header("proxy-agent").unwrap_or("-"),
        "proxy accepted CONNECT"
    );
    Ok(TunnelConnection::new(
        reader.into_inner(),
        request.proxy.clone(),
        request.target.clone(),
    ))
}
