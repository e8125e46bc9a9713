use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{Request, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tracing::{debug, info, warn};
use url::Url;

use super::Probe;
use crate::config::HttpOptions;
use crate::tunnel::{Authority, TunnelConnector};

pub const READ_IDLE_TIMEOUT_ENV: &str = "HTTP2_READ_IDLE_TIMEOUT_SECONDS";
pub const PING_TIMEOUT_ENV: &str = "HTTP2_PING_TIMEOUT_SECONDS";

const DEFAULT_READ_IDLE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PING_TIMEOUT_SECS: u64 = 15;

/// HTTP/2 connection health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Tuning {
    /// Idle time before a health ping is sent. `None` turns pings off.
    pub read_idle_timeout: Option<Duration>,
    /// How long to wait for a ping to be acknowledged.
    pub ping_timeout: Duration,
}

impl Default for Http2Tuning {
    fn default() -> Self {
        Self {
            read_idle_timeout: Some(Duration::from_secs(DEFAULT_READ_IDLE_TIMEOUT_SECS)),
            ping_timeout: Duration::from_secs(DEFAULT_PING_TIMEOUT_SECS),
        }
    }
}

impl Http2Tuning {
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var(READ_IDLE_TIMEOUT_ENV).ok().as_deref(),
            std::env::var(PING_TIMEOUT_ENV).ok().as_deref(),
        )
    }

    pub fn from_values(read_idle_timeout: Option<&str>, ping_timeout: Option<&str>) -> Self {
        let read_idle = seconds_setting(
            READ_IDLE_TIMEOUT_ENV,
            read_idle_timeout,
            DEFAULT_READ_IDLE_TIMEOUT_SECS,
        );
        let ping = seconds_setting(PING_TIMEOUT_ENV, ping_timeout, DEFAULT_PING_TIMEOUT_SECS);

        Self {
            read_idle_timeout: (read_idle > 0).then(|| Duration::from_secs(read_idle)),
            ping_timeout: Duration::from_secs(ping),
        }
    }
}

/// Largest accepted setting: the seconds that fit in `i64` nanoseconds.
const MAX_SETTING_SECS: u64 = i64::MAX as u64 / 1_000_000_000;

fn seconds_setting(name: &str, raw: Option<&str>, default: u64) -> u64 {
    let Some(raw) = raw.filter(|v| !v.is_empty()) else {
        return default;
    };
    let parsed = raw
        .trim()
        .parse::<u64>()
        .map_err(|e| e.to_string())
        .and_then(|secs| {
            if secs <= MAX_SETTING_SECS {
                Ok(secs)
            } else {
                Err(format!("exceeds {} seconds", MAX_SETTING_SECS))
            }
        });
    match parsed {
        Ok(secs) => secs,
        Err(e) => {
            warn!(
                "Illegal {}({:?}): {}. Default value {} is used",
                name, raw, e, default
            );
            default
        }
    }
}

/// Sends one `GET` through the tunnel and returns the body.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    endpoint: Url,
    target: Authority,
    tuning: Http2Tuning,
    http2: bool,
}

impl HttpProbe {
    pub fn new(endpoint: Url, target: Authority) -> Self {
        Self {
            endpoint,
            target,
            tuning: Http2Tuning::default(),
            http2: false,
        }
    }

    /// Speak HTTP/2 prior knowledge with the given health checks.
    pub fn with_http2(mut self, tuning: Http2Tuning) -> Self {
        self.tuning = tuning;
        self.http2 = true;
        self
    }

    /// The environment is read in both modes so bad settings always warn.
    pub fn from_options(options: &HttpOptions) -> Self {
        let tuning = Http2Tuning::from_env();
        let mut probe = Self::new(options.endpoint.clone(), options.target.clone());
        probe.tuning = tuning;
        probe.http2 = options.http2;
        probe
    }

    fn client(&self, connector: TunnelConnector) -> Client<TunnelConnector, Empty<Bytes>> {
        let mut builder = Client::builder(TokioExecutor::new());
        builder.timer(TokioTimer::new()).pool_timer(TokioTimer::new());

        if self.http2 {
            let tuning = self.tuning;
            debug!(?tuning, "using HTTP/2");
            builder
                .http2_only(true)
                .http2_keep_alive_interval(tuning.read_idle_timeout)
                .http2_keep_alive_timeout(tuning.ping_timeout)
                .http2_keep_alive_while_idle(true);
        }

        builder.build(connector)
    }
}

#[tonic::async_trait]
impl Probe for HttpProbe {
    fn target(&self) -> &Authority {
        &self.target
    }

    async fn run(&self, connector: TunnelConnector) -> Result<String> {
        let client = self.client(connector);

        let uri: Uri = self
            .endpoint
            .as_str()
            .parse()
            .context("invalid request endpoint")?;
        let request = Request::get(uri)
            .body(Empty::<Bytes>::new())
            .context("failed to build request")?;

        let response = client
            .request(request)
            .await
            .context("failed to send request to client")?;
        let status = response.status();
        debug!(%status, version = ?response.version(), "response head received");

        let body = response
            .into_body()
            .collect()
            .await
            .context("failed to read response from client")?
            .to_bytes();
        let body = String::from_utf8_lossy(&body).into_owned();

        info!(%status, "HTML Response:\n{}", body);
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::probe_through;
    use crate::service::hello;
    use crate::testing::{ProxyBehavior, TestPki, TestProxy};
    use crate::tunnel::TunnelRequest;
    use tokio::net::TcpListener;

    async fn spawn_hello() -> Authority {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(hello::serve(listener, std::future::pending()));
        Authority::new("127.0.0.1", port)
    }

    async fn get(probe: HttpProbe) -> Result<String> {
        let pki = TestPki::generate();
        let proxy = TestProxy::spawn(&pki, ProxyBehavior::Tunnel).await;
        let request = TunnelRequest::new(proxy.authority(), probe.target().clone(), pki.client_tls());
        probe_through(&probe, &request).await
    }

    #[tokio::test]
    async fn test_get_over_http1() {
        let target = spawn_hello().await;
        let endpoint = Url::parse(&format!("http://{}/", target)).unwrap();

        let body = get(HttpProbe::new(endpoint, target)).await.unwrap();
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_get_over_http2() {
        let target = spawn_hello().await;
        let endpoint = Url::parse(&format!("http://{}/", target)).unwrap();

        let probe = HttpProbe::new(endpoint, target).with_http2(Http2Tuning::default());
        let body = get(probe).await.unwrap();
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_not_found_is_not_an_error() {
        let target = spawn_hello().await;
        let endpoint = Url::parse(&format!("http://{}/missing", target)).unwrap();

        let body = get(HttpProbe::new(endpoint, target)).await.unwrap();
        assert!(body.contains("Lost.."));
    }

    #[test]
    fn test_tuning_defaults() {
        let tuning = Http2Tuning::from_values(None, None);
        assert_eq!(tuning, Http2Tuning::default());
        assert_eq!(tuning.read_idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(tuning.ping_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_tuning_overrides() {
        let tuning = Http2Tuning::from_values(Some("45"), Some("5"));
        assert_eq!(tuning.read_idle_timeout, Some(Duration::from_secs(45)));
        assert_eq!(tuning.ping_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_read_idle_disables_pings() {
        let tuning = Http2Tuning::from_values(Some("0"), None);
        assert_eq!(tuning.read_idle_timeout, None);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let tuning = Http2Tuning::from_values(Some("soon"), Some("-3"));
        assert_eq!(tuning, Http2Tuning::default());
    }

    #[test]
    fn test_out_of_range_values_fall_back() {
        let tuning = Http2Tuning::from_values(Some("18446744073709551615"), Some("9223372037"));
        assert_eq!(tuning, Http2Tuning::default());

        let max = MAX_SETTING_SECS.to_string();
        let tuning = Http2Tuning::from_values(Some(&max), None);
        assert_eq!(tuning.read_idle_timeout, Some(Duration::from_secs(MAX_SETTING_SECS)));
    }

    #[tokio::test]
    async fn test_huge_read_idle_setting_still_gets_response() {
        let target = spawn_hello().await;
        let endpoint = Url::parse(&format!("http://{}/", target)).unwrap();

        let tuning = Http2Tuning::from_values(Some("18446744073709551615"), None);
        let probe = HttpProbe::new(endpoint, target).with_http2(tuning);
        assert_eq!(get(probe).await.unwrap(), "ok");
    }

    #[test]
    fn test_env_tuning_read_in_http1_mode() {
        std::env::set_var(PING_TIMEOUT_ENV, "7");
        let options = HttpOptions {
            proxy: crate::config::ProxyOptions {
                proxy: Authority::new("localhost", 8090),
                tls: Default::default(),
                dial_timeout: None,
            },
            endpoint: Url::parse("http://127.0.0.1:8080").unwrap(),
            target: Authority::new("127.0.0.1", 8080),
            http2: false,
        };
        let http1 = HttpProbe::from_options(&options);
        let http2 = HttpProbe::from_options(&HttpOptions {
            http2: true,
            ..options.clone()
        });
        std::env::remove_var(PING_TIMEOUT_ENV);

        assert!(!http1.http2);
        assert_eq!(http1.tuning.ping_timeout, Duration::from_secs(7));
        assert!(http2.http2);
        assert_eq!(http2.tuning, http1.tuning);
    }
}
