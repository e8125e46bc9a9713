//! Configuration management for connect-probe.
//!
//! Options come from CLI flags first, then the optional config file at
//! `<config dir>/connect-probe/config.toml`, then built-in defaults. The
//! resolved options are validated before any network activity.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::tunnel::Authority;

pub const DEFAULT_PROXY_HOST: &str = "localhost";
pub const DEFAULT_PROXY_PORT: u16 = 8090;
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{flag} file {path:?} does not exist")]
    MissingFile { flag: &'static str, path: PathBuf },

    #[error("cannot have client cert empty when client key is set to {key:?}")]
    KeyWithoutCert { key: PathBuf },

    #[error("cannot have client key empty when client cert is set to {cert:?}")]
    CertWithoutKey { cert: PathBuf },

    #[error("invalid endpoint address {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("unsupported scheme {scheme:?} in endpoint {endpoint}, only http is supported")]
    UnsupportedScheme { endpoint: String, scheme: String },
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    pub dial_timeout_secs: Option<u64>,
}

impl Config {
    /// Load the config file. An explicit path must exist; the default path may not.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match Self::config_path() {
                Ok(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "connect-probe")
            .context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

/// Proxy connection flags shared by the `grpc` and `http` commands.
#[derive(Args, Debug, Clone, Default)]
pub struct ProxyArgs {
    /// The host of the proxy server
    #[arg(long, env = "CONNECT_PROBE_PROXY_HOST")]
    pub proxy_host: Option<String>,

    /// The port the proxy server is listening on
    #[arg(long, env = "CONNECT_PROBE_PROXY_PORT")]
    pub proxy_port: Option<u16>,

    /// If non-empty secure communication with this cert
    #[arg(long)]
    pub client_cert: Option<PathBuf>,

    /// If non-empty secure communication with this key
    #[arg(long)]
    pub client_key: Option<PathBuf>,

    /// If non-empty the CAs we use to validate the proxy
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// Seconds allowed for the TLS connect and CONNECT round trip (0 disables)
    #[arg(long)]
    pub dial_timeout: Option<u64>,
}

/// Paths to PEM material for the proxy TLS session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsPaths {
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
}

impl TlsPaths {
    /// Client cert and key must come as a pair, and every named file must exist.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(key) = &self.client_key {
            ensure_exists("client-key", key)?;
            if self.client_cert.is_none() {
                return Err(ValidationError::KeyWithoutCert { key: key.clone() });
            }
        }
        if let Some(cert) = &self.client_cert {
            ensure_exists("client-cert", cert)?;
            if self.client_key.is_none() {
                return Err(ValidationError::CertWithoutKey { cert: cert.clone() });
            }
        }
        if let Some(ca) = &self.ca_cert {
            ensure_exists("ca-cert", ca)?;
        }
        Ok(())
    }
}

fn ensure_exists(flag: &'static str, path: &Path) -> Result<(), ValidationError> {
    if path.exists() {
        Ok(())
    } else {
        Err(ValidationError::MissingFile {
            flag,
            path: path.to_path_buf(),
        })
    }
}

/// Empty paths behave as if the flag was never given.
fn non_empty(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub proxy: Authority,
    pub tls: TlsPaths,
    pub dial_timeout: Option<Duration>,
}

impl ProxyOptions {
    /// Merge CLI flags over the config file over defaults.
    pub fn resolve(args: &ProxyArgs, file: &ProxyConfig) -> Self {
        let host = args
            .proxy_host
            .clone()
            .or_else(|| file.host.clone())
            .unwrap_or_else(|| DEFAULT_PROXY_HOST.to_string());
        let port = args.proxy_port.or(file.port).unwrap_or(DEFAULT_PROXY_PORT);

        let tls = TlsPaths {
            client_cert: non_empty(args.client_cert.clone().or_else(|| file.client_cert.clone())),
            client_key: non_empty(args.client_key.clone().or_else(|| file.client_key.clone())),
            ca_cert: non_empty(args.ca_cert.clone().or_else(|| file.ca_cert.clone())),
        };

        let secs = args
            .dial_timeout
            .or(file.dial_timeout_secs)
            .unwrap_or(DEFAULT_DIAL_TIMEOUT_SECS);
        let dial_timeout = (secs > 0).then(|| Duration::from_secs(secs));

        Self {
            proxy: Authority::new(host, port),
            tls,
            dial_timeout,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.tls.validate()
    }

    pub fn log(&self) {
        debug!("ClientCert set to {:?}", self.tls.client_cert);
        debug!("ClientKey set to {:?}", self.tls.client_key);
        debug!("CACert set to {:?}", self.tls.ca_cert);
        debug!("ProxyHost set to {:?}", self.proxy.host);
        debug!("ProxyPort set to {}", self.proxy.port);
        debug!("DialTimeout set to {:?}", self.dial_timeout);
    }
}

/// Resolved options for the `grpc` command.
#[derive(Debug, Clone)]
pub struct GrpcOptions {
    pub proxy: ProxyOptions,
    pub target: Authority,
    pub client_name: String,
}

impl GrpcOptions {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.proxy.validate()
    }

    pub fn log(&self) {
        self.proxy.log();
        debug!("RequestHost set to {:?}", self.target.host);
        debug!("RequestPort set to {}", self.target.port);
        debug!("RequestClientName set to {}", self.client_name);
    }
}

/// Resolved options for the `http` command.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub proxy: ProxyOptions,
    pub endpoint: Url,
    pub target: Authority,
    pub http2: bool,
}

impl HttpOptions {
    pub fn resolve(proxy: ProxyOptions, endpoint: &str, http2: bool) -> Result<Self, ValidationError> {
        let (endpoint, target) = parse_endpoint(endpoint)?;
        Ok(Self {
            proxy,
            endpoint,
            target,
            http2,
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.proxy.validate()
    }

    pub fn log(&self) {
        self.proxy.log();
        debug!("RequestEndpoint set to {:?}", self.endpoint.as_str());
        debug!("HTTP2 set to {}", self.http2);
    }
}

/// Split an endpoint URL into the URL itself and the authority to CONNECT to.
pub fn parse_endpoint(endpoint: &str) -> Result<(Url, Authority), ValidationError> {
    let url = Url::parse(endpoint).map_err(|e| ValidationError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;

    if url.scheme() != "http" {
        return Err(ValidationError::UnsupportedScheme {
            endpoint: endpoint.to_string(),
            scheme: url.scheme().to_string(),
        });
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ValidationError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: "missing host".to_string(),
        })?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ValidationError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: "missing port".to_string(),
        })?;

    Ok((url, Authority::new(host, port)))
}
