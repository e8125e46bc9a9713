//! Test fixtures: a throwaway PKI, an in-process CONNECT proxy and an echo target.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsPaths;
use crate::tls::{load_root_store, TlsContext};
use crate::tunnel::Authority;

/// CA, proxy server leaf and client leaf, written as PEM into a temp dir.
pub struct TestPki {
    _dir: TempDir,
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    server_chain: Vec<CertificateDer<'static>>,
    server_key: Vec<u8>,
}

impl TestPki {
    pub fn generate() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let ca_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        ca_params.distinguished_name = common_name("connect-probe test CA");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        let issuer = Issuer::from_params(&ca_params, &ca_key);

        let server_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let server_params = leaf_params(
            &["localhost", "127.0.0.1"],
            ExtendedKeyUsagePurpose::ServerAuth,
        );
        let server_cert = server_params.signed_by(&server_key, &issuer).unwrap();

        let client_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let client_params = leaf_params(&["test-client"], ExtendedKeyUsagePurpose::ClientAuth);
        let client_cert = client_params.signed_by(&client_key, &issuer).unwrap();

        let write = |name: &str, pem: String| {
            let path = dir.path().join(name);
            std::fs::write(&path, pem).unwrap();
            path
        };
        let ca_cert_path = write("ca.pem", ca_cert.pem());
        let client_cert_path = write("client.pem", client_cert.pem());
        let client_key_path = write("client-key.pem", client_key.serialize_pem());

        Self {
            ca_cert: ca_cert_path,
            client_cert: client_cert_path,
            client_key: client_key_path,
            server_chain: vec![CertificateDer::from(server_cert.der().as_ref().to_vec())],
            server_key: server_key.serialize_der(),
            _dir: dir,
        }
    }

    pub fn client_paths(&self) -> TlsPaths {
        TlsPaths {
            client_cert: Some(self.client_cert.clone()),
            client_key: Some(self.client_key.clone()),
            ca_cert: Some(self.ca_cert.clone()),
        }
    }

    pub fn root_store(&self) -> RootCertStore {
        load_root_store(&self.ca_cert).unwrap()
    }

    pub fn client_tls(&self) -> TlsContext {
        TlsContext::load(&self.client_paths(), "localhost").unwrap()
    }

    /// Proxy-side config that requires a client certificate from this CA.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        let provider = Arc::new(ring::default_provider());
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(self.root_store()), provider.clone())
                .build()
                .unwrap();
        let key = PrivateKeyDer::try_from(self.server_key.clone()).unwrap();
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.server_chain.clone(), key)
            .unwrap();
        Arc::new(config)
    }
}

fn common_name(name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    dn
}

fn leaf_params(names: &[&str], usage: ExtendedKeyUsagePurpose) -> CertificateParams {
    let names = names.iter().map(|name| name.to_string()).collect::<Vec<_>>();
    let mut params = CertificateParams::new(names.clone()).unwrap();
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![usage];
    params.use_authority_key_identifier_extension = true;
    params.distinguished_name = common_name(&names[0]);
    params
}

/// How the test proxy answers a CONNECT.
#[derive(Debug, Clone)]
pub enum ProxyBehavior {
    /// 200 and splice to the requested target.
    Tunnel,
    /// Answer with this status (e.g. `"502 Bad Gateway"`) and close.
    Reject(&'static str),
    /// 200 followed immediately by these bytes.
    TunnelWithTrailingBytes(&'static [u8]),
    /// Send these bytes verbatim as the response.
    Raw(&'static [u8]),
    /// Read the request and never answer.
    Silent,
}

/// mTLS CONNECT proxy listening on loopback.
pub struct TestProxy {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
}

impl TestProxy {
    pub async fn spawn(pki: &TestPki, behavior: ProxyBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = TlsAcceptor::from(pki.server_config());
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&received);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let behavior = behavior.clone();
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let _ = handle(acceptor, stream, behavior, log).await;
                });
            }
        });

        Self { addr, received }
    }

    pub fn authority(&self) -> Authority {
        Authority::new("localhost", self.addr.port())
    }

    /// Raw CONNECT heads seen so far, blank line included.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

async fn handle(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    behavior: ProxyBehavior,
    log: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let tls = acceptor.accept(stream).await?;
    let mut reader = BufReader::new(tls);

    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        head.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }
    let target = head.split(' ').nth(1).unwrap_or_default().to_string();
    log.lock().unwrap().push(head);

    let mut client = reader.into_inner();
    match behavior {
        ProxyBehavior::Tunnel => {
            let mut upstream = match TcpStream::connect(&target).await {
                Ok(upstream) => upstream,
                Err(_) => {
                    client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                    return client.shutdown().await;
                }
            };
            client
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await?;
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        }
        ProxyBehavior::Reject(status) => {
            client
                .write_all(format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\n\r\n").as_bytes())
                .await?;
            client.shutdown().await?;
        }
        ProxyBehavior::TunnelWithTrailingBytes(extra) => {
            let mut response = b"HTTP/1.1 200 Connection established\r\n\r\n".to_vec();
            response.extend_from_slice(extra);
            client.write_all(&response).await?;
            let mut sink = Vec::new();
            client.read_to_end(&mut sink).await?;
        }
        ProxyBehavior::Raw(bytes) => {
            client.write_all(bytes).await?;
            client.shutdown().await?;
        }
        ProxyBehavior::Silent => {
            let mut sink = Vec::new();
            client.read_to_end(&mut sink).await?;
        }
    }
    Ok(())
}

/// Loopback TCP server that writes back whatever it reads.
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}
