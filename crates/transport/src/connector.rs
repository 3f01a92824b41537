//! Gateway connections
//!
//! A [`Connector`] hands the session driver a fresh encrypted stream to a
//! gateway. The default [`TlsConnector`] dials TCP, optionally negotiates a
//! proxy tunnel, and runs the rustls handshake.

use crate::cancel::CancelToken;
use crate::proxy::{ProxyConfig, ProxyError, negotiate_proxy};
use async_trait::async_trait;
use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

/// Byte stream to a gateway
pub trait GatewayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> GatewayStream for T {}

pub type BoxedStream = Box<dyn GatewayStream>;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Proxy negotiation failed: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Invalid server name '{0}'")]
    InvalidHostname(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Failed to load CA file {path}: {reason}")]
    CaFile { path: PathBuf, reason: String },
}

impl ConnectError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ConnectError::Cancelled | ConnectError::Proxy(ProxyError::Cancelled)
        )
    }
}

/// Opens streams to gateways
#[async_trait]
pub trait Connector: Send {
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        cancel: &CancelToken,
    ) -> Result<BoxedStream, ConnectError>;

    /// Forget cached addresses; called when a redirect changes host
    fn reset(&mut self) {}
}

/// Build a rustls client config trusting `ca_file`, or the webpki roots
pub fn build_tls_config(ca_file: Option<&Path>) -> Result<rustls::ClientConfig, ConnectError> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            let ca_err = |reason: String| ConnectError::CaFile {
                path: path.to_path_buf(),
                reason,
            };
            let file = File::open(path).map_err(|e| ca_err(e.to_string()))?;
            let mut reader = BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| ca_err(e.to_string()))?;
                roots.add(cert).map_err(|e| ca_err(e.to_string()))?;
            }
            if roots.is_empty() {
                return Err(ca_err("no certificates found".to_string()));
            }
            debug!("Loaded {} CA certificates from {}", roots.len(), path.display());
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// TCP + optional proxy + rustls
pub struct TlsConnector {
    config: Arc<rustls::ClientConfig>,
    proxy: Option<ProxyConfig>,
    user_agent: String,
    cached: Option<(String, u16, SocketAddr)>,
}

impl TlsConnector {
    pub fn new(config: rustls::ClientConfig, user_agent: impl Into<String>) -> Self {
        Self {
            config: Arc::new(config),
            proxy: None,
            user_agent: user_agent.into(),
            cached: None,
        }
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Address resolved by the last connect, if still cached
    pub fn cached_addr(&self) -> Option<SocketAddr> {
        self.cached.as_ref().map(|(_, _, addr)| *addr)
    }

    async fn resolve(
        &mut self,
        host: &str,
        port: u16,
        cancel: &CancelToken,
    ) -> Result<SocketAddr, ConnectError> {
        if let Some((cached_host, cached_port, addr)) = &self.cached {
            if cached_host == host && *cached_port == port {
                return Ok(*addr);
            }
        }

        let lookup = strip_brackets(host);
        let mut addrs = cancel
            .run(tokio::net::lookup_host((lookup, port)))
            .await
            .ok_or(ConnectError::Cancelled)?
            .map_err(|e| {
                error!("Failed to resolve host '{}': {}", host, e);
                ConnectError::Resolve(host.to_string())
            })?;
        let addr = addrs.next().ok_or_else(|| {
            error!("Failed to resolve host '{}'", host);
            ConnectError::Resolve(host.to_string())
        })?;

        self.cached = Some((host.to_string(), port, addr));
        Ok(addr)
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        cancel: &CancelToken,
    ) -> Result<BoxedStream, ConnectError> {
        let (dial_host, dial_port) = match &self.proxy {
            Some(proxy) => (proxy.host.clone(), proxy.port),
            None => (host.to_string(), port),
        };

        let addr = self.resolve(&dial_host, dial_port, cancel).await?;
        debug!("Connecting to {}", addr);
        let mut tcp = cancel
            .run(TcpStream::connect(addr))
            .await
            .ok_or(ConnectError::Cancelled)?
            .map_err(|e| {
                error!("Failed to connect to host {}: {}", dial_host, e);
                ConnectError::Io(e)
            })?;
        tcp.set_nodelay(true)?;

        if let Some(proxy) = &self.proxy {
            negotiate_proxy(&mut tcp, proxy.kind, host, port, &self.user_agent, cancel).await?;
        }

        let name = ServerName::try_from(strip_brackets(host).to_string())
            .map_err(|_| ConnectError::InvalidHostname(host.to_string()))?;
        let tls = tokio_rustls::TlsConnector::from(self.config.clone());
        let stream = cancel
            .run(tls.connect(name, tcp))
            .await
            .ok_or(ConnectError::Cancelled)?
            .map_err(|e| {
                error!("SSL connection failure: {}", e);
                ConnectError::Io(e)
            })?;

        info!("Connected to HTTPS on {}:{}", host, port);
        Ok(Box::new(stream))
    }

    fn reset(&mut self) {
        self.cached = None;
    }
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
