//! Client configuration

use crate::error::SessionError;
use crate::session::{DEFAULT_MAX_REDIRECTS, DEFAULT_USER_AGENT, SessionOptions, user_agent};
use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tollgate_crypto::{Totp, TokenBackend};
use tollgate_protocol::{ClientIdentity, default_device_id};
use tracing::error;

/// Client configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Gateway and login behaviour
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Upstream proxy
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// TLS trust
    #[serde(default)]
    pub tls: TlsConfig,

    /// One-time code generation
    #[serde(default)]
    pub token: TokenConfig,

    /// Host checker
    #[serde(default)]
    pub csd: CsdConfig,
}

impl ClientConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Session options derived from the `[gateway]` section
    pub fn session_options(&self) -> SessionOptions {
        let gw = &self.gateway;
        SessionOptions {
            useragent: user_agent(&gw.useragent),
            xmlpost: gw.xmlpost,
            no_http_keepalive: gw.no_http_keepalive,
            no_passwd: gw.no_passwd,
            max_redirects: gw.max_redirects,
            identity: ClientIdentity {
                device_id: gw.device_id.clone(),
                ..Default::default()
            },
            xml_sha1: gw.xml_sha1.clone(),
            ..Default::default()
        }
    }

    /// Token backend selected by the `[token]` section
    pub fn token_backend(&self) -> Result<TokenBackend, SessionError> {
        match self.token.mode {
            TokenMode::None => Ok(TokenBackend::None),
            TokenMode::Rsa => {
                error!("This version was built without RSA SecurID support");
                Err(SessionError::Unsupported(
                    "RSA SecurID token generation is not built in".to_string(),
                ))
            }
            TokenMode::Totp => {
                let Some(secret) = self.token.secret.as_deref() else {
                    error!("TOTP token mode requires a secret");
                    return Err(SessionError::Unsupported(
                        "TOTP token mode requires a secret".to_string(),
                    ));
                };
                let totp = Totp::from_secret_str(secret).map_err(|e| {
                    error!("Invalid TOTP secret: {}", e);
                    SessionError::Token(e.into())
                })?;
                Ok(TokenBackend::Totp(totp))
            }
        }
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Start URL
    #[serde(default)]
    pub url: Option<String>,

    /// User agent base; the version is appended
    #[serde(default = "default_useragent")]
    pub useragent: String,

    /// Structured (XML) request bodies
    #[serde(default = "default_true")]
    pub xmlpost: bool,

    /// Reconnect for every request
    #[serde(default)]
    pub no_http_keepalive: bool,

    /// Remembered auth group
    #[serde(default)]
    pub authgroup: Option<String>,

    /// Fail instead of prompting
    #[serde(default)]
    pub no_passwd: bool,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    #[serde(default = "default_device")]
    pub device_id: String,

    /// SHA-1 of the last downloaded gateway config
    #[serde(default)]
    pub xml_sha1: Option<String>,

    /// Where a downloaded gateway config is written
    #[serde(default)]
    pub config_out: Option<PathBuf>,
}

fn default_useragent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_redirects() -> usize {
    DEFAULT_MAX_REDIRECTS
}

fn default_device() -> String {
    default_device_id().to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            useragent: default_useragent(),
            xmlpost: default_true(),
            no_http_keepalive: false,
            authgroup: None,
            no_passwd: false,
            max_redirects: default_max_redirects(),
            device_id: default_device(),
            xml_sha1: None,
            config_out: None,
        }
    }
}

/// Proxy configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    /// `http://host:port`, `socks://host:port` or `socks5://host:port`
    #[serde(default)]
    pub url: Option<String>,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// PEM bundle of trusted CAs; the webpki roots otherwise
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TokenMode {
    #[default]
    None,
    Totp,
    Rsa,
}

/// Token configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenConfig {
    #[serde(default)]
    pub mode: TokenMode,

    /// TOTP secret: `0x`-prefixed hex or raw text
    #[serde(default)]
    pub secret: Option<String>,
}

/// CSD configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CsdConfig {
    /// Program run with the downloaded stub; CSD is refused without one
    #[serde(default)]
    pub wrapper: Option<PathBuf>,
}
