//! Proxy tunnel negotiation
//!
//! Runs on the plain TCP stream before the TLS handshake: either an HTTP
//! `CONNECT` or a SOCKS5 no-auth `CONNECT` by domain name.

use crate::cancel::CancelToken;
use crate::url::{UrlError, parse_url};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info};

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply strings by reply code
const SOCKS_ERRORS: [&str; 9] = [
    "request granted",
    "general failure",
    "connection not allowed by ruleset",
    "network unreachable",
    "host unreachable",
    "connection refused by destination host",
    "TTL expired",
    "command not supported / protocol error",
    "address type not supported",
];

/// Longest proxy response line
const MAX_PROXY_LINE: usize = 4096;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Url(#[from] UrlError),

    #[error("Only http or socks(5) proxies supported")]
    UnsupportedType(String),

    #[error("Failed to parse proxy response '{0}'")]
    BadResponse(String),

    #[error("Proxy CONNECT request failed: {0}")]
    ConnectFailed(String),

    #[error("SOCKS proxy error {code:02x}: {message}")]
    Socks { code: u8, message: &'static str },

    #[error("Unexpected response from SOCKS proxy: {0:02x} {1:02x}")]
    UnexpectedSocksReply(u8, u8),

    #[error("Unexpected address type {0:02x} in SOCKS connect response")]
    UnexpectedAddressType(u8),

    #[error("Hostname too long for SOCKS request")]
    HostTooLong,
}

/// Message for a SOCKS5 reply code
pub fn socks_error_str(code: u8) -> &'static str {
    SOCKS_ERRORS
        .get(code as usize)
        .copied()
        .unwrap_or("unknown error")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks5,
}

/// Where the proxy lives and which handshake it speaks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    /// Parse `http://host:port`, `socks://`, `socks5://` or a bare `host:port`
    pub fn from_url(url: &str) -> Result<Self, ProxyError> {
        let parsed = parse_url(url, Some(80))?;
        let kind = match parsed.scheme.as_deref() {
            None | Some("http") => ProxyKind::Http,
            Some("socks") | Some("socks5") => ProxyKind::Socks5,
            Some(other) => {
                error!("Only http or socks(5) proxies supported");
                return Err(ProxyError::UnsupportedType(other.to_string()));
            }
        };
        Ok(Self {
            kind,
            host: parsed.host,
            port: parsed.port,
        })
    }
}

/// Negotiate a tunnel to `host:port` through the proxy on `stream`
pub async fn negotiate_proxy<S>(
    stream: &mut S,
    kind: ProxyKind,
    host: &str,
    port: u16,
    user_agent: &str,
    cancel: &CancelToken,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match kind {
        ProxyKind::Http => http_connect(stream, host, port, user_agent, cancel).await,
        ProxyKind::Socks5 => socks5_connect(stream, host, port, cancel).await,
    }
}

async fn http_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    user_agent: &str,
    cancel: &CancelToken,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\n\
         Host: {host}\r\n\
         User-Agent: {user_agent}\r\n\
         Proxy-Connection: keep-alive\r\n\
         Connection: keep-alive\r\n\
         Accept-Encoding: identity\r\n\
         \r\n"
    );

    info!("Requesting HTTP proxy connection to {}:{}", host, port);
    write_all(stream, request.as_bytes(), cancel)
        .await
        .inspect_err(|e| error!("Sending proxy request failed: {}", e))?;

    let line = read_line(stream, cancel)
        .await
        .inspect_err(|_| error!("Error fetching proxy response"))?;

    let status = parse_proxy_status(&line).ok_or_else(|| {
        error!("Failed to parse proxy response '{}'", line);
        ProxyError::BadResponse(line.clone())
    })?;
    if status != 200 {
        error!("Proxy CONNECT request failed: {}", line);
        return Err(ProxyError::ConnectFailed(line));
    }

    loop {
        let line = read_line(stream, cancel)
            .await
            .inspect_err(|_| error!("Failed to read proxy response"))?;
        if line.is_empty() {
            return Ok(());
        }
        error!("Unexpected continuation line after CONNECT response: '{}'", line);
    }
}

fn parse_proxy_status(line: &str) -> Option<u16> {
    let rest = line
        .strip_prefix("HTTP/1.0 ")
        .or_else(|| line.strip_prefix("HTTP/1.1 "))?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok().filter(|&status| status != 0)
}

async fn socks5_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    cancel: &CancelToken,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_all(stream, &[SOCKS5_VERSION, 1, AUTH_NO_AUTH], cancel)
        .await
        .inspect_err(|e| error!("Error writing auth request to SOCKS proxy: {}", e))?;

    let mut reply = [0u8; 2];
    read_exact(stream, &mut reply, cancel)
        .await
        .inspect_err(|e| error!("Error reading auth response from SOCKS proxy: {}", e))?;
    if reply[0] != SOCKS5_VERSION {
        error!(
            "Unexpected auth response from SOCKS proxy: {:02x} {:02x}",
            reply[0], reply[1]
        );
        return Err(ProxyError::UnexpectedSocksReply(reply[0], reply[1]));
    }
    if reply[1] != 0 {
        return Err(socks_failure(reply[1]));
    }

    info!("Requesting SOCKS proxy connection to {}:{}", host, port);

    let name = host.as_bytes();
    let name_len = u8::try_from(name.len()).map_err(|_| ProxyError::HostTooLong)?;
    let mut request = Vec::with_capacity(name.len() + 7);
    request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0, ATYP_DOMAIN, name_len]);
    request.extend_from_slice(name);
    request.extend_from_slice(&port.to_be_bytes());

    write_all(stream, &request, cancel)
        .await
        .inspect_err(|e| error!("Error writing connect request to SOCKS proxy: {}", e))?;

    // Up to and including the first byte of the bound address
    let mut head = [0u8; 5];
    read_exact(stream, &mut head, cancel)
        .await
        .inspect_err(|e| error!("Error reading connect response from SOCKS proxy: {}", e))?;
    if head[0] != SOCKS5_VERSION {
        error!(
            "Unexpected connect response from SOCKS proxy: {:02x} {:02x}...",
            head[0], head[1]
        );
        return Err(ProxyError::UnexpectedSocksReply(head[0], head[1]));
    }
    if head[1] != 0 {
        return Err(socks_failure(head[1]));
    }

    // Rest of the bound address plus the two port bytes
    let remaining = match head[3] {
        ATYP_IPV4 => 5,
        ATYP_DOMAIN => head[4] as usize + 2,
        ATYP_IPV6 => 17,
        other => {
            error!("Unexpected address type {:02x} in SOCKS connect response", other);
            return Err(ProxyError::UnexpectedAddressType(other));
        }
    };

    let mut bound = vec![0u8; remaining];
    read_exact(stream, &mut bound, cancel)
        .await
        .inspect_err(|e| error!("Error reading connect response from SOCKS proxy: {}", e))?;
    Ok(())
}

fn socks_failure(code: u8) -> ProxyError {
    if (code as usize) < SOCKS_ERRORS.len() {
        error!("SOCKS proxy error {:02x}: {}", code, socks_error_str(code));
    } else {
        error!("SOCKS proxy error {:02x}", code);
    }
    ProxyError::Socks {
        code,
        message: socks_error_str(code),
    }
}

async fn write_all<S>(stream: &mut S, data: &[u8], cancel: &CancelToken) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    cancel
        .run(async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await
        .ok_or(ProxyError::Cancelled)?
        .map_err(ProxyError::Io)
}

async fn read_exact<S>(stream: &mut S, buf: &mut [u8], cancel: &CancelToken) -> Result<(), ProxyError>
where
    S: AsyncRead + Unpin,
{
    cancel
        .run(stream.read_exact(buf))
        .await
        .ok_or(ProxyError::Cancelled)?
        .map(|_| ())
        .map_err(ProxyError::Io)
}

/// Read one line a byte at a time so nothing past it is consumed
async fn read_line<S>(stream: &mut S, cancel: &CancelToken) -> Result<String, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = cancel
            .run(stream.read_u8())
            .await
            .ok_or(ProxyError::Cancelled)??;
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_PROXY_LINE {
            return Err(ProxyError::BadResponse(
                String::from_utf8_lossy(&line).into_owned(),
            ));
        }
        line.push(byte);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
