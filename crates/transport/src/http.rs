//! HTTP/1.1 exchange with the gateway
//!
//! Requests are written in one piece; responses are read line by line for
//! the head and then by the framing the head selects: fixed length,
//! chunked, or read-to-close for HTTP/1.0 style replies.

use crate::cancel::CancelToken;
use crate::cookies::{CookieJar, SESSION_COOKIE};
use bytes::{Bytes, BytesMut};
use std::borrow::Cow;
use std::io::ErrorKind;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{error, info, trace, warn};

/// Longest accepted status or header line
pub const MAX_LINE_LEN: usize = 131072;

/// Largest accepted response body
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Cookie a gateway sets when it rejected the client certificate
const CERT_FAILED_COOKIE: &str = "ClientCertAuthFailed";

/// HTTP errors
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed while reading HTTP response")]
    UnexpectedEof,

    #[error("Failed to parse HTTP response '{0}'")]
    BadStatusLine(String),

    #[error("Invalid cookie offered: {0}")]
    InvalidCookie(String),

    #[error("HTTP response line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Response body has negative size ({0})")]
    NegativeLength(i64),

    #[error("Invalid Content-Length '{0}'")]
    BadContentLength(String),

    #[error("Unknown Transfer-Encoding: {0}")]
    UnknownTransferEncoding(String),

    #[error("Invalid chunk size line '{0}'")]
    BadChunkSize(String),

    #[error("Error in chunked decoding. Expected '', got: '{0}'")]
    BadChunkTrailer(String),

    #[error("Cannot receive HTTP 1.0 body without closing connection")]
    UndelimitedBody,

    #[error("Response body ended after {got} of {expected} bytes")]
    ShortBody { expected: usize, got: usize },

    #[error("Response body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

impl HttpError {
    /// Body boundaries could not be determined or were violated
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            HttpError::NegativeLength(_)
                | HttpError::BadContentLength(_)
                | HttpError::UnknownTransferEncoding(_)
                | HttpError::BadChunkSize(_)
                | HttpError::BadChunkTrailer(_)
                | HttpError::UndelimitedBody
                | HttpError::ShortBody { .. }
        )
    }

    /// A size limit was hit
    pub fn is_exhausted(&self) -> bool {
        matches!(self, HttpError::LineTooLong(_) | HttpError::BodyTooLarge(_))
    }
}

/// Request body with its content type
#[derive(Debug, Clone, Copy)]
pub struct RequestBody<'a> {
    pub content_type: &'a str,
    pub data: &'a [u8],
}

/// One outgoing request
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub method: &'a str,
    /// Path without its leading `/`
    pub path: &'a str,
    pub host: &'a str,
    pub user_agent: &'a str,
    pub body: Option<RequestBody<'a>>,
}

impl<'a> Request<'a> {
    pub fn get(host: &'a str, path: &'a str, user_agent: &'a str) -> Self {
        Self {
            method: "GET",
            path,
            host,
            user_agent,
            body: None,
        }
    }

    pub fn post(
        host: &'a str,
        path: &'a str,
        user_agent: &'a str,
        content_type: &'a str,
        data: &'a [u8],
    ) -> Self {
        Self {
            method: "POST",
            path,
            host,
            user_agent,
            body: Some(RequestBody { content_type, data }),
        }
    }
}

/// Serialise a request with the jar's cookies
pub fn build_request(req: &Request<'_>, cookies: &CookieJar) -> Vec<u8> {
    let mut head = format!("{} /{} HTTP/1.1\r\n", req.method, req.path);
    head.push_str(&format!("Host: {}\r\n", req.host));
    head.push_str(&format!("User-Agent: {}\r\n", req.user_agent));
    head.push_str("Accept: */*\r\n");
    head.push_str("Accept-Encoding: identity\r\n");
    if let Some(cookie) = cookies.header_value() {
        head.push_str(&format!("Cookie: {}\r\n", cookie));
    }
    head.push_str("X-Transcend-Version: 1\r\n");
    if let Some(body) = &req.body {
        head.push_str(&format!("Content-Type: {}\r\n", body.content_type));
        head.push_str(&format!("Content-Length: {}\r\n", body.data.len()));
    }
    head.push_str("\r\n");

    let mut out = head.into_bytes();
    if let Some(body) = &req.body {
        out.extend_from_slice(body.data);
    }
    out
}

/// How the response body was delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Fixed(usize),
    Chunked,
    UntilClose,
}

/// A fully read response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub location: Option<String>,
    pub body: Bytes,
    pub framing: BodyFraming,
    /// The connection must not be reused
    pub close: bool,
}

impl HttpResponse {
    /// First header with this name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Gateway extension headers (`X-...`)
    pub fn x_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter(|(n, _)| n.starts_with("X-"))
            .map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Read one response, folding `Set-Cookie` headers into `cookies`
pub async fn read_response<R>(
    reader: &mut R,
    cookies: &mut CookieJar,
    cancel: &CancelToken,
) -> Result<HttpResponse, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = read_line(reader, cancel).await?.ok_or_else(|| {
            error!("Error fetching HTTPS response");
            HttpError::UnexpectedEof
        })?;
        let (status, http10) = parse_status_line(&line)?;
        if status == 200 {
            trace!("Got HTTP response: {}", line);
        } else {
            info!("Got HTTP response: {}", line);
        }

        let mut close = http10;
        let mut framing = BodyFraming::UntilClose;
        let mut location = None;
        let mut headers = Vec::new();

        loop {
            let line = read_line(reader, cancel).await?.ok_or_else(|| {
                error!("Error processing HTTP response");
                HttpError::UnexpectedEof
            })?;
            if line.is_empty() {
                break;
            }

            let Some((name, value)) = line.split_once(':') else {
                warn!("Ignoring unknown HTTP response line '{}'", line);
                continue;
            };
            let value = value.strip_prefix(' ').unwrap_or(value);

            if name.eq_ignore_ascii_case("Set-Cookie") {
                store_cookie(name, value, cookies)?;
            } else {
                trace!("{}: {}", name, value);
            }

            if name.eq_ignore_ascii_case("Connection") && value.eq_ignore_ascii_case("close") {
                close = true;
            }
            if name.eq_ignore_ascii_case("Location") {
                location = Some(value.to_string());
            }
            if name.eq_ignore_ascii_case("Content-Length") {
                framing = BodyFraming::Fixed(parse_content_length(value)?);
            }
            if name.eq_ignore_ascii_case("Transfer-Encoding") {
                if value.eq_ignore_ascii_case("chunked") {
                    framing = BodyFraming::Chunked;
                } else {
                    error!("Unknown Transfer-Encoding: {}", value);
                    return Err(HttpError::UnknownTransferEncoding(value.to_string()));
                }
            }

            headers.push((name.to_string(), value.to_string()));
        }

        if status == 100 {
            continue;
        }

        trace!("HTTP body {:?}", framing);
        let body = match framing {
            BodyFraming::Fixed(len) => read_fixed(reader, len, cancel).await?,
            BodyFraming::Chunked => read_chunked(reader, cancel).await?,
            BodyFraming::UntilClose => {
                if !close {
                    error!("Cannot receive HTTP 1.0 body without closing connection");
                    return Err(HttpError::UndelimitedBody);
                }
                read_until_close(reader, cancel).await?
            }
        };

        return Ok(HttpResponse {
            status,
            headers,
            location,
            body,
            framing,
            close,
        });
    }
}

/// A buffered stream carrying request/response exchanges
pub struct HttpConnection<S> {
    stream: BufReader<S>,
}

impl<S> HttpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Write raw bytes and flush
    pub async fn send(&mut self, data: &[u8], cancel: &CancelToken) -> Result<(), HttpError> {
        let stream = &mut self.stream;
        cancel
            .run(async move {
                stream.write_all(data).await?;
                stream.flush().await
            })
            .await
            .ok_or(HttpError::Cancelled)?
            .map_err(|e| {
                error!("Failed to send HTTP request: {}", e);
                HttpError::Io(e)
            })
    }

    /// Send a request and read its response
    pub async fn exchange(
        &mut self,
        req: &Request<'_>,
        cookies: &mut CookieJar,
        cancel: &CancelToken,
    ) -> Result<HttpResponse, HttpError> {
        let bytes = build_request(req, cookies);
        trace!("{} /{}", req.method, req.path);
        self.send(&bytes, cancel).await?;
        read_response(&mut self.stream, cookies, cancel).await
    }

    /// Close the write side; errors are not interesting at this point
    pub async fn shutdown(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            trace!("Error shutting down connection: {}", e);
        }
    }
}

fn parse_status_line(line: &str) -> Result<(u16, bool), HttpError> {
    let bad = || {
        error!("Failed to parse HTTP response '{}'", line);
        HttpError::BadStatusLine(line.to_string())
    };

    let rest = line.strip_prefix("HTTP/").ok_or_else(bad)?;
    let (version, rest) = rest.split_once(' ').ok_or_else(bad)?;
    let (major, minor) = version.split_once('.').ok_or_else(bad)?;
    if major.is_empty()
        || minor.is_empty()
        || !major.bytes().chain(minor.bytes()).all(|b| b.is_ascii_digit())
    {
        return Err(bad());
    }

    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let status: u16 = digits.parse().map_err(|_| bad())?;
    if status == 0 {
        return Err(bad());
    }

    Ok((status, version == "1.0"))
}

fn parse_content_length(value: &str) -> Result<usize, HttpError> {
    let len: i64 = value.trim().parse().map_err(|_| {
        error!("Invalid Content-Length '{}'", value);
        HttpError::BadContentLength(value.to_string())
    })?;
    if len < 0 {
        error!("Response body has negative size ({})", len);
        return Err(HttpError::NegativeLength(len));
    }
    let len = len as usize;
    if len > MAX_BODY_LEN {
        error!("Response body of {} bytes is too large", len);
        return Err(HttpError::BodyTooLarge(MAX_BODY_LEN));
    }
    Ok(len)
}

fn store_cookie(header: &str, value: &str, cookies: &mut CookieJar) -> Result<(), HttpError> {
    let (cookie, attrs) = match value.split_once(';') {
        Some((cookie, attrs)) => (cookie, Some(attrs)),
        None => (value, None),
    };
    let Some((name, val)) = cookie.split_once('=') else {
        error!("Invalid cookie offered: {}", value);
        return Err(HttpError::InvalidCookie(value.to_string()));
    };

    let shown = if name == SESSION_COOKIE && !val.is_empty() {
        "<elided>"
    } else {
        val
    };
    match attrs {
        Some(attrs) => trace!("{}: {}={};{}", header, name, shown, attrs),
        None => trace!("{}: {}={}", header, name, shown),
    }

    if name == CERT_FAILED_COOKIE {
        error!("SSL certificate authentication failed");
    }

    cookies.set(name, val);
    Ok(())
}

/// Read a line without its terminator; `None` at end of stream
async fn read_line<R>(reader: &mut R, cancel: &CancelToken) -> Result<Option<String>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut limited = (&mut *reader).take(MAX_LINE_LEN as u64 + 1);
    let n = cancel
        .run(limited.read_until(b'\n', &mut buf))
        .await
        .ok_or(HttpError::Cancelled)??;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_LINE_LEN {
        error!("HTTP response line exceeds {} bytes", MAX_LINE_LEN);
        return Err(HttpError::LineTooLong(MAX_LINE_LEN));
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

async fn read_fixed<R>(reader: &mut R, len: usize, cancel: &CancelToken) -> Result<Bytes, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = BytesMut::zeroed(len);
    read_exact_into(reader, &mut body, cancel).await?;
    Ok(body.freeze())
}

async fn read_exact_into<R>(
    reader: &mut R,
    buf: &mut [u8],
    cancel: &CancelToken,
) -> Result<(), HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut done = 0;
    while done < buf.len() {
        let n = cancel
            .run(reader.read(&mut buf[done..]))
            .await
            .ok_or(HttpError::Cancelled)?
            .map_err(|e| {
                error!("Error reading HTTP response body");
                HttpError::Io(e)
            })?;
        if n == 0 {
            error!("Error reading HTTP response body");
            return Err(HttpError::ShortBody {
                expected: buf.len(),
                got: done,
            });
        }
        done += n;
    }
    Ok(())
}

async fn read_chunked<R>(reader: &mut R, cancel: &CancelToken) -> Result<Bytes, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = BytesMut::new();
    loop {
        let line = read_line(reader, cancel).await?.ok_or_else(|| {
            error!("Error fetching chunk header");
            HttpError::UnexpectedEof
        })?;
        let size_str = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| {
            error!("Invalid chunk size line '{}'", line);
            HttpError::BadChunkSize(line.clone())
        })?;

        if size > 0 {
            if size > MAX_BODY_LEN - body.len() {
                error!("Response body exceeds {} bytes", MAX_BODY_LEN);
                return Err(HttpError::BodyTooLarge(MAX_BODY_LEN));
            }
            let start = body.len();
            body.resize(start + size, 0);
            read_exact_into(reader, &mut body[start..], cancel).await?;
        }

        let trailer = read_line(reader, cancel).await?.ok_or_else(|| {
            error!("Error fetching HTTP response body");
            HttpError::UnexpectedEof
        })?;
        if !trailer.is_empty() {
            error!("Error in chunked decoding. Expected '', got: '{}'", trailer);
            return Err(HttpError::BadChunkTrailer(trailer));
        }

        if size == 0 {
            return Ok(body.freeze());
        }
    }
}

async fn read_until_close<R>(reader: &mut R, cancel: &CancelToken) -> Result<Bytes, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let mut limited = (&mut *reader).take(MAX_BODY_LEN as u64 + 1);
    cancel
        .run(limited.read_to_end(&mut body))
        .await
        .ok_or(HttpError::Cancelled)?
        .or_else(|e| match e.kind() {
            // Peers that drop TLS without close_notify
            ErrorKind::UnexpectedEof => Ok(body.len()),
            _ => Err(e),
        })?;
    if body.len() > MAX_BODY_LEN {
        error!("Response body exceeds {} bytes", MAX_BODY_LEN);
        return Err(HttpError::BodyTooLarge(MAX_BODY_LEN));
    }
    Ok(Bytes::from(body))
}
