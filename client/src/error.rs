//! Session errors

use thiserror::Error;
use tollgate_crypto::TokenError;
use tollgate_protocol::{EncodeError, ParseError};
use tollgate_transport::{ConnectError, HttpError, ProxyError, UrlError};

/// Error returned by form handlers and other callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Broad category of a [`SessionError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed HTTP or markup
    Protocol,
    /// Body length did not match its framing
    Framing,
    /// Credentials rejected
    AuthDenied,
    /// Cancellation fired
    Cancelled,
    ResourceExhausted,
    /// Feature not built in or not configured
    Unsupported,
    /// The user declined a form
    UserCancelled,
    NoFormHandler,
    Handler,
    Token,
    Io,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Authentication denied: {0}")]
    AuthDenied(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Login cancelled by user")]
    UserCancelled,

    #[error("No form handler; cannot authenticate")]
    NoFormHandler,

    #[error("Form handler failed: {0}")]
    Handler(BoxError),

    #[error("Token generation failed: {0}")]
    Token(#[from] TokenError),

    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Protocol(_) | SessionError::TooManyRedirects(_) => ErrorKind::Protocol,
            SessionError::Framing(_) => ErrorKind::Framing,
            SessionError::AuthDenied(_) => ErrorKind::AuthDenied,
            SessionError::Cancelled => ErrorKind::Cancelled,
            SessionError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            SessionError::Unsupported(_) => ErrorKind::Unsupported,
            SessionError::UserCancelled => ErrorKind::UserCancelled,
            SessionError::NoFormHandler => ErrorKind::NoFormHandler,
            SessionError::Handler(_) => ErrorKind::Handler,
            SessionError::Token(_) => ErrorKind::Token,
            SessionError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<HttpError> for SessionError {
    fn from(e: HttpError) -> Self {
        if e.is_framing() {
            return SessionError::Framing(e.to_string());
        }
        if e.is_exhausted() {
            return SessionError::ResourceExhausted(e.to_string());
        }
        match e {
            HttpError::Cancelled => SessionError::Cancelled,
            HttpError::Io(e) => SessionError::Io(e),
            other => SessionError::Protocol(other.to_string()),
        }
    }
}

impl From<ProxyError> for SessionError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Cancelled => SessionError::Cancelled,
            ProxyError::Io(e) => SessionError::Io(e),
            ProxyError::UnsupportedType(_) => SessionError::Unsupported(e.to_string()),
            other => SessionError::Protocol(other.to_string()),
        }
    }
}

impl From<ConnectError> for SessionError {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::Cancelled => SessionError::Cancelled,
            ConnectError::Proxy(e) => e.into(),
            ConnectError::Io(e) => SessionError::Io(e),
            other => SessionError::Protocol(other.to_string()),
        }
    }
}

impl From<ParseError> for SessionError {
    fn from(e: ParseError) -> Self {
        SessionError::Protocol(e.to_string())
    }
}

impl From<EncodeError> for SessionError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::Xml(_) => SessionError::Protocol(e.to_string()),
            _ => SessionError::ResourceExhausted(e.to_string()),
        }
    }
}

impl From<UrlError> for SessionError {
    fn from(e: UrlError) -> Self {
        match e {
            UrlError::UnsupportedScheme(_) => SessionError::Unsupported(e.to_string()),
            _ => SessionError::Protocol(e.to_string()),
        }
    }
}
