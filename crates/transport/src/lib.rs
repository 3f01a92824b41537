//! Tollgate Transport - HTTP over TLS to the gateway
//!
//! This crate provides:
//! - Cookie jar with replace-by-name semantics
//! - Cancellation handle raced against every read and write
//! - URL splitting for gateway and proxy addresses
//! - HTTP/1.1 request builder and response reader (fixed, chunked, close)
//! - HTTP CONNECT and SOCKS5 proxy negotiation
//! - TLS connector over tokio-rustls

mod cancel;
mod connector;
mod cookies;
mod http;
mod proxy;
mod url;

pub use cancel::*;
pub use connector::*;
pub use cookies::*;
pub use http::*;
pub use proxy::*;
pub use url::*;
