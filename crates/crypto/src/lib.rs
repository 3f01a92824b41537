//! Tollgate Crypto - Token codes and digests
//!
//! This crate provides:
//! - `TokenGenerator`: retry-bounded policy for filling token fields
//! - `Totp`: HMAC-SHA1 time-based one-time codes
//! - `SeedEngine`: seam for hardware-seed token engines
//! - SHA-1 hex digests for downloaded configuration checks

mod digest;
mod seed;
mod token;
mod totp;

pub use digest::*;
pub use seed::*;
pub use token::*;
pub use totp::*;
