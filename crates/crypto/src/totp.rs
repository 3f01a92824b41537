//! HMAC-SHA1 time-based one-time codes

use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

/// Default time step (seconds)
pub const TOTP_TIME_STEP: u64 = 30;

/// Default code length
pub const TOTP_DIGITS: u32 = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TotpError {
    #[error("Empty TOTP secret")]
    EmptySecret,

    #[error("Invalid hex TOTP secret: {0}")]
    InvalidHex(String),

    #[error("Invalid key length")]
    InvalidKeyLength,
}

/// TOTP generator (SHA-1, 30 second step, 6 digits unless overridden)
#[derive(Clone)]
pub struct Totp {
    secret: Vec<u8>,
    step: u64,
    digits: u32,
}

impl std::fmt::Debug for Totp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Totp")
            .field("secret", &"<elided>")
            .field("step", &self.step)
            .field("digits", &self.digits)
            .finish()
    }
}

impl Totp {
    /// Create a generator with the default step and length
    pub fn new(secret: Vec<u8>) -> Result<Self, TotpError> {
        if secret.is_empty() {
            return Err(TotpError::EmptySecret);
        }
        Ok(Self {
            secret,
            step: TOTP_TIME_STEP,
            digits: TOTP_DIGITS,
        })
    }

    /// Parse a configured secret
    ///
    /// `0x`-prefixed input is hex, anything else is taken as raw bytes.
    pub fn from_secret_str(secret: &str) -> Result<Self, TotpError> {
        let bytes = match secret
            .strip_prefix("0x")
            .or_else(|| secret.strip_prefix("0X"))
        {
            Some(hex_str) => {
                hex::decode(hex_str).map_err(|e| TotpError::InvalidHex(e.to_string()))?
            }
            None => secret.as_bytes().to_vec(),
        };
        Self::new(bytes)
    }

    pub fn with_digits(mut self, digits: u32) -> Self {
        self.digits = digits.clamp(6, 8);
        self
    }

    /// Time step in seconds
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Code for a UNIX time in seconds
    pub fn code_at(&self, unix_time: u64) -> Result<String, TotpError> {
        let counter = unix_time / self.step;

        let mut mac =
            HmacSha1::new_from_slice(&self.secret).map_err(|_| TotpError::InvalidKeyLength)?;
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        // Dynamic truncation
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);
        let code = binary % 10u32.pow(self.digits);

        Ok(format!("{:0width$}", code, width = self.digits as usize))
    }
}
