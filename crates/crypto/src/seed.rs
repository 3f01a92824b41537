//! Hardware-seed token engines
//!
//! The seed format and code algorithm live outside this crate; an engine is
//! plugged into `TokenBackend::HardwareSeed` and driven through this trait.

use thiserror::Error;

/// Time step of hardware-seed codes (seconds)
pub const SEED_TIME_STEP: u64 = 60;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeedError {
    /// Wrong device ID or password; the caller may ask again
    #[error("Incorrect device ID or password")]
    BadCredentials,

    #[error("Invalid PIN format")]
    BadPin,

    /// Engine failure that retrying will not fix
    #[error("General failure in token engine: {0}")]
    Io(String),
}

/// A seed-based token engine
pub trait SeedEngine: Send {
    fn devid_required(&self) -> bool;
    fn pass_required(&self) -> bool;
    fn pin_required(&self) -> bool;

    /// Unlock the seed with the user's password and device ID
    fn decrypt_seed(&mut self, pass: Option<&str>, devid: Option<&str>) -> Result<(), SeedError>;

    /// Validate a PIN's format
    fn check_pin(&self, pin: &str) -> Result<(), SeedError>;

    /// Code for a UNIX time in seconds
    fn compute_tokencode(&self, unix_time: u64, pin: Option<&str>) -> Result<String, SeedError>;
}
