//! SHA-1 digests for downloaded configuration

use sha1::{Digest, Sha1};

/// Lowercase hex SHA-1 of `data`
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Compare `data` against an expected hex digest, ignoring case
pub fn sha1_matches(data: &[u8], expected_hex: &str) -> bool {
    sha1_hex(data).eq_ignore_ascii_case(expected_hex.trim())
}
