//! SHA-256 helpers used for header fingerprints

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the UTF-8 bytes of `text`
pub fn hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}
