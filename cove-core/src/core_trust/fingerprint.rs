//! Signature-key fingerprints

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of a signature public key
///
/// Stable for the same key material regardless of how the key was
/// obtained (own engine identity or extracted from a peer's message),
/// so fingerprints from both paths are directly comparable for
/// out-of-band verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The hex digest, suitable for display and out-of-band comparison
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the fingerprint of a signature public key
pub fn fingerprint_of(signature_key: &[u8]) -> Fingerprint {
    let digest = Sha256::digest(signature_key);
    Fingerprint(hex::encode(digest))
}
