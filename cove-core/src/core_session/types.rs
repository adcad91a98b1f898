//! Type definitions for group session orchestration

use serde::{Deserialize, Serialize};

/// Contact / member user identifier
pub type UserId = String;

/// Ciphersuite identifier as registered by the protocol
pub type CiphersuiteId = u16;

/// Default ciphersuite
///
/// 0x0001 = MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519:
/// - X25519 for ECDH
/// - AES-128-GCM for AEAD
/// - SHA-256 for hashing
/// - Ed25519 for signatures
pub const DEFAULT_CIPHERSUITE: CiphersuiteId = 0x0001;

/// Group identifier (32 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub Vec<u8>);

impl GroupId {
    /// Create a new group ID from bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Generate a random group ID
    pub fn random() -> Self {
        use rand::Rng;
        let mut bytes = vec![0u8; 32];
        rand::rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Get the bytes of the group ID
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Convert to hex string for display
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self::new)
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Vec<u8>> for GroupId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for GroupId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Member information in a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Member's user identifier
    pub user_id: UserId,
    /// Leaf index in the ratchet tree
    pub leaf_index: u32,
    /// Member's signature public key. Fingerprints key off this,
    /// never off the stable user id.
    pub signature_key: Vec<u8>,
    /// When the member joined (Unix millis)
    pub joined_at: u64,
}

/// Group metadata mirrored from the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMetadata {
    /// Group ID
    pub group_id: GroupId,
    /// Current epoch
    pub epoch: u64,
    /// Ciphersuite negotiated at creation
    pub ciphersuite: CiphersuiteId,
    /// Members in the group
    pub members: Vec<MemberInfo>,
    /// Created timestamp (Unix millis)
    pub created_at: u64,
    /// Last updated timestamp (Unix millis)
    pub updated_at: u64,
}

/// A local commit staged in the engine but not yet merged.
///
/// At most one exists per group at a time; the caller must merge or
/// discard it before initiating another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCommit {
    /// Serialized commit message for existing members
    pub commit_bytes: Vec<u8>,
    /// Serialized welcome message for new members (if any)
    pub welcome_bytes: Option<Vec<u8>>,
    /// Epoch the group will be at once merged
    pub new_epoch: u64,
}

/// Current Unix timestamp in milliseconds
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
