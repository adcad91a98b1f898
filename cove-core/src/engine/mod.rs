//! Crypto engine boundary
//!
//! The session layer never touches key schedules or tree math directly;
//! it drives an opaque engine through this capability trait. Production
//! deployments bind a real group-key-agreement implementation behind it
//! (FFI, RPC, or in-process); tests use the deterministic in-memory
//! reference engine.
//!
//! Engine calls mutate engine-internal epoch state. Callers are
//! responsible for per-group serialization of mutating calls.

mod memory;

pub use memory::InMemoryEngine;

use crate::core_session::errors::SessionResult;
use crate::core_session::types::{CiphersuiteId, GroupId, UserId};
use async_trait::async_trait;

/// Member snapshot as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMember {
    /// Member's user identifier
    pub user_id: UserId,
    /// Leaf index in the ratchet tree
    pub leaf_index: u32,
    /// Member's signature public key
    pub signature_key: Vec<u8>,
}

/// Group snapshot as reported by the engine
#[derive(Debug, Clone)]
pub struct EngineGroupInfo {
    pub group_id: GroupId,
    pub epoch: u64,
    pub ciphersuite: CiphersuiteId,
    pub members: Vec<EngineMember>,
    /// Own leaf index in this group
    pub own_leaf_index: u32,
}

/// Inspection result of a welcome message. Produced without merging
/// any key material.
#[derive(Debug, Clone)]
pub struct WelcomePreview {
    pub group_id: GroupId,
    pub epoch: u64,
    pub ciphersuite: CiphersuiteId,
    /// Member who issued the welcome
    pub sender: EngineMember,
    /// Membership snapshot at staging time
    pub members: Vec<EngineMember>,
}

/// Result of staging a local commit
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Serialized commit message for existing members
    pub commit_bytes: Vec<u8>,
    /// Serialized welcome message for new members (if any)
    pub welcome_bytes: Option<Vec<u8>>,
    /// Epoch the group will be at once the commit is merged
    pub new_epoch: u64,
}

/// A decrypted application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationMessage {
    pub sender: UserId,
    pub plaintext: Vec<u8>,
}

/// Capability interface over the opaque crypto engine
///
/// Commit-producing operations (`add_members`, `remove_members`,
/// `self_update`, `commit_pending_proposals`) stage a pending commit
/// inside the engine; the epoch only advances when
/// `merge_pending_commit` succeeds. At most one pending commit exists
/// per group.
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    /// Own user identity
    fn own_identity(&self) -> UserId;

    /// Own signature public key. Fingerprints derived from this are
    /// directly comparable with fingerprints extracted from peers'
    /// messages.
    fn own_signature_key(&self) -> Vec<u8>;

    /// Generate a key package other members can use to add us
    async fn generate_key_package(&self) -> SessionResult<Vec<u8>>;

    /// Create a new group with self as the only member
    async fn create_group(
        &self,
        group_id: &GroupId,
        ciphersuite: CiphersuiteId,
    ) -> SessionResult<EngineGroupInfo>;

    /// Inspect a welcome without merging key material. Fails with
    /// `InvalidInput` on unparseable bytes. Performs no group mutation.
    async fn parse_welcome(
        &self,
        welcome: &[u8],
        ratchet_tree: Option<&[u8]>,
    ) -> SessionResult<WelcomePreview>;

    /// Merge a welcome into a live group
    async fn join_from_welcome(
        &self,
        welcome: &[u8],
        ratchet_tree: Option<&[u8]>,
    ) -> SessionResult<EngineGroupInfo>;

    /// Join an existing group via external commit. Returns the joined
    /// group snapshot and the commit bytes to broadcast to members.
    async fn join_by_external_commit(
        &self,
        group_info: &[u8],
        aad: &[u8],
    ) -> SessionResult<(EngineGroupInfo, Vec<u8>)>;

    /// Current snapshot of a group
    async fn group_info(&self, group_id: &GroupId) -> SessionResult<EngineGroupInfo>;

    /// Export the public group info an external joiner needs for
    /// `join_by_external_commit`
    async fn export_group_info(&self, group_id: &GroupId) -> SessionResult<Vec<u8>>;

    /// Set additional authenticated data bound to the next commit
    async fn set_aad(&self, group_id: &GroupId, aad: &[u8]) -> SessionResult<()>;

    /// Stage a commit adding the given key packages
    async fn add_members(
        &self,
        group_id: &GroupId,
        key_packages: &[Vec<u8>],
    ) -> SessionResult<CommitOutcome>;

    /// Stage a commit removing the given leaves
    async fn remove_members(
        &self,
        group_id: &GroupId,
        leaf_indices: &[u32],
    ) -> SessionResult<CommitOutcome>;

    /// Stage a commit rotating own leaf key material (post-compromise
    /// security)
    async fn self_update(&self, group_id: &GroupId) -> SessionResult<CommitOutcome>;

    /// Create and locally queue an add proposal; returns the proposal
    /// bytes for transport
    async fn propose_add(&self, group_id: &GroupId, key_package: &[u8]) -> SessionResult<Vec<u8>>;

    /// Create and locally queue a remove proposal
    async fn propose_remove(&self, group_id: &GroupId, leaf_index: u32) -> SessionResult<Vec<u8>>;

    /// Create and locally queue a proposal removing own leaf. A member
    /// cannot commit its own removal; another member must commit this.
    async fn propose_self_remove(&self, group_id: &GroupId) -> SessionResult<Vec<u8>>;

    /// Create and locally queue an external-PSK proposal
    async fn propose_external_psk(
        &self,
        group_id: &GroupId,
        psk_id: &[u8],
    ) -> SessionResult<Vec<u8>>;

    /// Store an external PSK for later proposals
    async fn store_external_psk(&self, psk_id: &[u8], psk: &[u8]) -> SessionResult<()>;

    /// Stage a commit over all queued proposals
    async fn commit_pending_proposals(&self, group_id: &GroupId) -> SessionResult<CommitOutcome>;

    /// Merge the staged pending commit, advancing the epoch
    async fn merge_pending_commit(&self, group_id: &GroupId) -> SessionResult<EngineGroupInfo>;

    /// Drop the staged pending commit without applying it
    async fn clear_pending_commit(&self, group_id: &GroupId) -> SessionResult<()>;

    /// Apply a remote commit. Fails with `EpochMismatch` when the commit
    /// references a stale or future epoch. Returns the new epoch.
    async fn process_commit(&self, group_id: &GroupId, commit: &[u8]) -> SessionResult<u64>;

    /// Queue a remote proposal
    async fn process_proposal(&self, group_id: &GroupId, proposal: &[u8]) -> SessionResult<()>;

    /// Encrypt an application message for the group
    async fn encrypt_application(
        &self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> SessionResult<Vec<u8>>;

    /// Decrypt an inbound application message
    async fn decrypt_application(
        &self,
        group_id: &GroupId,
        ciphertext: &[u8],
    ) -> SessionResult<ApplicationMessage>;

    /// Export group state as an opaque blob for persistence
    async fn export_group_state(&self, group_id: &GroupId) -> SessionResult<Vec<u8>>;

    /// Restore a group from an exported blob
    async fn import_group_state(&self, blob: &[u8]) -> SessionResult<EngineGroupInfo>;

    /// Drop all engine state for a group
    async fn delete_group(&self, group_id: &GroupId) -> SessionResult<()>;
}
