//! Deterministic in-process reference engine
//!
//! Implements the `CryptoEngine` contract without real cryptography:
//! epochs, pending-commit staging, proposal queues and membership
//! tracking behave like the protocol, while payloads are plain
//! bincode structs. Used by tests and local development; production
//! binds a real engine behind the same trait.

use super::{
    ApplicationMessage, CommitOutcome, CryptoEngine, EngineGroupInfo, EngineMember,
    WelcomePreview,
};
use crate::core_session::errors::{SessionError, SessionResult};
use crate::core_session::types::{CiphersuiteId, GroupId, UserId};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

// Wire tags keep payload kinds distinguishable and make garbage bytes
// fail parsing deterministically.
const TAG_KEY_PACKAGE: u8 = 1;
const TAG_WELCOME: u8 = 2;
const TAG_COMMIT: u8 = 3;
const TAG_PROPOSAL: u8 = 4;
const TAG_GROUP_INFO: u8 = 5;
const TAG_CIPHERTEXT: u8 = 6;
const TAG_GROUP_STATE: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MemberPayload {
    user_id: String,
    leaf_index: u32,
    signature_key: Vec<u8>,
}

impl MemberPayload {
    fn to_member(&self) -> EngineMember {
        EngineMember {
            user_id: self.user_id.clone(),
            leaf_index: self.leaf_index,
            signature_key: self.signature_key.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyPackagePayload {
    tag: u8,
    user_id: String,
    signature_key: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WelcomePayload {
    tag: u8,
    group_id: Vec<u8>,
    epoch: u64,
    ciphersuite: CiphersuiteId,
    sender: MemberPayload,
    members: Vec<MemberPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ProposalOp {
    Add(MemberPayload),
    Remove(u32),
    /// Leaf key-material rotation. The rotated secrets are abstracted
    /// away here; the signature key (and thus the fingerprint) is
    /// untouched, matching real self-updates.
    Update(u32),
    ExternalPsk(Vec<u8>),
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitPayload {
    tag: u8,
    group_id: Vec<u8>,
    from_epoch: u64,
    committer: String,
    ops: Vec<ProposalOp>,
    aad: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProposalPayload {
    tag: u8,
    group_id: Vec<u8>,
    epoch: u64,
    proposer: String,
    op: ProposalOp,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupInfoPayload {
    tag: u8,
    group_id: Vec<u8>,
    epoch: u64,
    ciphersuite: CiphersuiteId,
    members: Vec<MemberPayload>,
    next_leaf: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct CiphertextPayload {
    tag: u8,
    group_id: Vec<u8>,
    epoch: u64,
    sender: String,
    body: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupStatePayload {
    tag: u8,
    group_id: Vec<u8>,
    epoch: u64,
    ciphersuite: CiphersuiteId,
    members: Vec<MemberPayload>,
    own_leaf: u32,
    next_leaf: u32,
}

struct StagedCommit {
    ops: Vec<ProposalOp>,
    outcome: CommitOutcome,
    /// Ops drained from the proposal queue; restored on discard
    from_queue: bool,
}

struct EngineGroup {
    group_id: GroupId,
    epoch: u64,
    ciphersuite: CiphersuiteId,
    members: Vec<MemberPayload>,
    own_leaf: u32,
    next_leaf: u32,
    pending: Option<StagedCommit>,
    queued: Vec<ProposalOp>,
    aad: Vec<u8>,
}

impl EngineGroup {
    fn info(&self) -> EngineGroupInfo {
        EngineGroupInfo {
            group_id: self.group_id.clone(),
            epoch: self.epoch,
            ciphersuite: self.ciphersuite,
            members: self.members.iter().map(MemberPayload::to_member).collect(),
            own_leaf_index: self.own_leaf,
        }
    }

    /// Re-resolve own leaf after membership changes (fork recovery
    /// re-adds self at a new leaf)
    fn refresh_own_leaf(&mut self, identity: &str) {
        if let Some(member) = self.members.iter().find(|m| m.user_id == identity) {
            self.own_leaf = member.leaf_index;
        }
    }

    fn apply_ops(&mut self, ops: &[ProposalOp], psks: &HashMap<Vec<u8>, Vec<u8>>) -> SessionResult<()> {
        for op in ops {
            match op {
                ProposalOp::Add(member) => {
                    if self.members.iter().any(|m| m.leaf_index == member.leaf_index) {
                        return Err(SessionError::Engine(format!(
                            "leaf {} already occupied",
                            member.leaf_index
                        )));
                    }
                    self.next_leaf = self.next_leaf.max(member.leaf_index + 1);
                    self.members.push(member.clone());
                }
                ProposalOp::Remove(leaf_index) => {
                    self.members.retain(|m| m.leaf_index != *leaf_index);
                }
                ProposalOp::Update(leaf_index) => {
                    if !self.members.iter().any(|m| m.leaf_index == *leaf_index) {
                        return Err(SessionError::Engine(format!(
                            "no member at leaf {}",
                            leaf_index
                        )));
                    }
                }
                ProposalOp::ExternalPsk(psk_id) => {
                    if !psks.contains_key(psk_id) {
                        return Err(SessionError::Engine(format!(
                            "unknown external PSK: {}",
                            hex::encode(psk_id)
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct EngineState {
    groups: HashMap<GroupId, EngineGroup>,
    psks: HashMap<Vec<u8>, Vec<u8>>,
}

/// In-memory reference engine
pub struct InMemoryEngine {
    identity: UserId,
    signature_key: Vec<u8>,
    state: RwLock<EngineState>,
}

impl InMemoryEngine {
    /// Create an engine for a local identity with a fresh signature key
    pub fn new(identity: impl Into<UserId>) -> Self {
        Self::with_signature_key(identity, random_key())
    }

    /// Create an engine with an explicit signature key, e.g. to model
    /// a reinstall that did or did not preserve key material
    pub fn with_signature_key(identity: impl Into<UserId>, signature_key: Vec<u8>) -> Self {
        Self {
            identity: identity.into(),
            signature_key,
            state: RwLock::new(EngineState::default()),
        }
    }

    fn own_member(&self, leaf_index: u32) -> MemberPayload {
        MemberPayload {
            user_id: self.identity.clone(),
            leaf_index,
            signature_key: self.signature_key.clone(),
        }
    }

    fn stage_commit(
        &self,
        group: &mut EngineGroup,
        ops: Vec<ProposalOp>,
        from_queue: bool,
        with_welcome: bool,
    ) -> SessionResult<CommitOutcome> {
        if group.pending.is_some() {
            return Err(SessionError::PendingCommitConflict(group.group_id.to_hex()));
        }

        let new_epoch = group.epoch + 1;
        let commit_bytes = encode(&CommitPayload {
            tag: TAG_COMMIT,
            group_id: group.group_id.as_bytes().to_vec(),
            from_epoch: group.epoch,
            committer: self.identity.clone(),
            ops: ops.clone(),
            aad: std::mem::take(&mut group.aad),
        })?;

        let welcome_bytes = if with_welcome {
            // Post-merge membership snapshot: existing members plus adds,
            // minus removals staged in the same commit
            let mut members = group.members.clone();
            for op in &ops {
                match op {
                    ProposalOp::Add(member) => members.push(member.clone()),
                    ProposalOp::Remove(leaf) => members.retain(|m| m.leaf_index != *leaf),
                    _ => {}
                }
            }
            Some(encode(&WelcomePayload {
                tag: TAG_WELCOME,
                group_id: group.group_id.as_bytes().to_vec(),
                epoch: new_epoch,
                ciphersuite: group.ciphersuite,
                sender: self.own_member(group.own_leaf),
                members,
            })?)
        } else {
            None
        };

        let outcome = CommitOutcome {
            commit_bytes,
            welcome_bytes,
            new_epoch,
        };
        group.pending = Some(StagedCommit {
            ops,
            outcome: outcome.clone(),
            from_queue,
        });
        Ok(outcome)
    }
}

#[async_trait]
impl CryptoEngine for InMemoryEngine {
    fn own_identity(&self) -> UserId {
        self.identity.clone()
    }

    fn own_signature_key(&self) -> Vec<u8> {
        self.signature_key.clone()
    }

    async fn generate_key_package(&self) -> SessionResult<Vec<u8>> {
        encode(&KeyPackagePayload {
            tag: TAG_KEY_PACKAGE,
            user_id: self.identity.clone(),
            signature_key: self.signature_key.clone(),
        })
    }

    async fn create_group(
        &self,
        group_id: &GroupId,
        ciphersuite: CiphersuiteId,
    ) -> SessionResult<EngineGroupInfo> {
        let mut state = self.state.write().await;
        if state.groups.contains_key(group_id) {
            return Err(SessionError::Engine(format!(
                "group already exists: {}",
                group_id
            )));
        }

        let group = EngineGroup {
            group_id: group_id.clone(),
            epoch: 0,
            ciphersuite,
            members: vec![self.own_member(0)],
            own_leaf: 0,
            next_leaf: 1,
            pending: None,
            queued: Vec::new(),
            aad: Vec::new(),
        };
        let info = group.info();
        state.groups.insert(group_id.clone(), group);
        debug!("Created engine group {}", group_id);
        Ok(info)
    }

    async fn parse_welcome(
        &self,
        welcome: &[u8],
        _ratchet_tree: Option<&[u8]>,
    ) -> SessionResult<WelcomePreview> {
        let payload: WelcomePayload = decode(welcome, TAG_WELCOME, "welcome")?;
        Ok(WelcomePreview {
            group_id: GroupId::new(payload.group_id),
            epoch: payload.epoch,
            ciphersuite: payload.ciphersuite,
            sender: payload.sender.to_member(),
            members: payload.members.iter().map(MemberPayload::to_member).collect(),
        })
    }

    async fn join_from_welcome(
        &self,
        welcome: &[u8],
        _ratchet_tree: Option<&[u8]>,
    ) -> SessionResult<EngineGroupInfo> {
        let payload: WelcomePayload = decode(welcome, TAG_WELCOME, "welcome")?;
        let group_id = GroupId::new(payload.group_id);

        let mut state = self.state.write().await;
        if state.groups.contains_key(&group_id) {
            return Err(SessionError::Engine(format!(
                "group already exists: {}",
                group_id
            )));
        }

        let own_leaf = payload
            .members
            .iter()
            .find(|m| m.user_id == self.identity)
            .map(|m| m.leaf_index)
            .ok_or_else(|| {
                SessionError::InvalidInput("welcome does not admit this identity".to_string())
            })?;
        let next_leaf = payload
            .members
            .iter()
            .map(|m| m.leaf_index + 1)
            .max()
            .unwrap_or(1);

        let group = EngineGroup {
            group_id: group_id.clone(),
            epoch: payload.epoch,
            ciphersuite: payload.ciphersuite,
            members: payload.members,
            own_leaf,
            next_leaf,
            pending: None,
            queued: Vec::new(),
            aad: Vec::new(),
        };
        let info = group.info();
        state.groups.insert(group_id, group);
        Ok(info)
    }

    async fn join_by_external_commit(
        &self,
        group_info: &[u8],
        aad: &[u8],
    ) -> SessionResult<(EngineGroupInfo, Vec<u8>)> {
        let payload: GroupInfoPayload = decode(group_info, TAG_GROUP_INFO, "group info")?;
        let group_id = GroupId::new(payload.group_id.clone());

        let mut state = self.state.write().await;
        if state.groups.contains_key(&group_id) {
            return Err(SessionError::Engine(format!(
                "group already exists: {}",
                group_id
            )));
        }

        let own_leaf = payload.next_leaf;
        let own_member = self.own_member(own_leaf);
        let commit_bytes = encode(&CommitPayload {
            tag: TAG_COMMIT,
            group_id: payload.group_id,
            from_epoch: payload.epoch,
            committer: self.identity.clone(),
            ops: vec![ProposalOp::Add(own_member.clone())],
            aad: aad.to_vec(),
        })?;

        let mut members = payload.members;
        members.push(own_member);

        let group = EngineGroup {
            group_id: group_id.clone(),
            epoch: payload.epoch + 1,
            ciphersuite: payload.ciphersuite,
            members,
            own_leaf,
            next_leaf: own_leaf + 1,
            pending: None,
            queued: Vec::new(),
            aad: Vec::new(),
        };
        let info = group.info();
        state.groups.insert(group_id, group);
        Ok((info, commit_bytes))
    }

    async fn group_info(&self, group_id: &GroupId) -> SessionResult<EngineGroupInfo> {
        let state = self.state.read().await;
        let group = lookup(&state, group_id)?;
        Ok(group.info())
    }

    async fn export_group_info(&self, group_id: &GroupId) -> SessionResult<Vec<u8>> {
        let state = self.state.read().await;
        let group = lookup(&state, group_id)?;
        encode(&GroupInfoPayload {
            tag: TAG_GROUP_INFO,
            group_id: group.group_id.as_bytes().to_vec(),
            epoch: group.epoch,
            ciphersuite: group.ciphersuite,
            members: group.members.clone(),
            next_leaf: group.next_leaf,
        })
    }

    async fn set_aad(&self, group_id: &GroupId, aad: &[u8]) -> SessionResult<()> {
        let mut state = self.state.write().await;
        let group = lookup_mut(&mut state, group_id)?;
        group.aad = aad.to_vec();
        Ok(())
    }

    async fn add_members(
        &self,
        group_id: &GroupId,
        key_packages: &[Vec<u8>],
    ) -> SessionResult<CommitOutcome> {
        if key_packages.is_empty() {
            return Err(SessionError::InvalidInput(
                "no key packages provided".to_string(),
            ));
        }

        let mut state = self.state.write().await;
        let group = lookup_mut(&mut state, group_id)?;

        let mut ops = Vec::with_capacity(key_packages.len());
        for kp_bytes in key_packages {
            let kp: KeyPackagePayload = decode(kp_bytes, TAG_KEY_PACKAGE, "key package")?;
            ops.push(ProposalOp::Add(MemberPayload {
                user_id: kp.user_id,
                leaf_index: group.next_leaf,
                signature_key: kp.signature_key,
            }));
            group.next_leaf += 1;
        }

        self.stage_commit(group, ops, false, true)
    }

    async fn remove_members(
        &self,
        group_id: &GroupId,
        leaf_indices: &[u32],
    ) -> SessionResult<CommitOutcome> {
        let mut state = self.state.write().await;
        let group = lookup_mut(&mut state, group_id)?;

        for leaf in leaf_indices {
            if !group.members.iter().any(|m| m.leaf_index == *leaf) {
                return Err(SessionError::InvalidInput(format!(
                    "no member at leaf {}",
                    leaf
                )));
            }
        }

        let ops = leaf_indices.iter().map(|l| ProposalOp::Remove(*l)).collect();
        self.stage_commit(group, ops, false, false)
    }

    async fn self_update(&self, group_id: &GroupId) -> SessionResult<CommitOutcome> {
        let mut state = self.state.write().await;
        let group = lookup_mut(&mut state, group_id)?;
        let ops = vec![ProposalOp::Update(group.own_leaf)];
        self.stage_commit(group, ops, false, false)
    }

    async fn propose_add(&self, group_id: &GroupId, key_package: &[u8]) -> SessionResult<Vec<u8>> {
        let kp: KeyPackagePayload = decode(key_package, TAG_KEY_PACKAGE, "key package")?;

        let mut state = self.state.write().await;
        let group = lookup_mut(&mut state, group_id)?;
        let op = ProposalOp::Add(MemberPayload {
            user_id: kp.user_id,
            leaf_index: group.next_leaf,
            signature_key: kp.signature_key,
        });
        group.next_leaf += 1;
        group.queued.push(op.clone());

        encode(&ProposalPayload {
            tag: TAG_PROPOSAL,
            group_id: group.group_id.as_bytes().to_vec(),
            epoch: group.epoch,
            proposer: self.identity.clone(),
            op,
        })
    }

    async fn propose_remove(&self, group_id: &GroupId, leaf_index: u32) -> SessionResult<Vec<u8>> {
        let mut state = self.state.write().await;
        let group = lookup_mut(&mut state, group_id)?;
        if !group.members.iter().any(|m| m.leaf_index == leaf_index) {
            return Err(SessionError::InvalidInput(format!(
                "no member at leaf {}",
                leaf_index
            )));
        }

        let op = ProposalOp::Remove(leaf_index);
        group.queued.push(op.clone());
        encode(&ProposalPayload {
            tag: TAG_PROPOSAL,
            group_id: group.group_id.as_bytes().to_vec(),
            epoch: group.epoch,
            proposer: self.identity.clone(),
            op,
        })
    }

    async fn propose_self_remove(&self, group_id: &GroupId) -> SessionResult<Vec<u8>> {
        let own_leaf = {
            let state = self.state.read().await;
            lookup(&state, group_id)?.own_leaf
        };
        self.propose_remove(group_id, own_leaf).await
    }

    async fn propose_external_psk(
        &self,
        group_id: &GroupId,
        psk_id: &[u8],
    ) -> SessionResult<Vec<u8>> {
        let mut state = self.state.write().await;
        if !state.psks.contains_key(psk_id) {
            return Err(SessionError::InvalidInput(format!(
                "unknown external PSK: {}",
                hex::encode(psk_id)
            )));
        }

        let group = lookup_mut(&mut state, group_id)?;
        let op = ProposalOp::ExternalPsk(psk_id.to_vec());
        group.queued.push(op.clone());
        encode(&ProposalPayload {
            tag: TAG_PROPOSAL,
            group_id: group.group_id.as_bytes().to_vec(),
            epoch: group.epoch,
            proposer: self.identity.clone(),
            op,
        })
    }

    async fn store_external_psk(&self, psk_id: &[u8], psk: &[u8]) -> SessionResult<()> {
        let mut state = self.state.write().await;
        state.psks.insert(psk_id.to_vec(), psk.to_vec());
        Ok(())
    }

    async fn commit_pending_proposals(&self, group_id: &GroupId) -> SessionResult<CommitOutcome> {
        let mut state = self.state.write().await;
        let group = lookup_mut(&mut state, group_id)?;
        let ops: Vec<ProposalOp> = group.queued.drain(..).collect();
        let with_welcome = ops.iter().any(|op| matches!(op, ProposalOp::Add(_)));
        self.stage_commit(group, ops, true, with_welcome)
    }

    async fn merge_pending_commit(&self, group_id: &GroupId) -> SessionResult<EngineGroupInfo> {
        let mut state = self.state.write().await;
        let psks = state.psks.clone();
        let group = lookup_mut(&mut state, group_id)?;
        let staged = group.pending.take().ok_or_else(|| {
            SessionError::Engine(format!("no pending commit for group {}", group_id))
        })?;

        group.apply_ops(&staged.ops, &psks)?;
        group.epoch = staged.outcome.new_epoch;
        group.refresh_own_leaf(&self.identity);
        Ok(group.info())
    }

    async fn clear_pending_commit(&self, group_id: &GroupId) -> SessionResult<()> {
        let mut state = self.state.write().await;
        let group = lookup_mut(&mut state, group_id)?;
        if let Some(staged) = group.pending.take() {
            if staged.from_queue {
                // Discarded commit releases its proposals back to the queue
                group.queued.splice(0..0, staged.ops);
            }
        }
        Ok(())
    }

    async fn process_commit(&self, group_id: &GroupId, commit: &[u8]) -> SessionResult<u64> {
        let payload: CommitPayload = decode(commit, TAG_COMMIT, "commit")?;

        let mut state = self.state.write().await;
        let psks = state.psks.clone();
        let group = lookup_mut(&mut state, group_id)?;

        if payload.group_id != group.group_id.as_bytes() {
            return Err(SessionError::InvalidInput(
                "commit addressed to a different group".to_string(),
            ));
        }
        if payload.from_epoch != group.epoch {
            return Err(SessionError::EpochMismatch {
                expected: group.epoch,
                actual: payload.from_epoch,
            });
        }

        if group.pending.is_some() {
            // A remote commit arriving first invalidates our staged one
            warn!(
                "Remote commit supersedes local pending commit for group {}",
                group_id
            );
            group.pending = None;
        }

        group.apply_ops(&payload.ops, &psks)?;
        group.epoch += 1;
        group.queued.clear();
        group.refresh_own_leaf(&self.identity);
        Ok(group.epoch)
    }

    async fn process_proposal(&self, group_id: &GroupId, proposal: &[u8]) -> SessionResult<()> {
        let payload: ProposalPayload = decode(proposal, TAG_PROPOSAL, "proposal")?;

        let mut state = self.state.write().await;
        let group = lookup_mut(&mut state, group_id)?;

        if payload.group_id != group.group_id.as_bytes() {
            return Err(SessionError::InvalidInput(
                "proposal addressed to a different group".to_string(),
            ));
        }
        if payload.epoch != group.epoch {
            return Err(SessionError::EpochMismatch {
                expected: group.epoch,
                actual: payload.epoch,
            });
        }

        if let ProposalOp::Add(member) = &payload.op {
            group.next_leaf = group.next_leaf.max(member.leaf_index + 1);
        }
        group.queued.push(payload.op);
        Ok(())
    }

    async fn encrypt_application(
        &self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> SessionResult<Vec<u8>> {
        let state = self.state.read().await;
        let group = lookup(&state, group_id)?;
        encode(&CiphertextPayload {
            tag: TAG_CIPHERTEXT,
            group_id: group.group_id.as_bytes().to_vec(),
            epoch: group.epoch,
            sender: self.identity.clone(),
            body: plaintext.to_vec(),
        })
    }

    async fn decrypt_application(
        &self,
        group_id: &GroupId,
        ciphertext: &[u8],
    ) -> SessionResult<ApplicationMessage> {
        let payload: CiphertextPayload = decode(ciphertext, TAG_CIPHERTEXT, "ciphertext")?;

        let state = self.state.read().await;
        let group = lookup(&state, group_id)?;
        if payload.group_id != group.group_id.as_bytes() {
            return Err(SessionError::InvalidInput(
                "ciphertext addressed to a different group".to_string(),
            ));
        }
        if payload.epoch > group.epoch {
            return Err(SessionError::EpochMismatch {
                expected: group.epoch,
                actual: payload.epoch,
            });
        }

        Ok(ApplicationMessage {
            sender: payload.sender,
            plaintext: payload.body,
        })
    }

    async fn export_group_state(&self, group_id: &GroupId) -> SessionResult<Vec<u8>> {
        let state = self.state.read().await;
        let group = lookup(&state, group_id)?;
        encode(&GroupStatePayload {
            tag: TAG_GROUP_STATE,
            group_id: group.group_id.as_bytes().to_vec(),
            epoch: group.epoch,
            ciphersuite: group.ciphersuite,
            members: group.members.clone(),
            own_leaf: group.own_leaf,
            next_leaf: group.next_leaf,
        })
    }

    async fn import_group_state(&self, blob: &[u8]) -> SessionResult<EngineGroupInfo> {
        let payload: GroupStatePayload = decode(blob, TAG_GROUP_STATE, "group state")?;
        let group_id = GroupId::new(payload.group_id);

        let mut state = self.state.write().await;
        let group = EngineGroup {
            group_id: group_id.clone(),
            epoch: payload.epoch,
            ciphersuite: payload.ciphersuite,
            members: payload.members,
            own_leaf: payload.own_leaf,
            next_leaf: payload.next_leaf,
            pending: None,
            queued: Vec::new(),
            aad: Vec::new(),
        };
        let info = group.info();
        state.groups.insert(group_id, group);
        Ok(info)
    }

    async fn delete_group(&self, group_id: &GroupId) -> SessionResult<()> {
        let mut state = self.state.write().await;
        state.groups.remove(group_id);
        Ok(())
    }
}

fn lookup<'a>(state: &'a EngineState, group_id: &GroupId) -> SessionResult<&'a EngineGroup> {
    state
        .groups
        .get(group_id)
        .ok_or_else(|| SessionError::UnknownGroup(group_id.to_hex()))
}

fn lookup_mut<'a>(
    state: &'a mut EngineState,
    group_id: &GroupId,
) -> SessionResult<&'a mut EngineGroup> {
    state
        .groups
        .get_mut(group_id)
        .ok_or_else(|| SessionError::UnknownGroup(group_id.to_hex()))
}

fn encode<T: Serialize>(payload: &T) -> SessionResult<Vec<u8>> {
    bincode::serialize(payload).map_err(|e| SessionError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned + HasTag>(
    bytes: &[u8],
    expected_tag: u8,
    kind: &str,
) -> SessionResult<T> {
    let payload: T = bincode::deserialize(bytes)
        .map_err(|e| SessionError::InvalidInput(format!("unparseable {}: {}", kind, e)))?;
    if payload.tag() != expected_tag {
        return Err(SessionError::InvalidInput(format!(
            "unparseable {}: wrong payload tag",
            kind
        )));
    }
    Ok(payload)
}

trait HasTag {
    fn tag(&self) -> u8;
}

macro_rules! has_tag {
    ($($t:ty),*) => {
        $(impl HasTag for $t {
            fn tag(&self) -> u8 {
                self.tag
            }
        })*
    };
}

has_tag!(
    KeyPackagePayload,
    WelcomePayload,
    CommitPayload,
    ProposalPayload,
    GroupInfoPayload,
    CiphertextPayload,
    GroupStatePayload
);

fn random_key() -> Vec<u8> {
    use rand::Rng;
    let mut bytes = vec![0u8; 32];
    rand::rng().fill(&mut bytes[..]);
    bytes
}
