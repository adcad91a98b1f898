//! The session manager
//!
//! All engine-mutating operations on a group are serialized through a
//! per-group async mutex, held across the engine call and the local
//! bookkeeping it implies. Operations on distinct groups proceed
//! concurrently.

use crate::config::Config;
use crate::core_dedup::DedupFilter;
use crate::core_session::errors::{SessionError, SessionResult};
use crate::core_session::events::{EventBroadcaster, SessionEvent};
use crate::core_session::types::{
    now_ms, GroupId, GroupMetadata, MemberInfo, PendingCommit, DEFAULT_CIPHERSUITE,
};
use crate::core_trust::{fingerprint_of, TrustStore};
use crate::engine::{ApplicationMessage, CommitOutcome, CryptoEngine, EngineGroupInfo, EngineMember};
use crate::metrics::{record_counter, record_gauge, Timer};
use crate::shutdown::ShutdownCoordinator;
use crate::storage::StorageProvider;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Outcome of applying an inbound protocol message
///
/// `Duplicate` means the message id was already applied on this device;
/// the call was a no-op and nothing was emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed<T> {
    Applied(T),
    Duplicate,
}

impl<T> Processed<T> {
    /// Whether the message was applied by this call
    pub fn is_applied(&self) -> bool {
        matches!(self, Processed::Applied(_))
    }
}

/// Local bookkeeping for one live group, mirrored from the engine
#[derive(Debug, Clone)]
struct GroupState {
    epoch: u64,
    ciphersuite: crate::core_session::types::CiphersuiteId,
    members: Vec<MemberInfo>,
    pending_commit: Option<PendingCommit>,
    pending_proposal_count: usize,
    created_at: u64,
    updated_at: u64,
}

impl GroupState {
    fn from_info(info: &EngineGroupInfo) -> Self {
        let now = now_ms();
        Self {
            epoch: info.epoch,
            ciphersuite: info.ciphersuite,
            members: members_from(&info.members, &[], now),
            pending_commit: None,
            pending_proposal_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh from an engine snapshot, preserving join timestamps of
    /// members that survived
    fn apply_info(&mut self, info: &EngineGroupInfo) {
        let now = now_ms();
        self.members = members_from(&info.members, &self.members, now);
        self.epoch = info.epoch;
        self.updated_at = now;
    }
}

fn members_from(engine: &[EngineMember], previous: &[MemberInfo], now: u64) -> Vec<MemberInfo> {
    engine
        .iter()
        .map(|m| MemberInfo {
            user_id: m.user_id.clone(),
            leaf_index: m.leaf_index,
            signature_key: m.signature_key.clone(),
            joined_at: previous
                .iter()
                .find(|p| p.user_id == m.user_id)
                .map(|p| p.joined_at)
                .unwrap_or(now),
        })
        .collect()
}

/// Handle giving one group its own mutation lock
struct GroupHandle {
    state: Mutex<GroupState>,
}

/// Orchestrates group lifecycle over an opaque crypto engine
pub struct SessionManager {
    engine: Arc<dyn CryptoEngine>,
    storage: Arc<dyn StorageProvider>,
    groups: RwLock<HashMap<GroupId, Arc<GroupHandle>>>,
    dedup: Arc<DedupFilter>,
    trust: Arc<TrustStore>,
    events: EventBroadcaster,
    shutdown: Arc<ShutdownCoordinator>,
    max_group_size: usize,
}

impl SessionManager {
    /// Create a manager over the given engine and storage. The device
    /// id scopes the processed-message filter; two local devices
    /// sharing storage never see each other's records.
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        storage: Arc<dyn StorageProvider>,
        config: &Config,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            storage: storage.clone(),
            groups: RwLock::new(HashMap::new()),
            dedup: Arc::new(DedupFilter::new(&config.dedup, device_id)),
            trust: Arc::new(TrustStore::new(storage)),
            events: EventBroadcaster::new(config.session.event_buffer),
            shutdown: Arc::new(ShutdownCoordinator::new(config.session.shutdown_timeout)),
            max_group_size: config.session.max_group_size,
        }
    }

    /// The crypto engine behind this manager
    pub fn engine(&self) -> &Arc<dyn CryptoEngine> {
        &self.engine
    }

    /// The TOFU trust store
    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// The processed-message filter
    pub fn dedup(&self) -> &Arc<DedupFilter> {
        &self.dedup
    }

    /// The session event broadcaster
    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn ensure_running(&self) -> SessionResult<()> {
        if self.shutdown.is_shutting_down().await {
            return Err(SessionError::ServiceUnavailable(
                "shutting down".to_string(),
            ));
        }
        Ok(())
    }

    async fn handle(&self, group_id: &GroupId) -> SessionResult<Arc<GroupHandle>> {
        let groups = self.groups.read().await;
        groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownGroup(group_id.to_hex()))
    }

    /// Record fingerprint sightings for every non-self member and emit
    /// change events. Called at each membership observation point.
    pub(crate) async fn record_member_sightings(&self, members: &[EngineMember]) {
        let own = self.engine.own_identity();
        for member in members {
            if member.user_id == own {
                continue;
            }
            let fingerprint = fingerprint_of(&member.signature_key);
            let outcome = self
                .trust
                .record_sighting(&member.user_id, fingerprint.clone())
                .await;
            if outcome.changed {
                self.events.emit(SessionEvent::TrustChanged {
                    contact: member.user_id.clone(),
                    previous_fingerprint: outcome
                        .previous_fingerprint
                        .map(|f| f.to_string())
                        .unwrap_or_default(),
                    current_fingerprint: fingerprint.to_string(),
                });
            }
        }
    }

    /// Register an engine group snapshot as a live group
    pub(crate) async fn adopt_group(&self, info: &EngineGroupInfo) -> SessionResult<()> {
        let mut groups = self.groups.write().await;
        if groups.contains_key(&info.group_id) {
            return Err(SessionError::InvalidInput(format!(
                "group {} already active",
                info.group_id.to_hex()
            )));
        }
        groups.insert(
            info.group_id.clone(),
            Arc::new(GroupHandle {
                state: Mutex::new(GroupState::from_info(info)),
            }),
        );
        record_gauge("session.groups.active", groups.len() as f64);
        Ok(())
    }

    async fn drop_group(&self, group_id: &GroupId) {
        let mut groups = self.groups.write().await;
        groups.remove(group_id);
        record_gauge("session.groups.active", groups.len() as f64);
    }

    // ---- group lifecycle ----

    /// Create a new group with self as the only member
    ///
    /// The group starts at epoch 0 with the default ciphersuite.
    pub async fn create_group(&self, group_id: Option<GroupId>) -> SessionResult<GroupId> {
        self.ensure_running().await?;
        let group_id = group_id.unwrap_or_else(GroupId::random);

        {
            let groups = self.groups.read().await;
            if groups.contains_key(&group_id) {
                return Err(SessionError::InvalidInput(format!(
                    "group {} already active",
                    group_id.to_hex()
                )));
            }
        }

        let info = self
            .engine
            .create_group(&group_id, DEFAULT_CIPHERSUITE)
            .await?;
        self.adopt_group(&info).await?;

        info!("Created group {} at epoch {}", group_id.to_hex(), info.epoch);
        record_counter("session.groups.created", 1);
        self.events.emit(SessionEvent::GroupCreated {
            group_id: group_id.clone(),
            epoch: info.epoch,
        });
        Ok(group_id)
    }

    /// Join an existing group via external commit, using its exported
    /// public group info. Returns the group id and the commit bytes the
    /// caller must broadcast to existing members.
    pub async fn join_by_external_commit(
        &self,
        group_info: &[u8],
        aad: &[u8],
    ) -> SessionResult<(GroupId, Vec<u8>)> {
        self.ensure_running().await?;
        let (info, commit_bytes) = self.engine.join_by_external_commit(group_info, aad).await?;
        let group_id = info.group_id.clone();

        {
            let mut groups = self.groups.write().await;
            if groups.contains_key(&group_id) {
                warn!(
                    "External join replaced already-active group {}",
                    group_id.to_hex()
                );
            }
            groups.insert(
                group_id.clone(),
                Arc::new(GroupHandle {
                    state: Mutex::new(GroupState::from_info(&info)),
                }),
            );
            record_gauge("session.groups.active", groups.len() as f64);
        }

        self.record_member_sightings(&info.members).await;
        info!(
            "Joined group {} at epoch {} by external commit",
            group_id.to_hex(),
            info.epoch
        );
        record_counter("session.groups.joined", 1);
        self.events.emit(SessionEvent::GroupJoined {
            group_id: group_id.clone(),
            epoch: info.epoch,
            member_count: info.members.len(),
        });
        Ok((group_id, commit_bytes))
    }

    /// Queue a proposal removing own leaf and return its bytes for
    /// transport. Another member must commit it; the group stays live
    /// locally until their commit arrives.
    pub async fn leave(&self, group_id: &GroupId) -> SessionResult<Vec<u8>> {
        self.ensure_running().await?;
        let handle = self.handle(group_id).await?;
        let mut state = handle.state.lock().await;

        let proposal = self.engine.propose_self_remove(group_id).await?;
        state.pending_proposal_count += 1;
        debug!("Queued self-remove proposal for group {}", group_id.to_hex());
        self.events.emit(SessionEvent::ProposalQueued {
            group_id: group_id.clone(),
            epoch: state.epoch,
        });
        Ok(proposal)
    }

    // ---- staged commits ----

    /// `check` runs against the group state under the same lock that
    /// serializes staging, so its verdict cannot go stale before the
    /// commit is staged.
    async fn stage_commit<F, Fut>(
        &self,
        group_id: &GroupId,
        check: impl FnOnce(&GroupState) -> SessionResult<()>,
        stage: F,
    ) -> SessionResult<PendingCommit>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = SessionResult<CommitOutcome>>,
    {
        self.ensure_running().await?;
        let handle = self.handle(group_id).await?;
        let mut state = handle.state.lock().await;

        if state.pending_commit.is_some() {
            return Err(SessionError::PendingCommitConflict(group_id.to_hex()));
        }
        check(&state)?;

        let outcome = stage().await?;
        let pending = PendingCommit {
            commit_bytes: outcome.commit_bytes,
            welcome_bytes: outcome.welcome_bytes,
            new_epoch: outcome.new_epoch,
        };
        state.pending_commit = Some(pending.clone());

        debug!(
            "Staged commit for group {} toward epoch {}",
            group_id.to_hex(),
            pending.new_epoch
        );
        record_counter("session.commits.created", 1);
        self.events.emit(SessionEvent::CommitStaged {
            group_id: group_id.clone(),
            new_epoch: pending.new_epoch,
        });
        Ok(pending)
    }

    /// Stage a commit adding members by their key packages
    ///
    /// The epoch does not advance until [`merge_pending_commit`]; the
    /// welcome bytes in the returned commit are what new members stage
    /// on their side.
    ///
    /// [`merge_pending_commit`]: SessionManager::merge_pending_commit
    pub async fn add_members(
        &self,
        group_id: &GroupId,
        key_packages: &[Vec<u8>],
    ) -> SessionResult<PendingCommit> {
        if key_packages.is_empty() {
            return Err(SessionError::InvalidInput(
                "no key packages to add".to_string(),
            ));
        }
        self.stage_commit(
            group_id,
            |state| {
                if self.max_group_size > 0
                    && state.members.len() + key_packages.len() > self.max_group_size
                {
                    return Err(SessionError::InvalidInput(format!(
                        "group size would exceed maximum of {}",
                        self.max_group_size
                    )));
                }
                Ok(())
            },
            || self.engine.add_members(group_id, key_packages),
        )
        .await
    }

    /// Stage a commit removing members by leaf index
    pub async fn remove_members(
        &self,
        group_id: &GroupId,
        leaf_indices: &[u32],
    ) -> SessionResult<PendingCommit> {
        if leaf_indices.is_empty() {
            return Err(SessionError::InvalidInput(
                "no leaves to remove".to_string(),
            ));
        }
        self.stage_commit(group_id, |_| Ok(()), || {
            self.engine.remove_members(group_id, leaf_indices)
        })
        .await
    }

    /// Stage a commit rotating own leaf key material
    pub async fn self_update(&self, group_id: &GroupId) -> SessionResult<PendingCommit> {
        self.stage_commit(group_id, |_| Ok(()), || self.engine.self_update(group_id))
            .await
    }

    /// Stage a commit over all queued proposals
    pub async fn commit_pending_proposals(
        &self,
        group_id: &GroupId,
    ) -> SessionResult<PendingCommit> {
        self.stage_commit(group_id, |_| Ok(()), || {
            self.engine.commit_pending_proposals(group_id)
        })
        .await
    }

    /// Merge the staged pending commit, advancing the epoch. Returns
    /// the new epoch.
    pub async fn merge_pending_commit(&self, group_id: &GroupId) -> SessionResult<u64> {
        self.ensure_running().await?;
        let handle = self.handle(group_id).await?;
        let mut state = handle.state.lock().await;

        if state.pending_commit.is_none() {
            return Err(SessionError::InvalidInput(format!(
                "no pending commit for group {}",
                group_id.to_hex()
            )));
        }

        let info = self.engine.merge_pending_commit(group_id).await?;
        let old_epoch = state.epoch;
        state.pending_commit = None;
        state.pending_proposal_count = 0;
        state.apply_info(&info);

        self.record_member_sightings(&info.members).await;
        info!(
            "Merged commit for group {}: epoch {} -> {}",
            group_id.to_hex(),
            old_epoch,
            info.epoch
        );
        record_counter("session.commits.merged", 1);
        self.events.emit_many(vec![
            SessionEvent::CommitMerged {
                group_id: group_id.clone(),
                epoch: info.epoch,
            },
            SessionEvent::EpochChanged {
                group_id: group_id.clone(),
                old_epoch,
                new_epoch: info.epoch,
            },
        ]);
        Ok(info.epoch)
    }

    /// Discard the staged pending commit without applying it
    pub async fn discard_pending_commit(&self, group_id: &GroupId) -> SessionResult<()> {
        let handle = self.handle(group_id).await?;
        let mut state = handle.state.lock().await;

        if state.pending_commit.is_none() {
            return Err(SessionError::InvalidInput(format!(
                "no pending commit for group {}",
                group_id.to_hex()
            )));
        }

        self.engine.clear_pending_commit(group_id).await?;
        state.pending_commit = None;

        debug!("Discarded pending commit for group {}", group_id.to_hex());
        record_counter("session.commits.discarded", 1);
        self.events.emit(SessionEvent::CommitDiscarded {
            group_id: group_id.clone(),
        });
        Ok(())
    }

    // ---- proposals ----

    /// Queue an add proposal; returns the proposal bytes for transport
    pub async fn propose_add(
        &self,
        group_id: &GroupId,
        key_package: &[u8],
    ) -> SessionResult<Vec<u8>> {
        self.ensure_running().await?;
        let handle = self.handle(group_id).await?;
        let mut state = handle.state.lock().await;

        let proposal = self.engine.propose_add(group_id, key_package).await?;
        state.pending_proposal_count += 1;
        self.events.emit(SessionEvent::ProposalQueued {
            group_id: group_id.clone(),
            epoch: state.epoch,
        });
        Ok(proposal)
    }

    /// Queue a remove proposal
    pub async fn propose_remove(
        &self,
        group_id: &GroupId,
        leaf_index: u32,
    ) -> SessionResult<Vec<u8>> {
        self.ensure_running().await?;
        let handle = self.handle(group_id).await?;
        let mut state = handle.state.lock().await;

        let proposal = self.engine.propose_remove(group_id, leaf_index).await?;
        state.pending_proposal_count += 1;
        self.events.emit(SessionEvent::ProposalQueued {
            group_id: group_id.clone(),
            epoch: state.epoch,
        });
        Ok(proposal)
    }

    /// Queue an external-PSK proposal
    pub async fn propose_external_psk(
        &self,
        group_id: &GroupId,
        psk_id: &[u8],
    ) -> SessionResult<Vec<u8>> {
        self.ensure_running().await?;
        let handle = self.handle(group_id).await?;
        let mut state = handle.state.lock().await;

        let proposal = self.engine.propose_external_psk(group_id, psk_id).await?;
        state.pending_proposal_count += 1;
        self.events.emit(SessionEvent::ProposalQueued {
            group_id: group_id.clone(),
            epoch: state.epoch,
        });
        Ok(proposal)
    }

    /// Store an external PSK for later proposals
    pub async fn store_external_psk(&self, psk_id: &[u8], psk: &[u8]) -> SessionResult<()> {
        self.ensure_running().await?;
        self.engine.store_external_psk(psk_id, psk).await
    }

    // ---- inbound protocol messages ----

    /// Apply a remote commit
    ///
    /// Duplicate message ids are no-ops. An `EpochMismatch` is surfaced
    /// without marking the message processed, so redelivery after fork
    /// recovery can still apply it. Applying a remote commit discards
    /// any local pending commit (the remote one won the epoch) and, if
    /// own identity is absent from the new membership, drops the group.
    pub async fn process_commit(
        &self,
        group_id: &GroupId,
        message_id: &str,
        commit: &[u8],
    ) -> SessionResult<Processed<u64>> {
        self.ensure_running().await?;
        if self.dedup.is_processed(message_id).await {
            record_counter("dedup.hits", 1);
            return Ok(Processed::Duplicate);
        }

        let handle = self.handle(group_id).await?;
        let mut state = handle.state.lock().await;
        let timer = Timer::new("session.commit.duration_ms");

        let new_epoch = self.engine.process_commit(group_id, commit).await?;
        self.dedup.mark_processed(message_id, now_ms()).await;

        if state.pending_commit.take().is_some() {
            warn!(
                "Remote commit superseded local pending commit for group {}",
                group_id.to_hex()
            );
            self.events.emit(SessionEvent::CommitDiscarded {
                group_id: group_id.clone(),
            });
        }

        let info = self.engine.group_info(group_id).await?;
        let old_epoch = state.epoch;
        state.pending_proposal_count = 0;
        state.apply_info(&info);

        self.record_member_sightings(&info.members).await;
        record_counter("session.commits.processed", 1);
        self.events.emit(SessionEvent::EpochChanged {
            group_id: group_id.clone(),
            old_epoch,
            new_epoch,
        });

        let own = self.engine.own_identity();
        let still_member = info.members.iter().any(|m| m.user_id == own);
        timer.stop();
        drop(state);

        if !still_member {
            info!(
                "Removed from group {} at epoch {}",
                group_id.to_hex(),
                new_epoch
            );
            self.drop_group(group_id).await;
            self.engine.delete_group(group_id).await?;
            self.events.emit(SessionEvent::GroupLeft {
                group_id: group_id.clone(),
                final_epoch: new_epoch,
            });
        }

        Ok(Processed::Applied(new_epoch))
    }

    /// Queue a remote proposal
    pub async fn process_proposal(
        &self,
        group_id: &GroupId,
        message_id: &str,
        proposal: &[u8],
    ) -> SessionResult<Processed<()>> {
        self.ensure_running().await?;
        if self.dedup.is_processed(message_id).await {
            record_counter("dedup.hits", 1);
            return Ok(Processed::Duplicate);
        }

        let handle = self.handle(group_id).await?;
        let mut state = handle.state.lock().await;

        self.engine.process_proposal(group_id, proposal).await?;
        self.dedup.mark_processed(message_id, now_ms()).await;
        state.pending_proposal_count += 1;

        record_counter("session.proposals.processed", 1);
        self.events.emit(SessionEvent::ProposalQueued {
            group_id: group_id.clone(),
            epoch: state.epoch,
        });
        Ok(Processed::Applied(()))
    }

    /// Decrypt and apply an inbound application message
    pub async fn process_application_message(
        &self,
        group_id: &GroupId,
        message_id: &str,
        ciphertext: &[u8],
    ) -> SessionResult<Processed<ApplicationMessage>> {
        self.ensure_running().await?;
        if self.dedup.is_processed(message_id).await {
            record_counter("dedup.hits", 1);
            return Ok(Processed::Duplicate);
        }

        let handle = self.handle(group_id).await?;
        let state = handle.state.lock().await;

        let message = self.engine.decrypt_application(group_id, ciphertext).await?;
        self.dedup.mark_processed(message_id, now_ms()).await;

        record_counter("session.messages.received", 1);
        self.events.emit(SessionEvent::MessageReceived {
            group_id: group_id.clone(),
            message_id: message_id.to_string(),
            sender_id: message.sender.clone(),
            epoch: state.epoch,
            plaintext: message.plaintext.clone(),
        });
        Ok(Processed::Applied(message))
    }

    /// Encrypt an application message for the group
    pub async fn send_message(
        &self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> SessionResult<Vec<u8>> {
        self.ensure_running().await?;
        let handle = self.handle(group_id).await?;
        let _state = handle.state.lock().await;

        let ciphertext = self.engine.encrypt_application(group_id, plaintext).await?;
        record_counter("session.messages.sent", 1);
        Ok(ciphertext)
    }

    // ---- recovery ----

    /// Recover a forked group by removing all own stale leaves and
    /// re-adding self with fresh key material, in a single commit that
    /// is merged locally. Returns the merged commit for broadcast.
    ///
    /// Fails with `PendingCommitConflict` if a staged commit exists;
    /// the caller must merge or discard it first.
    pub async fn recover_fork_by_readding(
        &self,
        group_id: &GroupId,
    ) -> SessionResult<PendingCommit> {
        self.recover_fork(group_id, None, None).await
    }

    /// Fork recovery with caller-supplied material, for setups where
    /// the stale leaves and replacement key packages are not all
    /// derivable locally (several devices share the user's identity).
    pub async fn recover_fork_with_material(
        &self,
        group_id: &GroupId,
        own_leaves: &[u32],
        key_packages: &[Vec<u8>],
    ) -> SessionResult<PendingCommit> {
        if own_leaves.is_empty() {
            return Err(SessionError::InvalidInput(
                "no leaves to replace".to_string(),
            ));
        }
        if key_packages.is_empty() {
            return Err(SessionError::InvalidInput(
                "no replacement key packages".to_string(),
            ));
        }
        self.recover_fork(group_id, Some(own_leaves), Some(key_packages))
            .await
    }

    async fn recover_fork(
        &self,
        group_id: &GroupId,
        own_leaves: Option<&[u32]>,
        key_packages: Option<&[Vec<u8>]>,
    ) -> SessionResult<PendingCommit> {
        self.ensure_running().await?;
        let handle = self.handle(group_id).await?;
        let mut state = handle.state.lock().await;

        if state.pending_commit.is_some() {
            return Err(SessionError::PendingCommitConflict(group_id.to_hex()));
        }

        let own = self.engine.own_identity();
        let leaves: Vec<u32> = match own_leaves {
            Some(leaves) => leaves.to_vec(),
            None => state
                .members
                .iter()
                .filter(|m| m.user_id == own)
                .map(|m| m.leaf_index)
                .collect(),
        };

        for leaf in &leaves {
            self.engine.propose_remove(group_id, *leaf).await?;
        }
        match key_packages {
            Some(packages) => {
                for package in packages {
                    self.engine.propose_add(group_id, package).await?;
                }
            }
            None => {
                let package = self.engine.generate_key_package().await?;
                self.engine.propose_add(group_id, &package).await?;
            }
        }

        let outcome = self.engine.commit_pending_proposals(group_id).await?;
        let info = self.engine.merge_pending_commit(group_id).await?;

        let old_epoch = state.epoch;
        state.pending_commit = None;
        state.pending_proposal_count = 0;
        state.apply_info(&info);

        info!(
            "Recovered fork in group {} by re-adding self: epoch {} -> {}",
            group_id.to_hex(),
            old_epoch,
            info.epoch
        );
        record_counter("session.forks.recovered", 1);
        self.events.emit_many(vec![
            SessionEvent::ForkRecovered {
                group_id: group_id.clone(),
                epoch: info.epoch,
            },
            SessionEvent::EpochChanged {
                group_id: group_id.clone(),
                old_epoch,
                new_epoch: info.epoch,
            },
        ]);

        Ok(PendingCommit {
            commit_bytes: outcome.commit_bytes,
            welcome_bytes: outcome.welcome_bytes,
            new_epoch: info.epoch,
        })
    }

    /// Replace a group wholesale under a fresh identifier
    ///
    /// Creates a new group with the old group's ciphersuite, binds the
    /// given AAD, adds the given members in one immediately-merged
    /// commit, then drops the old group. Returns the new group id and
    /// the welcome bytes for the re-invited members.
    pub async fn reboot_group(
        &self,
        old_group_id: &GroupId,
        key_packages: &[Vec<u8>],
        aad: &[u8],
    ) -> SessionResult<(GroupId, Option<Vec<u8>>)> {
        self.ensure_running().await?;
        let old_handle = self.handle(old_group_id).await?;
        let old_state = old_handle.state.lock().await;
        let ciphersuite = old_state.ciphersuite;

        let new_group_id = GroupId::random();
        let mut info = self.engine.create_group(&new_group_id, ciphersuite).await?;
        self.engine.set_aad(&new_group_id, aad).await?;

        let welcome_bytes = if key_packages.is_empty() {
            None
        } else {
            let outcome = self.engine.add_members(&new_group_id, key_packages).await?;
            info = self.engine.merge_pending_commit(&new_group_id).await?;
            outcome.welcome_bytes
        };

        self.adopt_group(&info).await?;
        self.record_member_sightings(&info.members).await;

        drop(old_state);
        self.drop_group(old_group_id).await;
        if let Err(e) = self.engine.delete_group(old_group_id).await {
            warn!(
                "Failed to delete engine state for rebooted group {}: {}",
                old_group_id.to_hex(),
                e
            );
        }

        info!(
            "Rebooted group {} as {} at epoch {}",
            old_group_id.to_hex(),
            new_group_id.to_hex(),
            info.epoch
        );
        record_counter("session.groups.rebooted", 1);
        self.events.emit_many(vec![
            SessionEvent::GroupRebooted {
                old_group_id: old_group_id.clone(),
                new_group_id: new_group_id.clone(),
            },
            SessionEvent::GroupCreated {
                group_id: new_group_id.clone(),
                epoch: info.epoch,
            },
        ]);
        Ok((new_group_id, welcome_bytes))
    }

    // ---- inspection ----

    /// Metadata snapshot of a group
    pub async fn metadata(&self, group_id: &GroupId) -> SessionResult<GroupMetadata> {
        let handle = self.handle(group_id).await?;
        let state = handle.state.lock().await;
        Ok(GroupMetadata {
            group_id: group_id.clone(),
            epoch: state.epoch,
            ciphersuite: state.ciphersuite,
            members: state.members.clone(),
            created_at: state.created_at,
            updated_at: state.updated_at,
        })
    }

    /// The staged pending commit for a group, if any
    pub async fn pending_commit(&self, group_id: &GroupId) -> SessionResult<Option<PendingCommit>> {
        let handle = self.handle(group_id).await?;
        let state = handle.state.lock().await;
        Ok(state.pending_commit.clone())
    }

    /// Number of queued proposals for a group
    pub async fn pending_proposal_count(&self, group_id: &GroupId) -> SessionResult<usize> {
        let handle = self.handle(group_id).await?;
        let state = handle.state.lock().await;
        Ok(state.pending_proposal_count)
    }

    /// Ids of all live groups, sorted
    pub async fn list_groups(&self) -> Vec<GroupId> {
        let groups = self.groups.read().await;
        let mut ids: Vec<GroupId> = groups.keys().cloned().collect();
        ids.sort_by_key(|g| g.to_hex());
        ids
    }

    /// Number of live groups
    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    /// Export the public group info an external joiner needs
    pub async fn export_group_info(&self, group_id: &GroupId) -> SessionResult<Vec<u8>> {
        self.handle(group_id).await?;
        self.engine.export_group_info(group_id).await
    }

    // ---- persistence ----

    /// Export a group's engine state and persist it through the
    /// storage boundary. Returns the opaque blob.
    pub async fn export_state(&self, group_id: &GroupId) -> SessionResult<Vec<u8>> {
        let handle = self.handle(group_id).await?;
        let _state = handle.state.lock().await;

        let blob = self.engine.export_group_state(group_id).await?;
        self.storage
            .put_blob(&format!("group_state/{}", group_id.to_hex()), &blob)
            .await?;
        Ok(blob)
    }

    /// Restore a group from a previously exported blob
    pub async fn restore_group(&self, blob: &[u8]) -> SessionResult<GroupId> {
        self.ensure_running().await?;
        let info = self.engine.import_group_state(blob).await?;
        let group_id = info.group_id.clone();
        self.adopt_group(&info).await?;
        debug!(
            "Restored group {} at epoch {}",
            group_id.to_hex(),
            info.epoch
        );
        Ok(group_id)
    }

    /// Flush all state and stop accepting new operations
    ///
    /// Export failures are logged and skipped; shutdown always
    /// completes.
    pub async fn shutdown(&self) {
        self.shutdown.shutdown_immediately().await;

        let group_ids: Vec<GroupId> = {
            let groups = self.groups.read().await;
            groups.keys().cloned().collect()
        };
        for group_id in &group_ids {
            match self.engine.export_group_state(group_id).await {
                Ok(blob) => {
                    if let Err(e) = self
                        .storage
                        .put_blob(&format!("group_state/{}", group_id.to_hex()), &blob)
                        .await
                    {
                        warn!("Failed to persist group {}: {}", group_id.to_hex(), e);
                    }
                }
                Err(e) => warn!("Failed to export group {}: {}", group_id.to_hex(), e),
            }
        }

        if let Err(e) = self.dedup.persist(self.storage.as_ref()).await {
            warn!("Failed to persist dedup filter: {}", e);
        }
        if let Err(e) = self.trust.persist().await {
            warn!("Failed to persist trust store: {}", e);
        }
        info!("Session manager shut down ({} groups flushed)", group_ids.len());
    }
}
