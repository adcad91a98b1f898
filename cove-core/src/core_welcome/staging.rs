//! Staged welcome records and their lifecycle

use crate::config::StagingConfig;
use crate::core_session::errors::{SessionError, SessionResult};
use crate::core_session::events::SessionEvent;
use crate::core_session::types::{now_ms, CiphersuiteId, GroupId};
use crate::core_session::SessionManager;
use crate::engine::EngineMember;
use crate::metrics::record_counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier of a staged welcome, independent of the group id
/// (several welcomes for the same group can be staged at once)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StagingId(Uuid);

impl StagingId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for StagingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a staged welcome
///
/// `Accepted` and `Rejected` are terminal: a record transitions out of
/// `Pending` exactly once and is never deleted by resolution, so the
/// decision stays inspectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagedStatus {
    Pending,
    Accepted,
    Rejected,
}

/// A welcome held for inspection before any key material is merged
#[derive(Debug, Clone)]
pub struct StagedWelcome {
    pub staging_id: StagingId,
    /// Group this welcome admits to
    pub group_id: GroupId,
    /// Epoch the group will be at on join
    pub epoch: u64,
    pub ciphersuite: CiphersuiteId,
    /// Member who issued the welcome
    pub sender: EngineMember,
    /// Membership snapshot at staging time
    pub members: Vec<EngineMember>,
    /// Original welcome bytes, merged only on accept
    pub welcome_bytes: Vec<u8>,
    pub ratchet_tree: Option<Vec<u8>>,
    pub status: StagedStatus,
    /// When the welcome was staged (Unix millis)
    pub staged_at: u64,
    /// When the record went terminal (Unix millis)
    pub resolved_at: Option<u64>,
}

/// Staging area for inbound welcomes
pub struct WelcomeStaging {
    manager: Arc<SessionManager>,
    staged: RwLock<HashMap<StagingId, StagedWelcome>>,
    stale_after: Duration,
}

impl WelcomeStaging {
    /// Create a staging area promoting accepted groups into the given
    /// manager
    pub fn new(manager: Arc<SessionManager>, config: &StagingConfig) -> Self {
        Self {
            manager,
            staged: RwLock::new(HashMap::new()),
            stale_after: config.stale_after,
        }
    }

    /// Stage an inbound welcome for inspection
    ///
    /// Parses the bytes into a preview without merging any key
    /// material. Unparseable bytes fail with `InvalidInput` and leave
    /// no record behind.
    pub async fn stage(
        &self,
        welcome_bytes: &[u8],
        ratchet_tree: Option<&[u8]>,
    ) -> SessionResult<StagedWelcome> {
        let preview = self
            .manager
            .engine()
            .parse_welcome(welcome_bytes, ratchet_tree)
            .await?;

        let record = StagedWelcome {
            staging_id: StagingId::generate(),
            group_id: preview.group_id,
            epoch: preview.epoch,
            ciphersuite: preview.ciphersuite,
            sender: preview.sender,
            members: preview.members,
            welcome_bytes: welcome_bytes.to_vec(),
            ratchet_tree: ratchet_tree.map(|t| t.to_vec()),
            status: StagedStatus::Pending,
            staged_at: now_ms(),
            resolved_at: None,
        };

        let mut staged = self.staged.write().await;
        staged.insert(record.staging_id, record.clone());
        drop(staged);

        info!(
            "Staged welcome {} for group {} at epoch {} from {}",
            record.staging_id,
            record.group_id.to_hex(),
            record.epoch,
            record.sender.user_id
        );
        record_counter("welcome.staged", 1);
        self.manager.events().emit(SessionEvent::WelcomeStaged {
            staging_id: record.staging_id.to_string(),
            group_id: record.group_id.clone(),
        });
        Ok(record)
    }

    /// Inspect a pending staged welcome
    ///
    /// A terminal or unknown staging id fails with `UnknownStaging`:
    /// once resolved, an id is no longer actionable. Resolved records
    /// stay enumerable through [`list`](WelcomeStaging::list) for audit.
    pub async fn inspect(&self, staging_id: &StagingId) -> SessionResult<StagedWelcome> {
        let staged = self.staged.read().await;
        staged
            .get(staging_id)
            .filter(|r| r.status == StagedStatus::Pending)
            .cloned()
            .ok_or_else(|| SessionError::UnknownStaging(staging_id.to_string()))
    }

    /// All staged welcomes, oldest first
    pub async fn list(&self) -> Vec<StagedWelcome> {
        let staged = self.staged.read().await;
        let mut all: Vec<_> = staged.values().cloned().collect();
        all.sort_by_key(|w| w.staged_at);
        all
    }

    /// Number of records in any status
    pub async fn len(&self) -> usize {
        self.staged.read().await.len()
    }

    /// Whether the staging area is empty
    pub async fn is_empty(&self) -> bool {
        self.staged.read().await.is_empty()
    }

    /// Accept a pending staged welcome, merging its key material and
    /// promoting the group to live. Returns the group id.
    ///
    /// Only a `Pending` record can be accepted; a terminal or unknown
    /// staging id fails with `UnknownStaging`. On engine failure the
    /// record stays `Pending` and the call can be retried.
    pub async fn accept(&self, staging_id: &StagingId) -> SessionResult<GroupId> {
        let mut staged = self.staged.write().await;
        let record = staged
            .get_mut(staging_id)
            .filter(|r| r.status == StagedStatus::Pending)
            .ok_or_else(|| SessionError::UnknownStaging(staging_id.to_string()))?;

        let info = self
            .manager
            .engine()
            .join_from_welcome(&record.welcome_bytes, record.ratchet_tree.as_deref())
            .await?;

        if let Err(e) = self.manager.adopt_group(&info).await {
            // Roll the engine back so retry or reject stays possible
            if let Err(cleanup) = self.manager.engine().delete_group(&info.group_id).await {
                warn!(
                    "Failed to roll back group {} after adoption failure: {}",
                    info.group_id.to_hex(),
                    cleanup
                );
            }
            return Err(e);
        }

        record.status = StagedStatus::Accepted;
        record.resolved_at = Some(now_ms());
        let group_id = info.group_id.clone();
        drop(staged);

        self.manager.record_member_sightings(&info.members).await;

        info!(
            "Accepted welcome {}: joined group {} at epoch {}",
            staging_id,
            group_id.to_hex(),
            info.epoch
        );
        record_counter("welcome.accepted", 1);
        record_counter("session.groups.joined", 1);
        self.manager.events().emit_many(vec![
            SessionEvent::WelcomeAccepted {
                staging_id: staging_id.to_string(),
                group_id: group_id.clone(),
                epoch: info.epoch,
            },
            SessionEvent::GroupJoined {
                group_id: group_id.clone(),
                epoch: info.epoch,
                member_count: info.members.len(),
            },
        ]);
        Ok(group_id)
    }

    /// Reject a pending staged welcome without touching engine state
    pub async fn reject(&self, staging_id: &StagingId) -> SessionResult<()> {
        let mut staged = self.staged.write().await;
        let record = staged
            .get_mut(staging_id)
            .filter(|r| r.status == StagedStatus::Pending)
            .ok_or_else(|| SessionError::UnknownStaging(staging_id.to_string()))?;

        record.status = StagedStatus::Rejected;
        record.resolved_at = Some(now_ms());
        drop(staged);

        debug!("Rejected staged welcome {}", staging_id);
        record_counter("welcome.rejected", 1);
        self.manager.events().emit(SessionEvent::WelcomeRejected {
            staging_id: staging_id.to_string(),
        });
        Ok(())
    }

    /// Drop pending records older than the configured staleness window.
    /// Terminal records are kept for audit. Returns the number purged.
    pub async fn purge_stale(&self) -> usize {
        let cutoff = now_ms().saturating_sub(self.stale_after.as_millis() as u64);
        let mut staged = self.staged.write().await;
        let before = staged.len();
        staged.retain(|_, r| r.status != StagedStatus::Pending || r.staged_at >= cutoff);
        let purged = before - staged.len();

        if purged > 0 {
            info!("Purged {} stale pending welcomes", purged);
            record_counter("welcome.purged", purged as u64);
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core_trust::fingerprint_of;
    use crate::engine::{CryptoEngine, InMemoryEngine};
    use crate::storage::MemoryStorage;

    fn manager(identity: &str) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Arc::new(InMemoryEngine::new(identity)),
            Arc::new(MemoryStorage::new()),
            &Config::default(),
            format!("{}-device", identity),
        ))
    }

    fn staging_for(manager: Arc<SessionManager>) -> WelcomeStaging {
        WelcomeStaging::new(manager, &Config::default().staging)
    }

    /// Alice creates a group and produces a welcome for Bob
    async fn welcome_for(bob: &SessionManager) -> (GroupId, Vec<u8>) {
        let alice = manager("alice");
        let gid = alice.create_group(None).await.unwrap();
        let bob_kp = bob.engine().generate_key_package().await.unwrap();
        let pending = alice.add_members(&gid, &[bob_kp]).await.unwrap();
        alice.merge_pending_commit(&gid).await.unwrap();
        (gid, pending.welcome_bytes.unwrap())
    }

    #[tokio::test]
    async fn test_stage_previews_without_joining() {
        let bob = manager("bob");
        let staging = staging_for(bob.clone());
        let (gid, welcome) = welcome_for(&bob).await;

        let record = staging.stage(&welcome, None).await.unwrap();
        assert_eq!(record.group_id, gid);
        assert_eq!(record.epoch, 1);
        assert_eq!(record.status, StagedStatus::Pending);
        assert_eq!(record.sender.user_id, "alice");
        assert_eq!(record.members.len(), 2);

        // Nothing joined yet
        assert_eq!(bob.group_count().await, 0);
    }

    #[tokio::test]
    async fn test_stage_rejects_garbage() {
        let bob = manager("bob");
        let staging = staging_for(bob.clone());

        let err = staging.stage(b"not a welcome", None).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
        assert!(staging.is_empty().await);
    }

    #[tokio::test]
    async fn test_accept_promotes_to_live_group() {
        let bob = manager("bob");
        let staging = staging_for(bob.clone());
        let (gid, welcome) = welcome_for(&bob).await;

        let record = staging.stage(&welcome, None).await.unwrap();
        let joined = staging.accept(&record.staging_id).await.unwrap();
        assert_eq!(joined, gid);

        let meta = bob.metadata(&gid).await.unwrap();
        assert_eq!(meta.epoch, 1);
        assert_eq!(meta.members.len(), 2);

        // The terminal record is no longer inspectable, only auditable
        let err = staging.inspect(&record.staging_id).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownStaging(_)));
        let resolved = &staging.list().await[0];
        assert_eq!(resolved.status, StagedStatus::Accepted);
        assert!(resolved.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_accept_records_trust_sightings() {
        let bob = manager("bob");
        let staging = staging_for(bob.clone());
        let (_, welcome) = welcome_for(&bob).await;

        let record = staging.stage(&welcome, None).await.unwrap();
        let alice_key = record
            .members
            .iter()
            .find(|m| m.user_id == "alice")
            .unwrap()
            .signature_key
            .clone();
        staging.accept(&record.staging_id).await.unwrap();

        let trust = bob.trust().record_of("alice").await.unwrap();
        assert_eq!(trust.fingerprint, fingerprint_of(&alice_key));
        assert!(bob.trust().record_of("bob").await.is_none());
    }

    #[tokio::test]
    async fn test_resolution_is_single_shot() {
        let bob = manager("bob");
        let staging = staging_for(bob.clone());
        let (_, welcome) = welcome_for(&bob).await;

        let record = staging.stage(&welcome, None).await.unwrap();
        staging.accept(&record.staging_id).await.unwrap();

        let err = staging.accept(&record.staging_id).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownStaging(_)));
        let err = staging.reject(&record.staging_id).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownStaging(_)));
        let err = staging.inspect(&record.staging_id).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownStaging(_)));
    }

    #[tokio::test]
    async fn test_reject_never_touches_engine() {
        let bob = manager("bob");
        let staging = staging_for(bob.clone());
        let (gid, welcome) = welcome_for(&bob).await;

        let record = staging.stage(&welcome, None).await.unwrap();
        staging.reject(&record.staging_id).await.unwrap();

        assert_eq!(bob.group_count().await, 0);
        assert!(matches!(
            bob.metadata(&gid).await.unwrap_err(),
            SessionError::UnknownGroup(_)
        ));
        assert_eq!(staging.list().await[0].status, StagedStatus::Rejected);
    }

    #[tokio::test]
    async fn test_unknown_staging_id() {
        let bob = manager("bob");
        let staging = staging_for(bob.clone());

        let err = staging.accept(&StagingId::generate()).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownStaging(_)));
    }

    #[tokio::test]
    async fn test_accept_emits_events() {
        let bob = manager("bob");
        let staging = staging_for(bob.clone());
        let (gid, welcome) = welcome_for(&bob).await;
        let mut rx = bob.subscribe();

        let record = staging.stage(&welcome, None).await.unwrap();
        staging.accept(&record.staging_id).await.unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::WelcomeStaged { .. }
        ));
        match rx.recv().await.unwrap() {
            SessionEvent::WelcomeAccepted {
                group_id, epoch, ..
            } => {
                assert_eq!(group_id, gid);
                assert_eq!(epoch, 1);
            }
            other => panic!("expected WelcomeAccepted, got {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::GroupJoined { .. }
        ));
    }

    #[tokio::test]
    async fn test_purge_drops_only_stale_pending() {
        let bob = manager("bob");
        let mut config = Config::default();
        config.staging.stale_after = Duration::from_millis(0);
        let staging = WelcomeStaging::new(bob.clone(), &config.staging);
        let (_, welcome) = welcome_for(&bob).await;

        let accepted = staging.stage(&welcome, None).await.unwrap();
        staging.accept(&accepted.staging_id).await.unwrap();

        // A second staged welcome for another group stays pending
        let (_, welcome2) = welcome_for(&bob).await;
        let pending = staging.stage(&welcome2, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let purged = staging.purge_stale().await;
        assert_eq!(purged, 1);

        // Terminal record survives for audit, stale pending is gone
        let remaining = staging.list().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].staging_id, accepted.staging_id);
        assert!(remaining.iter().all(|w| w.staging_id != pending.staging_id));
    }
}
