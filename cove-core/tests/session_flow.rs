//! End-to-end session flows across multiple managers

use cove_core::config::Config;
use cove_core::core_convo::ConversationStore;
use cove_core::core_session::{Processed, SessionEvent};
use cove_core::{
    CryptoEngine, InMemoryEngine, MemoryStorage, SessionError, SessionManager, TrustStatus,
    WelcomeStaging,
};
use std::sync::Arc;

fn manager(identity: &str) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(
        Arc::new(InMemoryEngine::new(identity)),
        Arc::new(MemoryStorage::new()),
        &Config::default(),
        format!("{}-device", identity),
    ))
}

fn staging_for(manager: &Arc<SessionManager>) -> WelcomeStaging {
    WelcomeStaging::new(manager.clone(), &Config::default().staging)
}

async fn key_package_of(manager: &Arc<SessionManager>) -> Vec<u8> {
    manager.engine().generate_key_package().await.unwrap()
}

/// The full admission path: a group that has already advanced a few
/// epochs invites a new member, who inspects the staged welcome before
/// merging anything, accepts once, and lands at the live epoch with
/// trust records for every existing member.
#[tokio::test]
async fn welcome_admission_end_to_end() {
    let alice = manager("alice");
    let bob = manager("bob");
    let carol = manager("carol");

    // Alice and Bob advance the group to epoch 2
    let gid = alice.create_group(None).await.unwrap();
    let pending = alice
        .add_members(&gid, &[key_package_of(&bob).await])
        .await
        .unwrap();
    alice.merge_pending_commit(&gid).await.unwrap();
    let bob_info = bob
        .engine()
        .join_from_welcome(&pending.welcome_bytes.unwrap(), None)
        .await
        .unwrap();
    assert_eq!(bob_info.epoch, 1);

    let update = alice.self_update(&gid).await.unwrap();
    alice.merge_pending_commit(&gid).await.unwrap();
    bob.engine()
        .process_commit(&gid, &update.commit_bytes)
        .await
        .unwrap();

    // Carol is invited at epoch 3
    let invite = alice
        .add_members(&gid, &[key_package_of(&carol).await])
        .await
        .unwrap();
    alice.merge_pending_commit(&gid).await.unwrap();
    assert_eq!(invite.new_epoch, 3);

    // Stage: inspectable preview, no engine mutation
    let staging = staging_for(&carol);
    let record = staging
        .stage(&invite.welcome_bytes.unwrap(), None)
        .await
        .unwrap();
    assert_eq!(record.group_id, gid);
    assert_eq!(record.epoch, 3);
    assert_eq!(record.sender.user_id, "alice");
    assert_eq!(record.members.len(), 3);
    assert_eq!(carol.group_count().await, 0);

    // Accept: live group at the staged epoch
    let joined = staging.accept(&record.staging_id).await.unwrap();
    assert_eq!(joined, gid);
    let meta = carol.metadata(&gid).await.unwrap();
    assert_eq!(meta.epoch, 3);
    assert_eq!(meta.members.len(), 3);

    // Trust-on-first-use records for both existing members, none for self
    assert_eq!(carol.trust().status_of("alice").await, TrustStatus::Unverified);
    assert!(carol.trust().record_of("alice").await.is_some());
    assert!(carol.trust().record_of("bob").await.is_some());
    assert!(carol.trust().record_of("carol").await.is_none());

    // Resolution is single-shot
    let err = staging.accept(&record.staging_id).await.unwrap_err();
    assert!(matches!(err, SessionError::UnknownStaging(_)));
}

/// Many tasks race to stage a commit on the same group; exactly one
/// wins, the rest observe the conflict.
#[tokio::test]
async fn concurrent_commit_staging_has_single_winner() {
    let alice = manager("alice");
    let gid = alice.create_group(None).await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let alice = alice.clone();
            let gid = gid.clone();
            tokio::spawn(async move { alice.self_update(&gid).await })
        })
        .collect();
    let results = futures::future::join_all(tasks).await;

    let mut staged = 0;
    let mut conflicts = 0;
    for result in results {
        match result.unwrap() {
            Ok(_) => staged += 1,
            Err(SessionError::PendingCommitConflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(staged, 1);
    assert_eq!(conflicts, 7);

    // The winner's commit is mergeable
    assert_eq!(alice.merge_pending_commit(&gid).await.unwrap(), 1);
}

/// After recovery the recovering member holds a fresh leaf and every
/// other member converges by applying the broadcast commit.
#[tokio::test]
async fn fork_recovery_converges_all_members() {
    let alice = manager("alice");
    let bob = manager("bob");

    let gid = alice.create_group(None).await.unwrap();
    let pending = alice
        .add_members(&gid, &[key_package_of(&bob).await])
        .await
        .unwrap();
    alice.merge_pending_commit(&gid).await.unwrap();
    let info = bob
        .engine()
        .join_from_welcome(&pending.welcome_bytes.unwrap(), None)
        .await
        .unwrap();
    bob.restore_group(&bob.engine().export_group_state(&info.group_id).await.unwrap())
        .await
        .unwrap();

    let recovered = bob.recover_fork_by_readding(&gid).await.unwrap();
    alice
        .process_commit(&gid, "recovery-commit", &recovered.commit_bytes)
        .await
        .unwrap();

    let alice_meta = alice.metadata(&gid).await.unwrap();
    let bob_meta = bob.metadata(&gid).await.unwrap();
    assert_eq!(alice_meta.epoch, bob_meta.epoch);
    assert_eq!(alice_meta.members.len(), 2);
    assert_eq!(bob_meta.members.len(), 2);

    let leaf_at = |meta: &cove_core::core_session::GroupMetadata, who: &str| {
        meta.members
            .iter()
            .find(|m| m.user_id == who)
            .map(|m| m.leaf_index)
    };
    assert_eq!(leaf_at(&alice_meta, "bob"), leaf_at(&bob_meta, "bob"));

    // Messages flow again after recovery
    let ciphertext = bob.send_message(&gid, b"back online").await.unwrap();
    let applied = alice
        .process_application_message(&gid, "msg-after-recovery", &ciphertext)
        .await
        .unwrap();
    assert!(applied.is_applied());
}

/// Redelivered ciphertext reaches the conversation store exactly once.
#[tokio::test]
async fn duplicate_delivery_yields_single_timeline_entry() {
    let alice = manager("alice");
    let bob = manager("bob");

    let gid = alice.create_group(None).await.unwrap();
    let pending = alice
        .add_members(&gid, &[key_package_of(&bob).await])
        .await
        .unwrap();
    alice.merge_pending_commit(&gid).await.unwrap();
    let info = bob
        .engine()
        .join_from_welcome(&pending.welcome_bytes.unwrap(), None)
        .await
        .unwrap();
    bob.restore_group(&bob.engine().export_group_state(&info.group_id).await.unwrap())
        .await
        .unwrap();

    let store = ConversationStore::default();
    let mut rx = bob.subscribe();

    let ciphertext = alice.send_message(&gid, b"hello").await.unwrap();
    let first = bob
        .process_application_message(&gid, "m-1", &ciphertext)
        .await
        .unwrap();
    assert!(first.is_applied());

    // Transport retries the same delivery
    let second = bob
        .process_application_message(&gid, "m-1", &ciphertext)
        .await
        .unwrap();
    assert_eq!(second, Processed::Duplicate);

    // Only one MessageReceived was emitted, so one timeline entry
    while let Ok(event) = rx.try_recv() {
        store.apply_session_event(&event).await.unwrap();
    }
    let timeline = store.messages(&gid.to_hex()).await;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].body, "hello");
}

/// Rebooting a compromised group re-invites members under a fresh id;
/// the invitee lands there through the normal staged-welcome path and
/// the old conversation goes stale.
#[tokio::test]
async fn group_reboot_end_to_end() {
    let alice = manager("alice");
    let bob = manager("bob");

    let gid = alice.create_group(None).await.unwrap();
    let pending = alice
        .add_members(&gid, &[key_package_of(&bob).await])
        .await
        .unwrap();
    alice.merge_pending_commit(&gid).await.unwrap();
    bob.engine()
        .join_from_welcome(&pending.welcome_bytes.unwrap(), None)
        .await
        .unwrap();

    let store = ConversationStore::default();
    let mut rx = alice.subscribe();

    let (new_gid, welcome) = alice
        .reboot_group(&gid, &[key_package_of(&bob).await], b"rebooted")
        .await
        .unwrap();
    assert_ne!(new_gid, gid);
    assert!(matches!(
        alice.metadata(&gid).await.unwrap_err(),
        SessionError::UnknownGroup(_)
    ));

    let staging = staging_for(&bob);
    let record = staging.stage(&welcome.unwrap(), None).await.unwrap();
    assert_eq!(record.group_id, new_gid);
    staging.accept(&record.staging_id).await.unwrap();
    assert_eq!(bob.metadata(&new_gid).await.unwrap().members.len(), 2);

    // Old conversation goes stale, new one appears
    store.upsert_conversation(&gid.to_hex(), "team").await;
    while let Ok(event) = rx.try_recv() {
        store.apply_session_event(&event).await.unwrap();
    }
    assert!(store.conversation(&gid.to_hex()).await.unwrap().is_stale);
    assert!(store.conversation(&new_gid.to_hex()).await.is_some());
}

/// Fingerprint change across a reinstall is detected on the next
/// membership observation and surfaced as an advisory event.
#[tokio::test]
async fn reinstalled_contact_flags_fingerprint_change() {
    let alice = manager("alice");
    let bob = manager("bob");

    let gid = alice.create_group(None).await.unwrap();
    alice
        .add_members(&gid, &[key_package_of(&bob).await])
        .await
        .unwrap();
    alice.merge_pending_commit(&gid).await.unwrap();
    assert_eq!(alice.trust().status_of("bob").await, TrustStatus::Unverified);
    assert!(alice.trust().verify("bob").await);

    // Bob reinstalls: same user id, fresh signature key
    let bob_again = manager("bob");
    let mut rx = alice.subscribe();
    alice
        .add_members(&gid, &[key_package_of(&bob_again).await])
        .await
        .unwrap();
    alice.merge_pending_commit(&gid).await.unwrap();

    assert_eq!(alice.trust().status_of("bob").await, TrustStatus::Changed);
    let record = alice.trust().record_of("bob").await.unwrap();
    assert!(record.previous_fingerprint.is_some());
    // The earlier verification stays inspectable
    assert!(record.verified_at.is_some());

    let mut saw_change = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, SessionEvent::TrustChanged { .. }) {
            saw_change = true;
        }
    }
    assert!(saw_change);
}

mod properties {
    use cove_core::core_convo::{ChatMessage, ConversationStore};
    use proptest::prelude::*;

    proptest! {
        /// Whatever the arrival order, a timeline reads back sorted by
        /// timestamp with no message lost.
        #[test]
        fn timeline_is_always_timestamp_ordered(timestamps in prop::collection::vec(0u64..10_000, 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            runtime.block_on(async {
                let store = ConversationStore::default();
                for (i, created_at) in timestamps.iter().enumerate() {
                    store
                        .append_message(ChatMessage {
                            id: format!("m{}", i),
                            conversation_id: "c1".to_string(),
                            sender: "alice".to_string(),
                            body: String::new(),
                            created_at: *created_at,
                            client_id: None,
                            pending: false,
                        })
                        .await
                        .unwrap();
                }

                let timeline = store.messages("c1").await;
                assert_eq!(timeline.len(), timestamps.len());
                assert!(timeline.windows(2).all(|w| w[0].created_at <= w[1].created_at));
            });
        }
    }
}
