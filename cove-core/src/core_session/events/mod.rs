//! Session events published to other subsystems
//!
//! The conversation store and UI layers react to these instead of
//! polling group state.

mod broadcaster;

pub use broadcaster::EventBroadcaster;

use crate::core_session::types::{GroupId, UserId};

/// Events emitted by the session layer
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Group was created locally
    GroupCreated { group_id: GroupId, epoch: u64 },

    /// Joined a group (via welcome acceptance or external commit)
    GroupJoined {
        group_id: GroupId,
        epoch: u64,
        member_count: usize,
    },

    /// Removed from a group (observed in a remote commit)
    GroupLeft { group_id: GroupId, final_epoch: u64 },

    /// Epoch advanced (commit merged or remote commit applied)
    EpochChanged {
        group_id: GroupId,
        old_epoch: u64,
        new_epoch: u64,
    },

    /// A local commit was staged and awaits merge or discard
    CommitStaged { group_id: GroupId, new_epoch: u64 },

    /// The staged local commit was merged
    CommitMerged { group_id: GroupId, epoch: u64 },

    /// The staged local commit was discarded
    CommitDiscarded { group_id: GroupId },

    /// A proposal was queued (local or remote)
    ProposalQueued { group_id: GroupId, epoch: u64 },

    /// Application message received and decrypted
    MessageReceived {
        group_id: GroupId,
        message_id: String,
        sender_id: UserId,
        epoch: u64,
        plaintext: Vec<u8>,
    },

    /// A welcome was staged for inspection
    WelcomeStaged {
        staging_id: String,
        group_id: GroupId,
    },

    /// A staged welcome was accepted and promoted to a live group
    WelcomeAccepted {
        staging_id: String,
        group_id: GroupId,
        epoch: u64,
    },

    /// A staged welcome was rejected without touching engine state
    WelcomeRejected { staging_id: String },

    /// A contact's fingerprint changed. Advisory only, never blocks
    /// message flow.
    TrustChanged {
        contact: UserId,
        previous_fingerprint: String,
        current_fingerprint: String,
    },

    /// Fork recovered by removing own leaves and re-adding self
    ForkRecovered { group_id: GroupId, epoch: u64 },

    /// Group replaced wholesale under a new identifier
    GroupRebooted {
        old_group_id: GroupId,
        new_group_id: GroupId,
    },
}

impl SessionEvent {
    /// Group this event concerns, if any
    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            SessionEvent::GroupCreated { group_id, .. }
            | SessionEvent::GroupJoined { group_id, .. }
            | SessionEvent::GroupLeft { group_id, .. }
            | SessionEvent::EpochChanged { group_id, .. }
            | SessionEvent::CommitStaged { group_id, .. }
            | SessionEvent::CommitMerged { group_id, .. }
            | SessionEvent::CommitDiscarded { group_id }
            | SessionEvent::ProposalQueued { group_id, .. }
            | SessionEvent::MessageReceived { group_id, .. }
            | SessionEvent::WelcomeStaged { group_id, .. }
            | SessionEvent::WelcomeAccepted { group_id, .. } => Some(group_id),
            SessionEvent::GroupRebooted { new_group_id, .. } => Some(new_group_id),
            SessionEvent::ForkRecovered { group_id, .. } => Some(group_id),
            SessionEvent::WelcomeRejected { .. } | SessionEvent::TrustChanged { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_group_id() {
        let gid = GroupId::new(vec![1, 2, 3]);
        let event = SessionEvent::GroupCreated {
            group_id: gid.clone(),
            epoch: 0,
        };
        assert_eq!(event.group_id(), Some(&gid));

        let event = SessionEvent::TrustChanged {
            contact: "bob".to_string(),
            previous_fingerprint: "aa".to_string(),
            current_fingerprint: "bb".to_string(),
        };
        assert_eq!(event.group_id(), None);
    }
}
