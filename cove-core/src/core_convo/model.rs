//! Conversation store data model

use crate::core_session::types::UserId;
use serde::{Deserialize, Serialize};

/// A conversation in the sidebar, usually backed by one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation identifier (the group id in hex for group-backed
    /// conversations)
    pub conversation_id: String,
    /// Display title
    pub title: String,
    /// Created timestamp (Unix millis)
    pub created_at: u64,
    /// Timestamp of the newest message, if any (Unix millis)
    pub last_message_at: Option<u64>,
    /// Messages appended while the conversation was not selected
    pub unread_count: usize,
    /// Backing group is gone (left, removed, or rebooted away);
    /// the timeline stays readable but sending is pointless
    pub is_stale: bool,
}

/// One message in a conversation timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message identifier. For pending local sends this is the client
    /// id until the transport acks with a server-assigned id.
    pub id: String,
    pub conversation_id: String,
    pub sender: UserId,
    pub body: String,
    /// Ordering key within the timeline (Unix millis)
    pub created_at: u64,
    /// Client-assigned id used to reconcile the transport ack with the
    /// optimistically appended message
    pub client_id: Option<String>,
    /// Still awaiting the transport ack
    pub pending: bool,
}

/// Severity of a diagnostic entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
}

/// A bounded-feed diagnostic entry surfaced to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub level: DiagnosticLevel,
    /// Conversation the entry concerns, if any
    pub conversation_id: Option<String>,
    pub detail: String,
    /// When the entry was recorded (Unix millis)
    pub at: u64,
}

/// Store change notifications for view layers
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A conversation was created or its metadata changed
    ConversationUpserted { conversation_id: String },
    /// A message landed in a timeline
    MessageAppended {
        conversation_id: String,
        message_id: String,
    },
    /// A pending local send was reconciled with its transport ack
    MessageAcked {
        conversation_id: String,
        client_id: String,
        message_id: String,
    },
    /// A conversation was marked read
    ConversationRead { conversation_id: String },
    /// A conversation went stale or recovered
    ConversationStale {
        conversation_id: String,
        is_stale: bool,
    },
    /// A diagnostic entry was recorded
    DiagnosticRecorded { level: DiagnosticLevel },
}
