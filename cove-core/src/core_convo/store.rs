//! The conversation store

use super::model::{
    ChatMessage, Conversation, DiagnosticEvent, DiagnosticLevel, StoreEvent,
};
use crate::core_session::errors::{SessionError, SessionResult};
use crate::core_session::types::now_ms;
use crate::core_session::SessionEvent;
use crate::metrics::record_counter;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Diagnostic feed capacity; oldest entries fall off
const DIAGNOSTIC_CAPACITY: usize = 100;

/// Reactive store of conversations, timelines and diagnostics
pub struct ConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
    messages: RwLock<HashMap<String, Vec<ChatMessage>>>,
    diagnostics: RwLock<VecDeque<DiagnosticEvent>>,
    selected: RwLock<Option<String>>,
    events: broadcast::Sender<StoreEvent>,
}

impl ConversationStore {
    /// Create a store with the given event channel capacity
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer);
        Self {
            conversations: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            diagnostics: RwLock::new(VecDeque::with_capacity(DIAGNOSTIC_CAPACITY)),
            selected: RwLock::new(None),
            events,
        }
    }

    /// Subscribe to store change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    /// Create a conversation or update its title
    pub async fn upsert_conversation(&self, conversation_id: &str, title: &str) {
        let mut conversations = self.conversations.write().await;
        match conversations.get_mut(conversation_id) {
            Some(conversation) => {
                conversation.title = title.to_string();
            }
            None => {
                conversations.insert(
                    conversation_id.to_string(),
                    Conversation {
                        conversation_id: conversation_id.to_string(),
                        title: title.to_string(),
                        created_at: now_ms(),
                        last_message_at: None,
                        unread_count: 0,
                        is_stale: false,
                    },
                );
            }
        }
        drop(conversations);
        self.emit(StoreEvent::ConversationUpserted {
            conversation_id: conversation_id.to_string(),
        });
    }

    /// Append a message to its conversation's timeline
    ///
    /// The timeline is ordered by `created_at`; out-of-order arrivals
    /// are inserted at their timestamp position, ties keep arrival
    /// order. Duplicate message ids are rejected before anything is
    /// touched, so a redelivery changes neither the timeline nor the
    /// conversation metadata. The conversation is created on demand.
    pub async fn append_message(&self, message: ChatMessage) -> SessionResult<()> {
        let conversation_id = message.conversation_id.clone();
        let message_id = message.id.clone();
        let created_at = message.created_at;

        {
            let mut all = self.messages.write().await;
            let timeline = all.entry(conversation_id.clone()).or_default();
            if timeline.iter().any(|m| m.id == message_id) {
                return Err(SessionError::InvalidInput(format!(
                    "duplicate message id {}",
                    message_id
                )));
            }
            let at = timeline.partition_point(|m| m.created_at <= created_at);
            timeline.insert(at, message);
        }

        {
            let mut conversations = self.conversations.write().await;
            let selected = self.selected.read().await;
            let conversation = conversations
                .entry(conversation_id.clone())
                .or_insert_with(|| Conversation {
                    conversation_id: conversation_id.clone(),
                    title: conversation_id.clone(),
                    created_at: now_ms(),
                    last_message_at: None,
                    unread_count: 0,
                    is_stale: false,
                });

            conversation.last_message_at = Some(
                conversation
                    .last_message_at
                    .map_or(created_at, |t| t.max(created_at)),
            );
            if selected.as_deref() != Some(conversation_id.as_str()) {
                conversation.unread_count += 1;
            }
        }

        record_counter("convo.messages.appended", 1);
        self.emit(StoreEvent::MessageAppended {
            conversation_id,
            message_id,
        });
        Ok(())
    }

    /// Reconcile a pending local send with its transport ack
    ///
    /// Finds the pending message carrying `client_id`, assigns it the
    /// server id and timestamp, and re-sorts it into place. If the
    /// optimistic append never happened (store restarted mid-send) the
    /// acked message is inserted fresh.
    pub async fn ack_pending_message(
        &self,
        conversation_id: &str,
        client_id: &str,
        server_id: &str,
        sender: &str,
        body: &str,
        created_at: u64,
    ) -> SessionResult<()> {
        let found = {
            let mut all = self.messages.write().await;
            let timeline = all.entry(conversation_id.to_string()).or_default();
            match timeline
                .iter()
                .position(|m| m.pending && m.client_id.as_deref() == Some(client_id))
            {
                Some(index) => {
                    let mut message = timeline.remove(index);
                    message.id = server_id.to_string();
                    message.created_at = created_at;
                    message.pending = false;
                    let at = timeline.partition_point(|m| m.created_at <= created_at);
                    timeline.insert(at, message);
                    true
                }
                None => false,
            }
        };

        if !found {
            debug!(
                "Ack for unknown client id {} in {}, inserting fresh",
                client_id, conversation_id
            );
            self.append_message(ChatMessage {
                id: server_id.to_string(),
                conversation_id: conversation_id.to_string(),
                sender: sender.to_string(),
                body: body.to_string(),
                created_at,
                client_id: Some(client_id.to_string()),
                pending: false,
            })
            .await?;
        }

        self.emit(StoreEvent::MessageAcked {
            conversation_id: conversation_id.to_string(),
            client_id: client_id.to_string(),
            message_id: server_id.to_string(),
        });
        Ok(())
    }

    /// Select a conversation; its unread count resets and further
    /// appends to it do not count as unread
    pub async fn select_conversation(&self, conversation_id: Option<&str>) {
        {
            let mut selected = self.selected.write().await;
            *selected = conversation_id.map(|s| s.to_string());
        }
        if let Some(id) = conversation_id {
            self.mark_read(id).await;
        }
    }

    /// Currently selected conversation
    pub async fn selected_conversation(&self) -> Option<String> {
        self.selected.read().await.clone()
    }

    /// Reset a conversation's unread count
    pub async fn mark_read(&self, conversation_id: &str) {
        let mut conversations = self.conversations.write().await;
        if let Some(conversation) = conversations.get_mut(conversation_id) {
            conversation.unread_count = 0;
            drop(conversations);
            self.emit(StoreEvent::ConversationRead {
                conversation_id: conversation_id.to_string(),
            });
        }
    }

    /// Flag a conversation whose backing group is gone
    pub async fn mark_stale(&self, conversation_id: &str, is_stale: bool) {
        let mut conversations = self.conversations.write().await;
        if let Some(conversation) = conversations.get_mut(conversation_id) {
            conversation.is_stale = is_stale;
            drop(conversations);
            self.emit(StoreEvent::ConversationStale {
                conversation_id: conversation_id.to_string(),
                is_stale,
            });
        }
    }

    /// Sidebar projection: conversations newest-activity first,
    /// optionally filtered by a case-insensitive title substring
    pub async fn sidebar(&self, filter: Option<&str>) -> Vec<Conversation> {
        let conversations = self.conversations.read().await;
        let needle = filter.map(|f| f.to_lowercase());
        let mut list: Vec<Conversation> = conversations
            .values()
            .filter(|c| match &needle {
                Some(needle) => c.title.to_lowercase().contains(needle),
                None => true,
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            b.last_message_at
                .unwrap_or(b.created_at)
                .cmp(&a.last_message_at.unwrap_or(a.created_at))
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        list
    }

    /// A conversation's metadata
    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.read().await.get(conversation_id).cloned()
    }

    /// A conversation's timeline, oldest first
    pub async fn messages(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.messages
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Record a diagnostic entry, evicting the oldest past capacity
    pub async fn record_diagnostic(
        &self,
        level: DiagnosticLevel,
        conversation_id: Option<&str>,
        detail: impl Into<String>,
    ) {
        let mut diagnostics = self.diagnostics.write().await;
        if diagnostics.len() == DIAGNOSTIC_CAPACITY {
            diagnostics.pop_front();
        }
        diagnostics.push_back(DiagnosticEvent {
            level,
            conversation_id: conversation_id.map(|s| s.to_string()),
            detail: detail.into(),
            at: now_ms(),
        });
        drop(diagnostics);

        record_counter("convo.diagnostics.recorded", 1);
        self.emit(StoreEvent::DiagnosticRecorded { level });
    }

    /// The diagnostic feed, oldest first
    pub async fn diagnostics(&self) -> Vec<DiagnosticEvent> {
        self.diagnostics.read().await.iter().cloned().collect()
    }

    /// Project a session event into the store
    ///
    /// Intended to be driven by a task draining the session manager's
    /// event subscription.
    pub async fn apply_session_event(&self, event: &SessionEvent) -> SessionResult<()> {
        match event {
            SessionEvent::GroupCreated { group_id, .. } => {
                let id = group_id.to_hex();
                self.upsert_conversation(&id, &id).await;
            }
            SessionEvent::GroupJoined { group_id, .. } => {
                let id = group_id.to_hex();
                self.upsert_conversation(&id, &id).await;
            }
            SessionEvent::MessageReceived {
                group_id,
                message_id,
                sender_id,
                plaintext,
                ..
            } => {
                self.append_message(ChatMessage {
                    id: message_id.clone(),
                    conversation_id: group_id.to_hex(),
                    sender: sender_id.clone(),
                    body: String::from_utf8_lossy(plaintext).into_owned(),
                    created_at: now_ms(),
                    client_id: None,
                    pending: false,
                })
                .await?;
            }
            SessionEvent::GroupLeft { group_id, .. } => {
                let id = group_id.to_hex();
                self.mark_stale(&id, true).await;
                self.record_diagnostic(
                    DiagnosticLevel::Info,
                    Some(&id),
                    "removed from group",
                )
                .await;
            }
            SessionEvent::GroupRebooted {
                old_group_id,
                new_group_id,
            } => {
                let old = old_group_id.to_hex();
                let new = new_group_id.to_hex();
                self.mark_stale(&old, true).await;
                self.upsert_conversation(&new, &new).await;
                self.record_diagnostic(
                    DiagnosticLevel::Info,
                    Some(&new),
                    format!("group rebooted from {}", old),
                )
                .await;
            }
            SessionEvent::TrustChanged {
                contact,
                current_fingerprint,
                ..
            } => {
                self.record_diagnostic(
                    DiagnosticLevel::Warning,
                    None,
                    format!(
                        "fingerprint changed for {} (now {})",
                        contact, current_fingerprint
                    ),
                )
                .await;
            }
            SessionEvent::ForkRecovered { group_id, epoch } => {
                self.record_diagnostic(
                    DiagnosticLevel::Info,
                    Some(&group_id.to_hex()),
                    format!("fork recovered at epoch {}", epoch),
                )
                .await;
            }
            // Epoch and commit churn is not user-facing
            _ => {}
        }
        Ok(())
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_session::types::GroupId;

    fn message(id: &str, convo: &str, created_at: u64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            conversation_id: convo.to_string(),
            sender: "alice".to_string(),
            body: format!("body of {}", id),
            created_at,
            client_id: None,
            pending: false,
        }
    }

    #[tokio::test]
    async fn test_append_creates_conversation() {
        let store = ConversationStore::default();
        store.append_message(message("m1", "c1", 100)).await.unwrap();

        let conversation = store.conversation("c1").await.unwrap();
        assert_eq!(conversation.last_message_at, Some(100));
        assert_eq!(conversation.unread_count, 1);
        assert_eq!(store.messages("c1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_arrivals_sort_by_timestamp() {
        let store = ConversationStore::default();
        store.append_message(message("m2", "c1", 200)).await.unwrap();
        store.append_message(message("m1", "c1", 100)).await.unwrap();
        store.append_message(message("m3", "c1", 300)).await.unwrap();

        let ids: Vec<String> = store
            .messages("c1")
            .await
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_arrival_order() {
        let store = ConversationStore::default();
        store.append_message(message("m1", "c1", 100)).await.unwrap();
        store.append_message(message("m2", "c1", 100)).await.unwrap();

        let timeline = store.messages("c1").await;
        assert_eq!(timeline[0].id, "m1");
        assert_eq!(timeline[1].id, "m2");
    }

    #[tokio::test]
    async fn test_duplicate_message_id_rejected() {
        let store = ConversationStore::default();
        store.append_message(message("m1", "c1", 100)).await.unwrap();

        let err = store
            .append_message(message("m1", "c1", 200))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
        assert_eq!(store.messages("c1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_append_leaves_metadata_untouched() {
        let store = ConversationStore::default();
        store.append_message(message("m1", "c1", 100)).await.unwrap();
        let before = store.conversation("c1").await.unwrap();

        // Redelivery with a later timestamp must change nothing
        store
            .append_message(message("m1", "c1", 500))
            .await
            .unwrap_err();

        let after = store.conversation("c1").await.unwrap();
        assert_eq!(after.unread_count, before.unread_count);
        assert_eq!(after.last_message_at, before.last_message_at);
        assert_eq!(store.messages("c1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_ack_reconciles_pending_send() {
        let store = ConversationStore::default();
        let mut pending = message("client-7", "c1", 100);
        pending.client_id = Some("client-7".to_string());
        pending.pending = true;
        store.append_message(pending).await.unwrap();

        store
            .ack_pending_message("c1", "client-7", "srv-42", "alice", "body", 150)
            .await
            .unwrap();

        let timeline = store.messages("c1").await;
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].id, "srv-42");
        assert_eq!(timeline[0].created_at, 150);
        assert!(!timeline[0].pending);
    }

    #[tokio::test]
    async fn test_ack_without_pending_inserts_fresh() {
        let store = ConversationStore::default();
        store
            .ack_pending_message("c1", "client-7", "srv-42", "alice", "hello", 150)
            .await
            .unwrap();

        let timeline = store.messages("c1").await;
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].id, "srv-42");
        assert_eq!(timeline[0].body, "hello");
    }

    #[tokio::test]
    async fn test_unread_and_selection() {
        let store = ConversationStore::default();
        store.append_message(message("m1", "c1", 100)).await.unwrap();
        store.append_message(message("m2", "c1", 200)).await.unwrap();
        assert_eq!(store.conversation("c1").await.unwrap().unread_count, 2);

        store.select_conversation(Some("c1")).await;
        assert_eq!(store.conversation("c1").await.unwrap().unread_count, 0);

        // Appends to the selected conversation do not count as unread
        store.append_message(message("m3", "c1", 300)).await.unwrap();
        assert_eq!(store.conversation("c1").await.unwrap().unread_count, 0);

        store.select_conversation(None).await;
        store.append_message(message("m4", "c1", 400)).await.unwrap();
        assert_eq!(store.conversation("c1").await.unwrap().unread_count, 1);
    }

    #[tokio::test]
    async fn test_sidebar_sorts_and_filters() {
        let store = ConversationStore::default();
        store.upsert_conversation("c1", "Rust study group").await;
        store.upsert_conversation("c2", "Family").await;
        store.append_message(message("m1", "c1", 100)).await.unwrap();
        store.append_message(message("m2", "c2", 200)).await.unwrap();

        let all = store.sidebar(None).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].conversation_id, "c2");
        assert_eq!(all[1].conversation_id, "c1");

        let filtered = store.sidebar(Some("rust")).await;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].conversation_id, "c1");
    }

    #[tokio::test]
    async fn test_diagnostics_feed_is_bounded() {
        let store = ConversationStore::default();
        for i in 0..(DIAGNOSTIC_CAPACITY + 10) {
            store
                .record_diagnostic(DiagnosticLevel::Info, None, format!("entry {}", i))
                .await;
        }

        let feed = store.diagnostics().await;
        assert_eq!(feed.len(), DIAGNOSTIC_CAPACITY);
        // Oldest entries fell off
        assert_eq!(feed[0].detail, "entry 10");
        assert_eq!(feed.last().unwrap().detail, format!("entry {}", DIAGNOSTIC_CAPACITY + 9));
    }

    #[tokio::test]
    async fn test_store_events_emitted() {
        let store = ConversationStore::default();
        let mut rx = store.subscribe();

        store.append_message(message("m1", "c1", 100)).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            StoreEvent::MessageAppended { .. }
        ));
    }

    #[tokio::test]
    async fn test_apply_message_received() {
        let store = ConversationStore::default();
        let gid = GroupId::new(vec![7; 4]);

        store
            .apply_session_event(&SessionEvent::MessageReceived {
                group_id: gid.clone(),
                message_id: "m1".to_string(),
                sender_id: "bob".to_string(),
                epoch: 3,
                plaintext: b"hi there".to_vec(),
            })
            .await
            .unwrap();

        let timeline = store.messages(&gid.to_hex()).await;
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].sender, "bob");
        assert_eq!(timeline[0].body, "hi there");
    }

    #[tokio::test]
    async fn test_apply_group_left_marks_stale() {
        let store = ConversationStore::default();
        let gid = GroupId::new(vec![7; 4]);
        let id = gid.to_hex();
        store.upsert_conversation(&id, "old group").await;

        store
            .apply_session_event(&SessionEvent::GroupLeft {
                group_id: gid,
                final_epoch: 5,
            })
            .await
            .unwrap();

        assert!(store.conversation(&id).await.unwrap().is_stale);
        assert_eq!(store.diagnostics().await.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_trust_changed_records_warning() {
        let store = ConversationStore::default();
        store
            .apply_session_event(&SessionEvent::TrustChanged {
                contact: "bob".to_string(),
                previous_fingerprint: "aa".to_string(),
                current_fingerprint: "bb".to_string(),
            })
            .await
            .unwrap();

        let feed = store.diagnostics().await;
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].level, DiagnosticLevel::Warning);
        assert!(feed[0].detail.contains("bob"));
    }
}
