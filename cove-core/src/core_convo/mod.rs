//! Reactive conversation store
//!
//! UI-facing projection of session state: conversations, their
//! timestamp-ordered message timelines, unread counts, pending-send
//! reconciliation and a bounded diagnostics feed. The store consumes
//! [`SessionEvent`]s and emits [`StoreEvent`]s of its own, so view
//! layers subscribe instead of polling.
//!
//! [`SessionEvent`]: crate::core_session::SessionEvent

mod model;
mod store;

pub use model::{
    ChatMessage, Conversation, DiagnosticEvent, DiagnosticLevel, StoreEvent,
};
pub use store::ConversationStore;
