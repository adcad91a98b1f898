//! Event broadcasting for session state changes

use super::SessionEvent;
use tokio::sync::broadcast;

/// Event broadcaster for session events
///
/// Uses tokio broadcast channels to emit events to multiple subscribers,
/// so the conversation store and UI bridges can react to state changes.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBroadcaster {
    /// Create a new event broadcaster
    ///
    /// # Arguments
    /// * `capacity` - Channel capacity (number of events buffered)
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers
    ///
    /// Returns the number of active subscribers that received the event.
    pub fn emit(&self, event: SessionEvent) -> usize {
        match self.tx.send(event) {
            Ok(count) => count,
            Err(_) => 0, // No active receivers
        }
    }

    /// Emit multiple events
    pub fn emit_many(&self, events: Vec<SessionEvent>) {
        for event in events {
            let _ = self.emit(event);
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}
