//! At-most-once message application
//!
//! Inbound commits, proposals and application messages are checked
//! against this filter before the session manager touches them, so
//! duplicate delivery (retransmission, multi-tab, reconnect replay)
//! never double-applies a state transition.
//!
//! This is a liveness/idempotence mechanism, not a security boundary:
//! an adversary controlling delivery cannot use it to suppress
//! legitimate messages, since suppression is indistinguishable from
//! ordinary network loss and handled by the transport layer.

mod filter;

pub use filter::{DedupFilter, ProcessedMessageRecord};
