//! Group session orchestration
//!
//! The session manager owns the lifecycle of every live group on this
//! device. It drives the opaque crypto engine through group creation,
//! membership commits, proposal queues, inbound message application and
//! recovery paths, and publishes [`SessionEvent`]s so the conversation
//! store and UI layers never poll.
//!
//! Responsibilities:
//! - Per-group serialization of engine-mutating calls
//! - Single-pending-commit discipline (stage, then merge or discard)
//! - At-most-once application of inbound commits/proposals/messages
//! - Fingerprint sightings on every membership observation
//! - Fork recovery and wholesale group reboot

pub mod errors;
pub mod events;
pub mod manager;
pub mod types;

pub use errors::{SessionError, SessionResult};
pub use events::{EventBroadcaster, SessionEvent};
pub use manager::{Processed, SessionManager};
pub use types::{
    CiphersuiteId, GroupId, GroupMetadata, MemberInfo, PendingCommit, UserId,
    DEFAULT_CIPHERSUITE,
};
