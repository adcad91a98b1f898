//! cove-core - Session orchestration for E2EE group messaging
//!
//! Coordinates an opaque group-key-agreement engine through:
//! - Group lifecycle (create/join/add/remove/update/leave, fork recovery)
//! - Two-phase welcome admission (stage/inspect/accept/reject)
//! - Trust-On-First-Use fingerprint tracking
//! - At-most-once message application (bounded dedup filter)
//! - A reactive conversation store consumed by the UI

pub mod config;
pub mod logging;
pub mod metrics;
pub mod shutdown;
pub mod storage;

pub mod engine;

pub mod core_convo;
pub mod core_dedup;
pub mod core_session;
pub mod core_trust;
pub mod core_welcome;

// Re-export commonly used types
pub use config::Config;
pub use core_convo::{ConversationStore, DiagnosticEvent, DiagnosticLevel, StoreEvent};
pub use core_dedup::DedupFilter;
pub use core_session::{
    GroupId, SessionError, SessionEvent, SessionManager, SessionResult,
};
pub use core_trust::{fingerprint_of, Fingerprint, TrustStatus, TrustStore};
pub use core_welcome::{StagedStatus, StagedWelcome, StagingId, WelcomeStaging};
pub use engine::{CryptoEngine, InMemoryEngine};
pub use logging::{init_logging, LogLevel};
pub use storage::{FileStorage, MemoryStorage, StorageProvider};
