//! Two-phase welcome admission
//!
//! An inbound welcome is never merged on arrival. It is staged: parsed
//! into an inspectable preview (group id, epoch, sender, membership)
//! with zero engine mutation, and held until the user accepts or
//! rejects it. Acceptance merges the key material and promotes the
//! group to live; rejection marks the record terminal without ever
//! touching the engine. Each staged welcome resolves exactly once.

mod staging;

pub use staging::{StagedStatus, StagedWelcome, StagingId, WelcomeStaging};
