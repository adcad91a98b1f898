//! Trust-On-First-Use identity fingerprint tracking
//!
//! One fingerprint record per contact. The first sighting is trusted,
//! later sightings with a different fingerprint flag the record as
//! changed. Change detection is advisory and never blocks message flow.
//!
//! Fingerprints are derived from signature keys, never from the stable
//! user id: the identity survives reinstalls and device switches, so
//! keying off it would make key-rotation attacks undetectable.

mod fingerprint;
mod store;

pub use fingerprint::{fingerprint_of, Fingerprint};
pub use store::{ContactFingerprintRecord, SightingOutcome, TrustStatus, TrustStore};
