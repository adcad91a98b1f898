//! Contact fingerprint records and the TOFU store

use super::fingerprint::Fingerprint;
use crate::core_session::types::{now_ms, UserId};
use crate::metrics::record_counter;
use crate::storage::{StorageProvider, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const TRUST_RECORDS_KEY: &str = "trust_records";

/// Verification status of a contact's fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustStatus {
    /// Seen but never explicitly verified
    Unverified,
    /// Explicitly verified by the user (out-of-band comparison)
    Verified,
    /// A sighting differed from the stored fingerprint
    Changed,
}

/// One fingerprint record per contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactFingerprintRecord {
    /// Contact user id (stable across reinstalls)
    pub contact_user_id: UserId,
    /// Currently-sighted fingerprint
    pub fingerprint: Fingerprint,
    /// Fingerprint before the last change, kept so the UI can explain
    /// why trust was revoked
    pub previous_fingerprint: Option<Fingerprint>,
    /// Current status
    pub status: TrustStatus,
    /// When the user verified this contact (Unix millis), if ever
    pub verified_at: Option<u64>,
    /// First sighting (Unix millis)
    pub first_seen_at: u64,
    /// Most recent sighting (Unix millis)
    pub last_seen_at: u64,
}

/// Result of recording a fingerprint sighting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SightingOutcome {
    /// First time this contact was seen
    pub is_new: bool,
    /// Fingerprint differs from the stored one. Advisory, never blocking.
    pub changed: bool,
    /// The fingerprint that was replaced, when `changed`
    pub previous_fingerprint: Option<Fingerprint>,
}

/// TOFU trust store, one per local identity, shared across all groups
pub struct TrustStore {
    records: RwLock<HashMap<UserId, ContactFingerprintRecord>>,
    storage: Arc<dyn StorageProvider>,
}

impl TrustStore {
    /// Create an empty trust store backed by the given storage
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            storage,
        }
    }

    /// Create a store and restore any previously persisted records
    pub async fn restore(storage: Arc<dyn StorageProvider>) -> StorageResult<Self> {
        let store = Self::new(storage);
        store.load().await?;
        Ok(store)
    }

    /// Record a fingerprint sighting for a contact
    ///
    /// First sighting: recorded as trusted-on-first-use. Equal sighting:
    /// no change. Differing sighting: stores the old value as
    /// `previous_fingerprint`, flags the record as changed, and reports
    /// `changed = true` regardless of prior verification.
    pub async fn record_sighting(
        &self,
        contact: &str,
        fingerprint: Fingerprint,
    ) -> SightingOutcome {
        record_counter("trust.sightings", 1);
        let now = now_ms();
        let mut records = self.records.write().await;

        match records.get_mut(contact) {
            None => {
                debug!("First fingerprint sighting for contact {}", contact);
                records.insert(
                    contact.to_string(),
                    ContactFingerprintRecord {
                        contact_user_id: contact.to_string(),
                        fingerprint,
                        previous_fingerprint: None,
                        status: TrustStatus::Unverified,
                        verified_at: None,
                        first_seen_at: now,
                        last_seen_at: now,
                    },
                );
                SightingOutcome {
                    is_new: true,
                    changed: false,
                    previous_fingerprint: None,
                }
            }
            Some(record) if record.fingerprint == fingerprint => {
                record.last_seen_at = now;
                SightingOutcome {
                    is_new: false,
                    changed: false,
                    previous_fingerprint: None,
                }
            }
            Some(record) => {
                warn!(
                    "Fingerprint changed for contact {} (was {}, now {})",
                    contact, record.fingerprint, fingerprint
                );
                record_counter("trust.changes", 1);

                let previous = record.fingerprint.clone();
                record.previous_fingerprint = Some(previous.clone());
                record.fingerprint = fingerprint;
                record.status = TrustStatus::Changed;
                record.last_seen_at = now;
                // verified_at is kept: the history of the earlier
                // verification stays inspectable

                SightingOutcome {
                    is_new: false,
                    changed: true,
                    previous_fingerprint: Some(previous),
                }
            }
        }
    }

    /// Mark a contact as verified by explicit user action
    ///
    /// Verification does not require the fingerprint to be unchanged;
    /// the user is asserting the *current* fingerprint is correct.
    /// Returns false for contacts without any recorded sighting.
    pub async fn verify(&self, contact: &str) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(contact) {
            Some(record) => {
                info!("Contact {} verified by user", contact);
                record_counter("trust.verifications", 1);
                record.status = TrustStatus::Verified;
                record.verified_at = Some(now_ms());
                true
            }
            None => false,
        }
    }

    /// Trust status of a contact, `Unverified` when unknown
    pub async fn status_of(&self, contact: &str) -> TrustStatus {
        let records = self.records.read().await;
        records
            .get(contact)
            .map(|r| r.status)
            .unwrap_or(TrustStatus::Unverified)
    }

    /// Full record for a contact, for UI inspection and the one-shot
    /// "copy fingerprint" value
    pub async fn record_of(&self, contact: &str) -> Option<ContactFingerprintRecord> {
        let records = self.records.read().await;
        records.get(contact).cloned()
    }

    /// All records, sorted by contact id
    pub async fn all_records(&self) -> Vec<ContactFingerprintRecord> {
        let records = self.records.read().await;
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.contact_user_id.cmp(&b.contact_user_id));
        all
    }

    /// Number of tracked contacts
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Persist all records through the storage boundary
    ///
    /// In-memory state stays authoritative; on failure the caller
    /// retries with backoff.
    pub async fn persist(&self) -> StorageResult<()> {
        let records = self.records.read().await;
        let all: Vec<_> = records.values().cloned().collect();
        let data = serde_json::to_vec(&all)
            .map_err(|e| crate::storage::StorageError::Serialization(e.to_string()))?;
        self.storage.put_blob(TRUST_RECORDS_KEY, &data).await
    }

    /// Load records from the storage boundary, replacing in-memory state
    pub async fn load(&self) -> StorageResult<()> {
        let data = match self.storage.get_blob(TRUST_RECORDS_KEY).await {
            Ok(data) => data,
            Err(crate::storage::StorageError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let all: Vec<ContactFingerprintRecord> = serde_json::from_slice(&data)
            .map_err(|e| crate::storage::StorageError::Serialization(e.to_string()))?;

        let mut records = self.records.write().await;
        records.clear();
        for record in all {
            records.insert(record.contact_user_id.clone(), record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_trust::fingerprint::fingerprint_of;
    use crate::storage::MemoryStorage;

    fn store() -> TrustStore {
        TrustStore::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_first_sighting_is_new() {
        let trust = store();
        let outcome = trust.record_sighting("bob", fingerprint_of(b"bob-key")).await;

        assert!(outcome.is_new);
        assert!(!outcome.changed);
        assert_eq!(trust.status_of("bob").await, TrustStatus::Unverified);
    }

    #[tokio::test]
    async fn test_equal_sighting_is_unchanged() {
        let trust = store();
        trust.record_sighting("bob", fingerprint_of(b"bob-key")).await;
        let outcome = trust.record_sighting("bob", fingerprint_of(b"bob-key")).await;

        assert!(!outcome.is_new);
        assert!(!outcome.changed);
    }

    #[tokio::test]
    async fn test_differing_sighting_flags_change() {
        let trust = store();
        trust.record_sighting("bob", fingerprint_of(b"old-key")).await;
        let outcome = trust.record_sighting("bob", fingerprint_of(b"new-key")).await;

        assert!(!outcome.is_new);
        assert!(outcome.changed);
        assert_eq!(
            outcome.previous_fingerprint,
            Some(fingerprint_of(b"old-key"))
        );

        let record = trust.record_of("bob").await.unwrap();
        assert_eq!(record.status, TrustStatus::Changed);
        assert_eq!(record.fingerprint, fingerprint_of(b"new-key"));
        assert_eq!(
            record.previous_fingerprint,
            Some(fingerprint_of(b"old-key"))
        );
    }

    #[tokio::test]
    async fn test_verify_sets_status_regardless_of_change() {
        let trust = store();
        trust.record_sighting("bob", fingerprint_of(b"old-key")).await;
        trust.record_sighting("bob", fingerprint_of(b"new-key")).await;
        assert_eq!(trust.status_of("bob").await, TrustStatus::Changed);

        assert!(trust.verify("bob").await);
        assert_eq!(trust.status_of("bob").await, TrustStatus::Verified);
        assert!(trust.record_of("bob").await.unwrap().verified_at.is_some());
    }

    #[tokio::test]
    async fn test_change_after_verify_preserves_history() {
        let trust = store();
        trust.record_sighting("bob", fingerprint_of(b"key-1")).await;
        trust.verify("bob").await;
        let verified_at = trust.record_of("bob").await.unwrap().verified_at;

        let outcome = trust.record_sighting("bob", fingerprint_of(b"key-2")).await;
        assert!(outcome.changed);

        let record = trust.record_of("bob").await.unwrap();
        assert_eq!(record.status, TrustStatus::Changed);
        // The earlier verification timestamp is not erased
        assert_eq!(record.verified_at, verified_at);
        assert_eq!(record.previous_fingerprint, Some(fingerprint_of(b"key-1")));
    }

    #[tokio::test]
    async fn test_verify_unknown_contact_is_noop() {
        let trust = store();
        assert!(!trust.verify("nobody").await);
        assert_eq!(trust.status_of("nobody").await, TrustStatus::Unverified);
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let storage: Arc<dyn StorageProvider> = Arc::new(MemoryStorage::new());
        let trust = TrustStore::new(storage.clone());
        trust.record_sighting("bob", fingerprint_of(b"bob-key")).await;
        trust.verify("bob").await;
        trust.persist().await.unwrap();

        let restored = TrustStore::restore(storage).await.unwrap();
        assert_eq!(restored.len().await, 1);
        assert_eq!(restored.status_of("bob").await, TrustStatus::Verified);
    }
}
