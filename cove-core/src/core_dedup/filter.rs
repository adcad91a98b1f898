//! Bounded processed-message filter

use crate::config::DedupConfig;
use crate::metrics::{record_counter, record_gauge};
use crate::storage::{StorageError, StorageProvider, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

const PROCESSED_MESSAGES_KEY: &str = "processed_messages";

/// Record of an applied message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMessageRecord {
    /// Message identifier assigned by the transport
    pub message_id: String,
    /// Local device that applied the message. Scopes records so
    /// multiple devices sharing storage do not cross-contaminate.
    pub device_id: String,
    /// When the message was applied (Unix millis)
    pub timestamp: u64,
}

/// Bounded deduplication filter, shared across all groups
///
/// Holds at most `max_entries` records; exceeding that evicts
/// oldest-by-timestamp down to `keep_entries`. The filter is bound to
/// one device: its records persist under a device-scoped key, and a
/// load never adopts records another device applied.
pub struct DedupFilter {
    records: RwLock<HashMap<String, ProcessedMessageRecord>>,
    device_id: String,
    max_entries: usize,
    keep_entries: usize,
}

impl DedupFilter {
    /// Create a filter for the given device with the configured bounds
    pub fn new(config: &DedupConfig, device_id: impl Into<String>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            device_id: device_id.into(),
            max_entries: config.max_entries,
            keep_entries: config.keep_entries,
        }
    }

    /// The device whose applied messages this filter tracks
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn storage_key(&self) -> String {
        format!("{}/{}", PROCESSED_MESSAGES_KEY, self.device_id)
    }

    /// Whether a message was already applied on this device
    pub async fn is_processed(&self, message_id: &str) -> bool {
        let records = self.records.read().await;
        records.contains_key(message_id)
    }

    /// Record a message as applied. Idempotent: marking the same id
    /// twice leaves the original record in place.
    pub async fn mark_processed(&self, message_id: &str, now: u64) {
        let mut records = self.records.write().await;
        if records.contains_key(message_id) {
            return;
        }

        records.insert(
            message_id.to_string(),
            ProcessedMessageRecord {
                message_id: message_id.to_string(),
                device_id: self.device_id.clone(),
                timestamp: now,
            },
        );

        if records.len() > self.max_entries {
            let evicted = records.len() - self.keep_entries;
            let mut all: Vec<ProcessedMessageRecord> = records.drain().map(|(_, r)| r).collect();
            // Most recent by timestamp survive eviction
            all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            all.truncate(self.keep_entries);
            for record in all {
                records.insert(record.message_id.clone(), record);
            }

            debug!("Dedup filter evicted {} records", evicted);
            record_counter("dedup.evictions", 1);
        }

        record_gauge("dedup.entries", records.len() as f64);
    }

    /// Number of records held
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the filter is empty
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Persist records under this device's key
    pub async fn persist(&self, storage: &dyn StorageProvider) -> StorageResult<()> {
        let records = self.records.read().await;
        let all: Vec<_> = records.values().cloned().collect();
        let data = serde_json::to_vec(&all)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        storage.put_blob(&self.storage_key(), &data).await
    }

    /// Restore this device's records from the storage boundary
    ///
    /// Records stamped with a different device id are dropped; a
    /// message another device applied was never applied here.
    pub async fn load(&self, storage: &dyn StorageProvider) -> StorageResult<()> {
        let data = match storage.get_blob(&self.storage_key()).await {
            Ok(data) => data,
            Err(StorageError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let all: Vec<ProcessedMessageRecord> = serde_json::from_slice(&data)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let mut records = self.records.write().await;
        records.clear();
        for record in all {
            if record.device_id == self.device_id {
                records.insert(record.message_id.clone(), record);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn filter(device_id: &str) -> DedupFilter {
        DedupFilter::new(&DedupConfig::default(), device_id)
    }

    #[tokio::test]
    async fn test_mark_and_check() {
        let dedup = filter("device-a");
        assert!(!dedup.is_processed("m1").await);

        dedup.mark_processed("m1", 100).await;
        assert!(dedup.is_processed("m1").await);
        assert!(!dedup.is_processed("m2").await);
    }

    #[tokio::test]
    async fn test_mark_is_idempotent() {
        let dedup = filter("device-a");
        dedup.mark_processed("m1", 100).await;
        dedup.mark_processed("m1", 200).await;

        assert_eq!(dedup.len().await, 1);
    }

    #[tokio::test]
    async fn test_eviction_keeps_most_recent() {
        let dedup = filter("device-a");

        // 2000 records fit without eviction
        for i in 0..2000u64 {
            dedup.mark_processed(&format!("m{}", i), i).await;
        }
        assert_eq!(dedup.len().await, 2000);

        // The 2001st trims down to exactly 1000, most recent by timestamp
        dedup.mark_processed("m2000", 2000).await;
        assert_eq!(dedup.len().await, 1000);

        assert!(dedup.is_processed("m2000").await);
        assert!(dedup.is_processed("m1001").await);
        assert!(!dedup.is_processed("m1000").await);
        assert!(!dedup.is_processed("m0").await);
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let storage = MemoryStorage::new();
        let dedup = filter("device-a");
        dedup.mark_processed("m1", 100).await;
        dedup.persist(&storage).await.unwrap();

        let restored = filter("device-a");
        restored.load(&storage).await.unwrap();
        assert!(restored.is_processed("m1").await);
        assert_eq!(restored.len().await, 1);
    }

    #[tokio::test]
    async fn test_devices_sharing_storage_stay_isolated() {
        let storage = MemoryStorage::new();

        let first = filter("device-a");
        first.mark_processed("m1", 100).await;
        first.persist(&storage).await.unwrap();

        let second = filter("device-b");
        second.mark_processed("m2", 200).await;
        second.persist(&storage).await.unwrap();

        // Neither device's persist clobbered the other's, and neither
        // load adopts messages it never applied
        let restored_a = filter("device-a");
        restored_a.load(&storage).await.unwrap();
        assert!(restored_a.is_processed("m1").await);
        assert!(!restored_a.is_processed("m2").await);

        let restored_b = filter("device-b");
        restored_b.load(&storage).await.unwrap();
        assert!(restored_b.is_processed("m2").await);
        assert!(!restored_b.is_processed("m1").await);
    }

    #[tokio::test]
    async fn test_load_missing_blob_is_empty() {
        let storage = MemoryStorage::new();
        let dedup = filter("device-a");
        dedup.load(&storage).await.unwrap();
        assert!(dedup.is_empty().await);
    }
}
