//! Persistence boundary
//!
//! The session layer persists opaque blobs only: exported engine state,
//! contact fingerprint records, and the processed-message record set.
//! Implementations must ensure atomic replace (no partial state).

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::RwLock;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the storage boundary
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key not present
    #[error("Not found: {0}")]
    NotFound(String),

    /// Underlying I/O failure. Callers retry with backoff; in-memory
    /// state stays authoritative until persisted.
    #[error("Storage I/O error: {0}")]
    Io(String),

    /// Blob (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

/// Storage provider trait for opaque blob persistence
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Store a binary blob under a key, replacing atomically
    async fn put_blob(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Retrieve a binary blob by key
    ///
    /// Returns `StorageError::NotFound` if the key doesn't exist.
    async fn get_blob(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Delete a blob (missing keys are not an error)
    async fn delete_blob(&self, key: &str) -> StorageResult<()>;

    /// List all stored keys
    async fn list_keys(&self) -> StorageResult<Vec<String>>;
}

/// In-memory storage, used in tests and as a default
#[derive(Default)]
pub struct MemoryStorage {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    async fn put_blob(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> StorageResult<Vec<u8>> {
        let blobs = self.blobs.read().await;
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete_blob(&self, key: &str) -> StorageResult<()> {
        let mut blobs = self.blobs.write().await;
        blobs.remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> StorageResult<Vec<String>> {
        let blobs = self.blobs.read().await;
        Ok(blobs.keys().cloned().collect())
    }
}

/// File-backed storage: one file per key under a data directory.
///
/// Writes go to a temp file first and are renamed into place, so a
/// crash mid-write never leaves a truncated blob behind.
pub struct FileStorage {
    data_dir: PathBuf,
}

impl FileStorage {
    /// Create a file storage rooted at `data_dir` (created if missing)
    pub async fn new(data_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys may contain separators; hex keeps filenames flat and reversible
        self.data_dir.join(format!("{}.blob", hex::encode(key.as_bytes())))
    }

    fn key_for(file_name: &str) -> Option<String> {
        let stem = file_name.strip_suffix(".blob")?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[async_trait]
impl StorageProvider for FileStorage {
    async fn put_blob(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_blob(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(key) = Self::key_for(name) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();

        storage.put_blob("key1", b"value1").await.unwrap();
        assert_eq!(storage.get_blob("key1").await.unwrap(), b"value1");

        storage.delete_blob("key1").await.unwrap();
        assert!(matches!(
            storage.get_blob("key1").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_storage_overwrite() {
        let storage = MemoryStorage::new();

        storage.put_blob("key", b"v1").await.unwrap();
        storage.put_blob("key", b"v2").await.unwrap();
        assert_eq!(storage.get_blob("key").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).await.unwrap();

        storage.put_blob("group_state/abc", b"blob").await.unwrap();
        assert_eq!(storage.get_blob("group_state/abc").await.unwrap(), b"blob");

        let keys = storage.list_keys().await.unwrap();
        assert_eq!(keys, vec!["group_state/abc".to_string()]);

        storage.delete_blob("group_state/abc").await.unwrap();
        assert!(matches!(
            storage.get_blob("group_state/abc").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_storage_delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).await.unwrap();
        storage.delete_blob("missing").await.unwrap();
    }
}
