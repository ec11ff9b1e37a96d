//! Rendezvous key-value stores
//!
//! Both ends of a pipe publish their control blob under their own key and
//! poll the peer's key. Values are overwritten wholesale.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

/// Store failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("store unavailable")]
    Unavailable,
    #[error("io: {0}")]
    Io(String),
}

/// Shared key-value store used for the pipe handshake
#[async_trait]
pub trait RendezvousStore: Send + Sync {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

#[async_trait]
impl<S: RendezvousStore + ?Sized> RendezvousStore for Arc<S> {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        (**self).set(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        (**self).get(key).await
    }
}

/// In-process store. Clones share the same map.
///
/// Reads and writes can be made to fail for fault-injection tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

#[async_trait]
impl RendezvousStore for MemoryStore {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        self.values
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

/// One file per key under a directory, for processes sharing a filesystem
/// (`file://` endpoints).
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { root })
    }

    /// Store for a `file://` endpoint
    pub async fn from_endpoint(endpoint: &str) -> Result<Self, StoreError> {
        let path = endpoint
            .strip_prefix("file://")
            .ok_or_else(|| StoreError::Io(format!("not a file endpoint: {endpoint}")))?;
        Self::open(path).await
    }

    fn path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.root.join(name)
    }
}

#[async_trait]
impl RendezvousStore for FileStore {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(self.path(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_overwrites_and_injects_faults() {
        let store = MemoryStore::new();
        assert_eq!(
            store.get("k").await,
            Err(StoreError::NotFound("k".into()))
        );
        store.set("k", b"one".to_vec()).await.unwrap();
        store.set("k", b"two".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"two");

        let shared = store.clone();
        shared.fail_reads(true);
        assert_eq!(store.get("k").await, Err(StoreError::Unavailable));
        shared.fail_reads(false);
        shared.fail_writes(true);
        assert_eq!(store.set("k", vec![]).await, Err(StoreError::Unavailable));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn file_store_round_trips_values() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = format!("file://{}", dir.path().join("rdzv").display());
        let store = FileStore::from_endpoint(&endpoint).await.unwrap();

        assert!(matches!(
            store.get("fedlink_identity_leader").await,
            Err(StoreError::NotFound(_))
        ));
        store
            .set("fedlink_identity_leader", b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(store.get("fedlink_identity_leader").await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn file_store_rejects_other_schemes() {
        assert!(FileStore::from_endpoint("tcp://localhost:1").await.is_err());
    }
}
