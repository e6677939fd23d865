//! In-memory blob store for testing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::services::storage::{BlobStore, StorageError};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

/// Blob store backed by a sorted map.
///
/// Counts writes so tests can tell a rerun that overwrote the same keys from
/// one that produced new ones, and can fail the next puts or gets with a 503.
///
/// # Example
///
/// ```rust,ignore
/// let blobs = MemoryBlobStore::new();
/// blobs.insert("u1/origin/song.wav", b"RIFF").await;
/// blobs.fail_next_puts(1);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBlobStore {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
    base_url: String,
    puts: Arc<AtomicUsize>,
    fail_next_puts: Arc<AtomicUsize>,
    fail_next_gets: Arc<AtomicUsize>,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            base_url: "https://blobs.test".to_string(),
            puts: Arc::new(AtomicUsize::new(0)),
            fail_next_puts: Arc::new(AtomicUsize::new(0)),
            fail_next_gets: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Seed an object without counting it as a write.
    pub async fn insert(&self, key: &str, data: &[u8]) {
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                content_type: "application/octet-stream".to_string(),
            },
        );
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(key).map(|o| o.data.clone())
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.content_type.clone())
    }

    /// Number of successful `put` calls so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn fail_next_puts(&self, count: usize) {
        self.fail_next_puts.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_gets(&self, count: usize) {
        self.fail_next_gets.store(count, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn unavailable(key: &str) -> StorageError {
    StorageError::Status {
        key: key.to_string(),
        code: 503,
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        if take_failure(&self.fail_next_puts) {
            return Err(unavailable(key));
        }
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        if take_failure(&self.fail_next_gets) {
            return Err(unavailable(key));
        }
        self.object(key)
            .await
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}
