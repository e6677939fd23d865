//! In-memory status store for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::status::{RecordKey, StatusPatch, StatusRecord};
use crate::services::status::{StatusError, StatusStore};

/// Status records held in a map, merged field by field like the database upsert.
#[derive(Debug, Clone, Default)]
pub struct MemoryStatusStore {
    records: Arc<RwLock<HashMap<RecordKey, StatusRecord>>>,
    merges: Arc<AtomicUsize>,
    fail_next_merges: Arc<AtomicUsize>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` merges fail as if the database were down.
    pub fn fail_next_merges(&self, count: usize) {
        self.fail_next_merges.store(count, Ordering::SeqCst);
    }

    /// Number of successful merges so far.
    pub fn merge_count(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }

    pub async fn record(&self, key: &RecordKey) -> Option<StatusRecord> {
        self.records.read().await.get(key).cloned()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn merge(
        &self,
        key: &RecordKey,
        patch: &StatusPatch,
    ) -> Result<StatusRecord, StatusError> {
        if self
            .fail_next_merges
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StatusError::Unavailable("injected merge failure".to_string()));
        }

        let mut records = self.records.write().await;
        let record = records
            .entry(key.clone())
            .or_insert_with(|| StatusRecord::empty(key));
        record.apply(patch);
        self.merges.fetch_add(1, Ordering::SeqCst);
        Ok(record.clone())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<StatusRecord>, StatusError> {
        Ok(self.record(key).await)
    }

    async fn ping(&self) -> Result<(), StatusError> {
        Ok(())
    }
}
