use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::queries;
use crate::models::status::{RecordKey, StatusPatch, StatusRecord};

/// Keyed, partially updatable progress records.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Merge the set fields of `patch` (creating the record if absent) and
    /// return the document as it is after the update.
    async fn merge(&self, key: &RecordKey, patch: &StatusPatch)
        -> Result<StatusRecord, StatusError>;

    async fn get(&self, key: &RecordKey) -> Result<Option<StatusRecord>, StatusError>;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<(), StatusError>;
}

/// PostgreSQL-backed status records.
#[derive(Clone)]
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn merge(
        &self,
        key: &RecordKey,
        patch: &StatusPatch,
    ) -> Result<StatusRecord, StatusError> {
        Ok(queries::merge_status(&self.pool, key, patch).await?)
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<StatusRecord>, StatusError> {
        Ok(queries::get_status(&self.pool, key).await?)
    }

    async fn ping(&self) -> Result<(), StatusError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Status store unavailable: {0}")]
    Unavailable(String),
}
