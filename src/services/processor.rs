use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::models::job::{JobPayload, Stage};
use crate::models::status::{RecordKey, StatusPatch, StatusRecord};
use crate::services::engine::EngineError;
use crate::services::keys;
use crate::services::status::{StatusError, StatusStore};
use crate::services::storage::{BlobStore, StorageError};

/// Performs one stage's work for one job.
///
/// Implementations download their inputs, run the stage engine, upload the
/// outputs to deterministic keys and merge their status fields. They never
/// retry: any error is returned to the poll loop, which leaves the message to
/// be redelivered. Running the same payload twice must leave the same blobs
/// and the same status record as running it once.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Process one job and return the status record after reconciliation.
    async fn process(&self, payload: JobPayload) -> Result<StatusRecord, ProcessError>;
}

/// Failure classes of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Queue, blob or store I/O failed; a retry may succeed as is.
    Transient,
    /// Bad input, missing prerequisite or engine failure.
    Processing,
    /// Outputs were uploaded but the status record could not be updated.
    Reconciliation,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("{got} job delivered to the {expected} worker")]
    WrongStage { expected: Stage, got: Stage },

    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("Engine produced no {0} output")]
    MissingOutput(String),

    #[error("Engine failed: {0}")]
    Engine(#[from] EngineError),

    #[error("Blob transfer failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Scratch space error: {0}")]
    Scratch(#[from] std::io::Error),

    #[error("Processor panicked: {0}")]
    Panicked(String),

    #[error("Status update failed after uploading {uploaded:?}: {source}")]
    Reconciliation {
        uploaded: Vec<String>,
        #[source]
        source: StatusError,
    },
}

impl ProcessError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProcessError::Storage(StorageError::NotFound(_)) => ErrorClass::Processing,
            ProcessError::Storage(_) | ProcessError::Scratch(_) => ErrorClass::Transient,
            ProcessError::Reconciliation { .. } => ErrorClass::Reconciliation,
            _ => ErrorClass::Processing,
        }
    }
}

/// Per-job scratch directory with separate input and output folders.
/// Removed when dropped.
pub struct Scratch {
    dir: TempDir,
    inputs: PathBuf,
    outputs: PathBuf,
}

impl Scratch {
    pub fn inputs(&self) -> &Path {
        &self.inputs
    }

    pub fn outputs(&self) -> &Path {
        &self.outputs
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Collaborators shared by every stage processor.
#[derive(Clone)]
pub struct StageContext {
    pub blobs: Arc<dyn BlobStore>,
    pub status: Arc<dyn StatusStore>,
    pub scratch_dir: Option<PathBuf>,
}

impl StageContext {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        status: Arc<dyn StatusStore>,
        scratch_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            blobs,
            status,
            scratch_dir,
        }
    }

    pub async fn scratch(&self, stage: Stage) -> Result<Scratch, ProcessError> {
        let mut builder = tempfile::Builder::new();
        let prefix = format!("{stage}-");
        builder.prefix(&prefix);
        let dir = match &self.scratch_dir {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };

        let inputs = dir.path().join("inputs");
        let outputs = dir.path().join("outputs");
        tokio::fs::create_dir(&inputs).await?;
        tokio::fs::create_dir(&outputs).await?;
        let scratch = Scratch {
            dir,
            inputs,
            outputs,
        };
        tracing::debug!(stage = %stage, path = %scratch.path().display(), "Scratch directory created");
        Ok(scratch)
    }

    /// Download `key` into `dir`, keeping its file name.
    ///
    /// A missing object is a missing prerequisite, not a transport failure.
    pub async fn download(&self, key: &str, dir: &Path) -> Result<PathBuf, ProcessError> {
        let data = self.blobs.get(key).await.map_err(|e| match e {
            StorageError::NotFound(key) => ProcessError::MissingPrerequisite(key),
            other => ProcessError::Storage(other),
        })?;

        let path = dir.join(keys::file_name(key));
        tokio::fs::write(&path, data).await?;
        tracing::debug!(key, path = %path.display(), "Downloaded blob");
        Ok(path)
    }

    /// Upload a local file to `key` and return its public URL.
    pub async fn upload(&self, path: &Path, key: &str) -> Result<String, ProcessError> {
        let data = tokio::fs::read(path).await?;
        self.blobs.put(key, &data, content_type_for(key)).await?;
        tracing::debug!(key, bytes = data.len(), "Uploaded blob");
        Ok(self.blobs.public_url(key))
    }

    /// Merge the stage's fields into the status record.
    ///
    /// `uploaded` names the blobs already written for this job; they are logged
    /// if the merge fails so the orphaned outputs can be found.
    pub async fn reconcile(
        &self,
        key: &RecordKey,
        patch: &StatusPatch,
        uploaded: Vec<String>,
    ) -> Result<StatusRecord, ProcessError> {
        match self.status.merge(key, patch).await {
            Ok(record) => Ok(record),
            Err(source) => {
                tracing::error!(
                    user_id = %key.user_id,
                    artist = %key.artist,
                    ?uploaded,
                    error = %source,
                    "Outputs uploaded but status record not updated"
                );
                Err(ProcessError::Reconciliation { uploaded, source })
            }
        }
    }
}

pub fn content_type_for(key: &str) -> &'static str {
    match Path::new(key).extension().and_then(|e| e.to_str()) {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream",
    }
}

/// First produced file whose name ends with `suffix`.
pub fn find_output<'a>(outputs: &'a [PathBuf], suffix: &str) -> Result<&'a PathBuf, ProcessError> {
    outputs
        .iter()
        .find(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(suffix))
        })
        .ok_or_else(|| ProcessError::MissingOutput(suffix.to_string()))
}
