use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::models::job::{
    InferenceJob, JobDescriptor, JobPayload, SeparationJob, SeparationMode, Stage, TrainingJob,
};
use crate::models::status::{RecordKey, StatusPatch};
use crate::services::keys;
use crate::services::processor::content_type_for;
use crate::services::queue::{QueueError, WorkQueue};
use crate::services::status::{StatusError, StatusStore};
use crate::services::storage::{BlobStore, StorageError};

/// An uploaded file on its way into the blob store.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Informational receipt for a submitted job. Not a handle on its results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReceipt {
    pub message_id: String,
    pub stage: Stage,
    pub group_key: String,
    pub dedup_key: String,
}

/// Publishes jobs onto the stage queues.
///
/// Inputs are uploaded before the enqueue, so a job is never visible to a
/// worker before the blobs it names exist. The enqueue is the publication point.
pub struct JobProducer {
    queue: Arc<dyn WorkQueue>,
    blobs: Arc<dyn BlobStore>,
    status: Arc<dyn StatusStore>,
    enqueue_attempts: u32,
    retry_delay: Duration,
}

impl JobProducer {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        blobs: Arc<dyn BlobStore>,
        status: Arc<dyn StatusStore>,
    ) -> Self {
        Self {
            queue,
            blobs,
            status,
            enqueue_attempts: 3,
            retry_delay: Duration::from_millis(200),
        }
    }

    /// Attempts per enqueue when the queue transport fails.
    pub fn with_enqueue_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.enqueue_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// Upload a song and queue its separation.
    pub async fn submit_separation(
        &self,
        user_id: &str,
        artist: &str,
        upload: Upload,
        mode: SeparationMode,
    ) -> Result<SubmissionReceipt, SubmitError> {
        check_filename(&upload.filename)?;

        let artifact_key = keys::origin(user_id, &upload.filename);
        self.blobs
            .put(&artifact_key, &upload.data, content_type_for(&upload.filename))
            .await?;

        let placeholder = StatusPatch {
            origin_url: Some(self.blobs.public_url(&artifact_key)),
            ..Default::default()
        };
        self.status
            .merge(&RecordKey::new(user_id, artist), &placeholder)
            .await?;

        self.publish(JobDescriptor::new(JobPayload::Separation(SeparationJob {
            user_id: user_id.to_string(),
            artist: artist.to_string(),
            filename: upload.filename,
            artifact_key,
            mode,
        })))
        .await
    }

    /// Upload a training dataset and queue model training for the artist.
    pub async fn submit_training(
        &self,
        user_id: &str,
        artist: &str,
        uploads: Vec<Upload>,
    ) -> Result<SubmissionReceipt, SubmitError> {
        if uploads.is_empty() {
            return Err(SubmitError::EmptyDataset);
        }
        for upload in &uploads {
            check_filename(&upload.filename)?;
        }

        let mut dataset_files = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let key = keys::dataset_file(user_id, artist, &upload.filename);
            self.blobs
                .put(&key, &upload.data, content_type_for(&upload.filename))
                .await?;
            dataset_files.push(upload.filename);
        }

        self.status
            .merge(&RecordKey::new(user_id, artist), &StatusPatch::default())
            .await?;

        self.publish(JobDescriptor::new(JobPayload::Training(TrainingJob {
            user_id: user_id.to_string(),
            artist: artist.to_string(),
            dataset_files,
        })))
        .await
    }

    /// Queue conversion of a song previously separated in voice conversion mode.
    pub async fn submit_inference(
        &self,
        user_id: &str,
        artist: &str,
        filename: &str,
    ) -> Result<SubmissionReceipt, SubmitError> {
        check_filename(filename)?;

        self.status
            .merge(&RecordKey::new(user_id, artist), &StatusPatch::default())
            .await?;

        self.publish(JobDescriptor::new(JobPayload::Inference(InferenceJob {
            user_id: user_id.to_string(),
            artist: artist.to_string(),
            filename: filename.to_string(),
        })))
        .await
    }

    /// Enqueue a descriptor, retrying transport failures with the same dedup key.
    pub async fn publish(&self, descriptor: JobDescriptor) -> Result<SubmissionReceipt, SubmitError> {
        let stage = descriptor.stage();
        let queue_name = stage.queue_name();
        let body = descriptor.body().map_err(QueueError::Serialize)?;

        let mut attempt = 1;
        let message_id = loop {
            match self
                .queue
                .enqueue(&queue_name, &descriptor.group_key, &descriptor.dedup_key, &body)
                .await
            {
                Ok(id) => break id,
                Err(e) if e.is_transient() && attempt < self.enqueue_attempts => {
                    tracing::warn!(
                        stage = %stage,
                        dedup_key = %descriptor.dedup_key,
                        attempt,
                        error = %e,
                        "Enqueue failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        metrics::counter!("pipeline_jobs_submitted_total", "stage" => stage.to_string())
            .increment(1);
        tracing::info!(
            stage = %stage,
            message_id = %message_id,
            group_key = %descriptor.group_key,
            dedup_key = %descriptor.dedup_key,
            "Job enqueued"
        );

        Ok(SubmissionReceipt {
            message_id,
            stage,
            group_key: descriptor.group_key,
            dedup_key: descriptor.dedup_key,
        })
    }
}

fn check_filename(filename: &str) -> Result<(), SubmitError> {
    if filename.is_empty() || filename.contains('/') || filename.contains('\\') || filename == ".." {
        return Err(SubmitError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid file name: {0:?}")]
    InvalidFilename(String),

    #[error("Training needs at least one dataset file")]
    EmptyDataset,

    #[error("Upload failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Status placeholder write failed: {0}")]
    Status(#[from] StatusError),

    #[error("Enqueue failed: {0}")]
    Queue(#[from] QueueError),
}

impl SubmitError {
    /// Whether the caller may resubmit unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            SubmitError::InvalidFilename(_) | SubmitError::EmptyDataset => false,
            SubmitError::Queue(e) => e.is_transient(),
            SubmitError::Storage(_) | SubmitError::Status(_) => true,
        }
    }
}
