use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use super::job::Stage;
use super::status::{StageStatus, StatusRecord};
use crate::services::producer::SubmissionReceipt;

/// Identity fields end up inside blob keys, so path separators are refused.
fn key_segment(value: &str, _ctx: &()) -> garde::Result {
    if value.contains('/') || value.contains('\\') || value == "." || value == ".." {
        return Err(garde::Error::new("must not contain path separators"));
    }
    Ok(())
}

/// Text fields of a separation upload.
#[derive(Debug, Deserialize, Validate)]
pub struct SeparationForm {
    #[garde(length(min = 1, max = 128), custom(key_segment))]
    pub user_id: String,

    #[garde(length(min = 1, max = 128), custom(key_segment))]
    pub artist: String,

    /// Separate for voice conversion instead of the library.
    #[garde(skip)]
    #[serde(default)]
    pub vc: bool,
}

/// Text fields of a training dataset upload.
#[derive(Debug, Deserialize, Validate)]
pub struct TrainingForm {
    #[garde(length(min = 1, max = 128), custom(key_segment))]
    pub user_id: String,

    #[garde(length(min = 1, max = 128), custom(key_segment))]
    pub artist: String,
}

/// Request to convert a previously separated song.
#[derive(Debug, Deserialize, Validate)]
pub struct InferenceRequest {
    #[garde(length(min = 1, max = 128), custom(key_segment))]
    pub user_id: String,

    #[garde(length(min = 1, max = 128), custom(key_segment))]
    pub artist: String,

    #[garde(length(min = 1, max = 255), custom(key_segment))]
    pub filename: String,
}

/// Response after a job is queued. The id is informational only.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub message_id: String,
    pub stage: Stage,
    pub status: String,
}

impl From<SubmissionReceipt> for SubmissionResponse {
    fn from(receipt: SubmissionReceipt) -> Self {
        Self {
            message_id: receipt.message_id,
            stage: receipt.stage,
            status: "queued".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StageStatuses {
    pub separation: StageStatus,
    pub training: StageStatus,
    pub inference: StageStatus,
}

/// Status record as returned to polling clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub user_id: String,
    pub artist: String,
    pub origin_url: Option<String>,
    pub vocal_url: Option<String>,
    pub instrum_url: Option<String>,
    pub vc_source_url: Option<String>,
    pub vc_instrum_url: Option<String>,
    pub trained: bool,
    pub model_url: Option<String>,
    pub vc_vocal_url: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub stages: StageStatuses,
}

impl From<StatusRecord> for StatusResponse {
    fn from(record: StatusRecord) -> Self {
        let stages = StageStatuses {
            separation: record.stage_status(Stage::Separation),
            training: record.stage_status(Stage::Training),
            inference: record.stage_status(Stage::Inference),
        };
        Self {
            user_id: record.user_id,
            artist: record.artist,
            origin_url: record.origin_url,
            vocal_url: record.vocal_url,
            instrum_url: record.instrum_url,
            vc_source_url: record.vc_source_url,
            vc_instrum_url: record.vc_instrum_url,
            trained: record.trained,
            model_url: record.model_url,
            vc_vocal_url: record.vc_vocal_url,
            updated_at: record.updated_at,
            stages,
        }
    }
}
