use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// One independent phase of the pipeline. Each stage has its own queue and worker pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Separation,
    Training,
    Inference,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Separation, Stage::Training, Stage::Inference];

    /// Name of the queue this stage consumes.
    pub fn queue_name(self) -> String {
        self.to_string()
    }

    /// Queue receiving deliveries that exceeded the configured receive count.
    pub fn dead_letter_queue_name(self) -> String {
        format!("{}-dead-letter", self)
    }
}

/// How the separation stage should file its outputs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SeparationMode {
    /// Stems for the user's own library.
    #[default]
    Library,
    /// Stems feeding a voice conversion run.
    VoiceConversion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeparationJob {
    pub user_id: String,
    pub artist: String,
    pub filename: String,
    /// Blob key of the uploaded original.
    pub artifact_key: String,
    #[serde(default)]
    pub mode: SeparationMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrainingJob {
    pub user_id: String,
    pub artist: String,
    /// Files uploaded into the dataset prefix for this submission.
    #[serde(default)]
    pub dataset_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InferenceJob {
    pub user_id: String,
    pub artist: String,
    /// Original upload name; its separated vocals are the conversion input.
    pub filename: String,
}

/// Stage-specific job payload as it travels on a queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum JobPayload {
    Separation(SeparationJob),
    Training(TrainingJob),
    Inference(InferenceJob),
}

impl JobPayload {
    pub fn stage(&self) -> Stage {
        match self {
            JobPayload::Separation(_) => Stage::Separation,
            JobPayload::Training(_) => Stage::Training,
            JobPayload::Inference(_) => Stage::Inference,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            JobPayload::Separation(j) => &j.user_id,
            JobPayload::Training(j) => &j.user_id,
            JobPayload::Inference(j) => &j.user_id,
        }
    }

    pub fn artist(&self) -> &str {
        match self {
            JobPayload::Separation(j) => &j.artist,
            JobPayload::Training(j) => &j.artist,
            JobPayload::Inference(j) => &j.artist,
        }
    }
}

/// The unit of work placed on a stage queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Ordering domain; one user's jobs are delivered strictly in order.
    pub group_key: String,
    /// Content identity; repeated submissions inside the dedup window collapse.
    pub dedup_key: String,
    pub payload: JobPayload,
}

impl JobDescriptor {
    /// Builds a descriptor whose keys derive from the payload identity.
    pub fn new(payload: JobPayload) -> Self {
        let group_key = payload.user_id().to_string();
        let dedup_key = match &payload {
            JobPayload::Separation(j) => {
                let mode = match j.mode {
                    SeparationMode::Library => "library",
                    SeparationMode::VoiceConversion => "vc",
                };
                identity_key(&[j.user_id.as_str(), j.artist.as_str(), mode, j.filename.as_str()])
            }
            JobPayload::Training(j) => identity_key(&[j.user_id.as_str(), j.artist.as_str(), "train"]),
            JobPayload::Inference(j) => identity_key(&[j.user_id.as_str(), j.artist.as_str(), j.filename.as_str()]),
        };
        Self {
            group_key,
            dedup_key,
            payload,
        }
    }

    pub fn stage(&self) -> Stage {
        self.payload.stage()
    }

    pub fn body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.payload)
    }
}

/// Joins segments as `len:segment`, so distinct segment lists never produce
/// the same key whatever characters the segments contain.
fn identity_key(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|segment| format!("{}:{}", segment.len(), segment))
        .collect::<Vec<_>>()
        .join(":")
}
