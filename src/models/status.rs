use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::Stage;

/// Composite identity of a status record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub user_id: String,
    pub artist: String,
}

impl RecordKey {
    pub fn new(user_id: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            artist: artist.into(),
        }
    }
}

/// Shared progress projection for one (user, artist) unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
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
}

impl StatusRecord {
    pub fn empty(key: &RecordKey) -> Self {
        Self {
            user_id: key.user_id.clone(),
            artist: key.artist.clone(),
            origin_url: None,
            vocal_url: None,
            instrum_url: None,
            vc_source_url: None,
            vc_instrum_url: None,
            trained: false,
            model_url: None,
            vc_vocal_url: None,
            updated_at: Utc::now(),
        }
    }

    /// Applies a patch field by field. Unset patch fields leave the record untouched.
    pub fn apply(&mut self, patch: &StatusPatch) {
        fn set(slot: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }

        set(&mut self.origin_url, &patch.origin_url);
        set(&mut self.vocal_url, &patch.vocal_url);
        set(&mut self.instrum_url, &patch.instrum_url);
        set(&mut self.vc_source_url, &patch.vc_source_url);
        set(&mut self.vc_instrum_url, &patch.vc_instrum_url);
        set(&mut self.model_url, &patch.model_url);
        set(&mut self.vc_vocal_url, &patch.vc_vocal_url);
        if let Some(trained) = patch.trained {
            self.trained = trained;
        }
        self.updated_at = Utc::now();
    }

    /// Derived progress of one stage, computed from whether its outputs are set.
    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        let done = match stage {
            // Either the library stems or the voice conversion stems.
            Stage::Separation => {
                (self.vocal_url.is_some() && self.instrum_url.is_some())
                    || (self.vc_source_url.is_some() && self.vc_instrum_url.is_some())
            }
            Stage::Training => self.trained,
            Stage::Inference => self.vc_vocal_url.is_some(),
        };
        if done {
            StageStatus::Completed
        } else {
            StageStatus::Processing
        }
    }
}

/// A partial update. Each stage only ever sets its own fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusPatch {
    pub origin_url: Option<String>,
    pub vocal_url: Option<String>,
    pub instrum_url: Option<String>,
    pub vc_source_url: Option<String>,
    pub vc_instrum_url: Option<String>,
    pub trained: Option<bool>,
    pub model_url: Option<String>,
    pub vc_vocal_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Processing,
    Completed,
}
