use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::models::job::{JobPayload, Stage};
use crate::models::status::{RecordKey, StatusPatch, StatusRecord};
use crate::services::engine::{Transform, TransformRequest};
use crate::services::keys;
use crate::services::processor::{find_output, ProcessError, StageContext, StageProcessor};

/// Hyperparameters handed to the training engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOptions {
    pub sample_rate: u32,
    pub version: String,
    pub f0_method: String,
    pub hop_length: u32,
    pub total_epochs: u32,
    pub save_every_epoch: u32,
    pub batch_size: u32,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            version: "v2".to_string(),
            f0_method: "rmvpe".to_string(),
            hop_length: 128,
            total_epochs: 10,
            save_every_epoch: 5,
            batch_size: 15,
        }
    }
}

impl TrainingOptions {
    fn to_options(&self, model_name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("model_name".to_string(), model_name.to_string()),
            ("sample_rate".to_string(), self.sample_rate.to_string()),
            ("version".to_string(), self.version.clone()),
            ("f0method".to_string(), self.f0_method.clone()),
            ("hop_length".to_string(), self.hop_length.to_string()),
            ("total_epoch".to_string(), self.total_epochs.to_string()),
            ("save_every_epoch".to_string(), self.save_every_epoch.to_string()),
            ("batch_size".to_string(), self.batch_size.to_string()),
        ])
    }
}

/// Trains a voice model from the artist's uploaded dataset.
pub struct TrainingProcessor {
    ctx: StageContext,
    engine: Arc<dyn Transform>,
    options: TrainingOptions,
}

impl TrainingProcessor {
    pub fn new(ctx: StageContext, engine: Arc<dyn Transform>) -> Self {
        Self {
            ctx,
            engine,
            options: TrainingOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TrainingOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl StageProcessor for TrainingProcessor {
    fn stage(&self) -> Stage {
        Stage::Training
    }

    async fn process(&self, payload: JobPayload) -> Result<StatusRecord, ProcessError> {
        let job = match payload {
            JobPayload::Training(job) => job,
            other => {
                return Err(ProcessError::WrongStage {
                    expected: Stage::Training,
                    got: other.stage(),
                })
            }
        };

        let dataset_prefix = keys::dataset_prefix(&job.user_id, &job.artist);
        let dataset = self.ctx.blobs.list(&dataset_prefix).await?;
        if dataset.is_empty() {
            return Err(ProcessError::MissingPrerequisite(format!(
                "no training data under {dataset_prefix}"
            )));
        }

        let scratch = self.ctx.scratch(Stage::Training).await?;
        for key in &dataset {
            self.ctx.download(key, scratch.inputs()).await?;
        }
        tracing::info!(
            user_id = %job.user_id,
            artist = %job.artist,
            files = dataset.len(),
            engine = %self.engine.name(),
            "Training dataset downloaded"
        );

        let outputs = self
            .engine
            .run(&TransformRequest {
                input: None,
                inputs_dir: scratch.inputs().to_path_buf(),
                output_dir: scratch.outputs().to_path_buf(),
                options: self.options.to_options(&job.artist),
            })
            .await?;

        let weights = find_output(&outputs, ".pth")?;
        find_output(&outputs, ".index")?;

        let mut uploaded = Vec::with_capacity(outputs.len());
        let mut model_url = None;
        for path in &outputs {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let key = keys::model_file(&job.user_id, &job.artist, name);
            let url = self.ctx.upload(path, &key).await?;
            if path == weights {
                model_url = Some(url);
            }
            uploaded.push(key);
        }

        let patch = StatusPatch {
            trained: Some(true),
            model_url,
            ..Default::default()
        };
        let key = RecordKey::new(&job.user_id, &job.artist);
        self.ctx.reconcile(&key, &patch, uploaded).await
    }
}
