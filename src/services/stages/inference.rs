use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::models::job::{JobPayload, Stage};
use crate::models::status::{RecordKey, StatusPatch, StatusRecord};
use crate::services::engine::{Transform, TransformRequest};
use crate::services::keys;
use crate::services::processor::{ProcessError, StageContext, StageProcessor};

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOptions {
    pub f0_method: String,
    pub f0_up_key: i32,
    pub filter_radius: u32,
    pub index_rate: f32,
    pub hop_length: u32,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            f0_method: "rmvpe".to_string(),
            f0_up_key: 0,
            filter_radius: 0,
            index_rate: 0.0,
            hop_length: 128,
        }
    }
}

impl InferenceOptions {
    fn to_options(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("f0method".to_string(), self.f0_method.clone()),
            ("f0up_key".to_string(), self.f0_up_key.to_string()),
            ("filter_radius".to_string(), self.filter_radius.to_string()),
            ("index_rate".to_string(), self.index_rate.to_string()),
            ("hop_length".to_string(), self.hop_length.to_string()),
        ])
    }
}

/// Converts separated vocals into the artist's voice with their trained model.
///
/// Both prerequisites come from earlier stages by key convention: the model
/// under the artist's training prefix and the vocals written by a voice
/// conversion separation run. While either is missing the job fails and is
/// retried on redelivery.
pub struct InferenceProcessor {
    ctx: StageContext,
    engine: Arc<dyn Transform>,
    options: InferenceOptions,
}

impl InferenceProcessor {
    pub fn new(ctx: StageContext, engine: Arc<dyn Transform>) -> Self {
        Self {
            ctx,
            engine,
            options: InferenceOptions::default(),
        }
    }

    pub fn with_options(mut self, options: InferenceOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl StageProcessor for InferenceProcessor {
    fn stage(&self) -> Stage {
        Stage::Inference
    }

    async fn process(&self, payload: JobPayload) -> Result<StatusRecord, ProcessError> {
        let job = match payload {
            JobPayload::Inference(job) => job,
            other => {
                return Err(ProcessError::WrongStage {
                    expected: Stage::Inference,
                    got: other.stage(),
                })
            }
        };

        let model_prefix = keys::model_prefix(&job.user_id, &job.artist);
        let model_files = self.ctx.blobs.list(&model_prefix).await?;
        if !model_files.iter().any(|key| key.ends_with(".pth")) {
            return Err(ProcessError::MissingPrerequisite(format!(
                "no trained model under {model_prefix}"
            )));
        }

        let scratch = self.ctx.scratch(Stage::Inference).await?;
        let model_dir = scratch.inputs().join("model");
        tokio::fs::create_dir(&model_dir).await?;
        for key in &model_files {
            self.ctx.download(key, &model_dir).await?;
        }

        let source_key = keys::vc_source_vocals(&job.user_id, &job.filename);
        let input = self.ctx.download(&source_key, scratch.inputs()).await?;

        let outputs = self
            .engine
            .run(&TransformRequest {
                input: Some(input),
                inputs_dir: model_dir,
                output_dir: scratch.outputs().to_path_buf(),
                options: self.options.to_options(),
            })
            .await?;

        let converted = outputs
            .iter()
            .find(|path| path.extension().and_then(|e| e.to_str()) == Some("wav"))
            .ok_or_else(|| ProcessError::MissingOutput(".wav".to_string()))?;

        let output_key = keys::inference_output(&job.user_id, &job.artist, &job.filename);
        let url = self.ctx.upload(converted, &output_key).await?;
        tracing::info!(
            user_id = %job.user_id,
            artist = %job.artist,
            filename = %job.filename,
            engine = %self.engine.name(),
            "Converted vocals uploaded"
        );

        let patch = StatusPatch {
            vc_vocal_url: Some(url),
            ..Default::default()
        };
        let key = RecordKey::new(&job.user_id, &job.artist);
        self.ctx.reconcile(&key, &patch, vec![output_key]).await
    }
}
