use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::models::job::{JobPayload, SeparationMode, Stage};
use crate::models::status::{RecordKey, StatusPatch, StatusRecord};
use crate::services::engine::{Transform, TransformRequest};
use crate::services::keys;
use crate::services::processor::{find_output, ProcessError, StageContext, StageProcessor};

/// Splits an uploaded song into vocal and instrumental stems.
pub struct SeparationProcessor {
    ctx: StageContext,
    engine: Arc<dyn Transform>,
}

impl SeparationProcessor {
    pub fn new(ctx: StageContext, engine: Arc<dyn Transform>) -> Self {
        Self { ctx, engine }
    }
}

#[async_trait]
impl StageProcessor for SeparationProcessor {
    fn stage(&self) -> Stage {
        Stage::Separation
    }

    async fn process(&self, payload: JobPayload) -> Result<StatusRecord, ProcessError> {
        let job = match payload {
            JobPayload::Separation(job) => job,
            other => {
                return Err(ProcessError::WrongStage {
                    expected: Stage::Separation,
                    got: other.stage(),
                })
            }
        };

        let scratch = self.ctx.scratch(Stage::Separation).await?;
        let input = self.ctx.download(&job.artifact_key, scratch.inputs()).await?;

        let mode = match job.mode {
            SeparationMode::Library => "library",
            SeparationMode::VoiceConversion => "vc",
        };
        let outputs = self
            .engine
            .run(&TransformRequest {
                input: Some(input),
                inputs_dir: scratch.inputs().to_path_buf(),
                output_dir: scratch.outputs().to_path_buf(),
                options: BTreeMap::from([("mode".to_string(), mode.to_string())]),
            })
            .await?;

        let vocals = find_output(&outputs, "_vocals.wav")?;
        let instrum = find_output(&outputs, "_instrum.wav")?;

        let (vocals_key, instrum_key) = match job.mode {
            SeparationMode::Library => (
                keys::separation_vocals(&job.user_id, &job.filename),
                keys::separation_instrum(&job.user_id, &job.filename),
            ),
            SeparationMode::VoiceConversion => (
                keys::vc_source_vocals(&job.user_id, &job.filename),
                keys::vc_source_instrum(&job.user_id, &job.filename),
            ),
        };

        let vocals_url = self.ctx.upload(vocals, &vocals_key).await?;
        let instrum_url = self.ctx.upload(instrum, &instrum_key).await?;

        let patch = match job.mode {
            SeparationMode::Library => StatusPatch {
                vocal_url: Some(vocals_url),
                instrum_url: Some(instrum_url),
                ..Default::default()
            },
            SeparationMode::VoiceConversion => StatusPatch {
                vc_source_url: Some(vocals_url),
                vc_instrum_url: Some(instrum_url),
                ..Default::default()
            },
        };

        tracing::info!(
            user_id = %job.user_id,
            artist = %job.artist,
            filename = %job.filename,
            mode,
            engine = %self.engine.name(),
            "Separation outputs uploaded"
        );

        let key = RecordKey::new(&job.user_id, &job.artist);
        self.ctx
            .reconcile(&key, &patch, vec![vocals_key, instrum_key])
            .await
    }
}
