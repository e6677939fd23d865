//! Mock stage engine for testing.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::job::Stage;
use crate::services::engine::{list_outputs, EngineError, Transform, TransformRequest};

/// Engine that writes the files a real engine for `stage` would produce.
///
/// Output content is derived from the input bytes, so two runs on the same
/// input produce byte-identical files.
///
/// - separation: `{stem}_vocals.wav` and `{stem}_instrum.wav`
/// - training: `{model_name}.pth` and `added_{model_name}.index`
/// - inference: `{stem}_converted.wav`
#[derive(Debug, Clone)]
pub struct MockEngine {
    stage: Stage,
    runs: Arc<AtomicUsize>,
    fail_next_runs: Arc<AtomicUsize>,
    requests: Arc<RwLock<Vec<TransformRequest>>>,
}

impl MockEngine {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            runs: Arc::new(AtomicUsize::new(0)),
            fail_next_runs: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Make the next `count` runs exit non-zero.
    pub fn fail_next_runs(&self, count: usize) {
        self.fail_next_runs.store(count, Ordering::SeqCst);
    }

    /// Number of runs started, failed ones included.
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub async fn recorded_requests(&self) -> Vec<TransformRequest> {
        self.requests.read().await.clone()
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string()
}

async fn input_bytes(request: &TransformRequest) -> Result<Vec<u8>, EngineError> {
    match &request.input {
        Some(path) => Ok(tokio::fs::read(path).await?),
        None => {
            let mut all = Vec::new();
            for file in list_outputs(&request.inputs_dir).await? {
                all.extend(tokio::fs::read(file).await?);
            }
            Ok(all)
        }
    }
}

#[async_trait]
impl Transform for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(&self, request: &TransformRequest) -> Result<Vec<PathBuf>, EngineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.requests.write().await.push(request.clone());

        if self
            .fail_next_runs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::Failed {
                code: Some(1),
                stderr: "mock engine failure".to_string(),
            });
        }

        let data = input_bytes(request).await?;
        let out = &request.output_dir;
        let files: Vec<(PathBuf, &str)> = match self.stage {
            Stage::Separation => {
                let input = request
                    .input
                    .as_deref()
                    .ok_or_else(|| EngineError::MissingInput("mock".to_string()))?;
                let stem = stem(input);
                vec![
                    (out.join(format!("{stem}_vocals.wav")), "vocals"),
                    (out.join(format!("{stem}_instrum.wav")), "instrum"),
                ]
            }
            Stage::Training => {
                let model = request
                    .options
                    .get("model_name")
                    .cloned()
                    .unwrap_or_else(|| "model".to_string());
                vec![
                    (out.join(format!("{model}.pth")), "weights"),
                    (out.join(format!("added_{model}.index")), "index"),
                ]
            }
            Stage::Inference => {
                let input = request
                    .input
                    .as_deref()
                    .ok_or_else(|| EngineError::MissingInput("mock".to_string()))?;
                vec![(out.join(format!("{}_converted.wav", stem(input))), "converted")]
            }
        };

        for (path, tag) in &files {
            let mut content = tag.as_bytes().to_vec();
            content.push(b':');
            content.extend_from_slice(&data);
            tokio::fs::write(path, content).await?;
        }

        list_outputs(out).await
    }
}
