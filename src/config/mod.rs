use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::job::Stage;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string (status records)
    pub database_url: String,

    /// Redis connection string for the stage queues
    pub redis_url: String,

    /// Prefix for every Redis key owned by the queues
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// S3 bucket holding uploads and stage outputs
    pub s3_bucket: String,

    /// S3 region name ("auto" for R2-style endpoints)
    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    /// S3 endpoint URL
    pub s3_endpoint: String,

    /// S3 access key ID
    pub s3_access_key: String,

    /// S3 secret access key
    pub s3_secret_key: String,

    /// Base of public read URLs; defaults to the virtual-hosted S3 URL of the bucket
    pub public_base_url: Option<String>,

    /// Window in which enqueues with the same dedup key collapse
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,

    /// Messages older than this are dropped when they reach the head of their group
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Long-poll wait for each receive
    #[serde(default = "default_receive_wait_secs")]
    pub receive_wait_secs: u64,

    /// Messages requested per receive
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_separation_visibility_secs")]
    pub separation_visibility_secs: u64,

    #[serde(default = "default_training_visibility_secs")]
    pub training_visibility_secs: u64,

    #[serde(default = "default_inference_visibility_secs")]
    pub inference_visibility_secs: u64,

    /// Deliveries beyond this count go to the stage's dead-letter queue.
    /// Unset means retry forever.
    pub max_receive_count: Option<u32>,

    /// Stage served by the worker binary
    #[serde(default)]
    pub worker_stage: Option<Stage>,

    /// Command line of the separation engine, whitespace separated
    #[serde(default = "default_separation_command")]
    pub separation_command: String,

    /// Command line of the training engine, whitespace separated
    #[serde(default = "default_training_command")]
    pub training_command: String,

    /// Command line of the voice conversion engine, whitespace separated
    #[serde(default = "default_inference_command")]
    pub inference_command: String,

    /// Upper bound for a single engine run. Defaults to nine tenths of the
    /// stage's lease, leaving the rest for blob transfers.
    pub engine_timeout_secs: Option<u64>,

    /// Parent directory for per-job scratch space
    pub scratch_dir: Option<PathBuf>,

    /// Address of the worker's Prometheus scrape listener; no listener when unset
    pub worker_metrics_addr: Option<String>,

    /// Request body limit for uploads, in megabytes
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_queue_prefix() -> String {
    "voice_pipeline".to_string()
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_dedup_window_secs() -> u64 {
    300
}

fn default_retention_secs() -> u64 {
    4 * 24 * 60 * 60
}

fn default_receive_wait_secs() -> u64 {
    5
}

fn default_batch_size() -> usize {
    1
}

fn default_separation_visibility_secs() -> u64 {
    100
}

fn default_training_visibility_secs() -> u64 {
    // Training runs take around two hours.
    3 * 60 * 60
}

fn default_inference_visibility_secs() -> u64 {
    100
}

fn default_separation_command() -> String {
    "separate --input {input} --output {output_dir}".to_string()
}

fn default_training_command() -> String {
    "train --dataset {inputs_dir} --output {output_dir}".to_string()
}

fn default_inference_command() -> String {
    "convert --input {input} --model {inputs_dir} --output {output_dir}".to_string()
}

fn default_max_upload_mb() -> usize {
    200
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Configuration validation failed: {0}")]
    Invalid(String),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the queue cannot honour.
    ///
    /// A worker's engine must finish inside the lease of its stage: once the
    /// lease lapses the queue releases the group and the user's next job runs
    /// alongside the one still in the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dedup_window_secs == 0 {
            return Err(ConfigError::Invalid(
                "DEDUP_WINDOW_SECS must be at least 1".to_string(),
            ));
        }
        for stage in Stage::ALL {
            if self.visibility_timeout(stage).is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{stage} visibility timeout cannot be 0"
                )));
            }
        }
        if let Some(stage) = self.worker_stage {
            let timeout = self.engine_timeout(stage);
            let lease = self.visibility_timeout(stage);
            if timeout >= lease {
                return Err(ConfigError::Invalid(format!(
                    "{stage} engine timeout ({}s) must be shorter than its visibility timeout ({}s)",
                    timeout.as_secs(),
                    lease.as_secs()
                )));
            }
        }
        Ok(())
    }

    /// Lease length handed to `receive` for the given stage.
    pub fn visibility_timeout(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Separation => self.separation_visibility_secs,
            Stage::Training => self.training_visibility_secs,
            Stage::Inference => self.inference_visibility_secs,
        };
        Duration::from_secs(secs)
    }

    /// Time limit of one engine run for the given stage.
    pub fn engine_timeout(&self, stage: Stage) -> Duration {
        match self.engine_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.visibility_timeout(stage) * 9 / 10,
        }
    }

    pub fn engine_command(&self, stage: Stage) -> &str {
        match stage {
            Stage::Separation => &self.separation_command,
            Stage::Training => &self.training_command,
            Stage::Inference => &self.inference_command,
        }
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(self.receive_wait_secs)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }

    pub fn public_base_url(&self) -> String {
        match &self.public_base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!(
                "https://{}.s3.{}.amazonaws.com",
                self.s3_bucket, self.s3_region
            ),
        }
    }
}
