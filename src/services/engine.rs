use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Inputs of one engine run. All paths are local scratch paths.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    /// Primary input file, when the stage has one.
    pub input: Option<PathBuf>,
    /// Directory holding every downloaded input.
    pub inputs_dir: PathBuf,
    /// Empty directory the engine writes its outputs into.
    pub output_dir: PathBuf,
    pub options: BTreeMap<String, String>,
}

/// A stage's domain transformation (separation, training, conversion).
///
/// Treated as a pure function from local inputs and options to the files it
/// leaves in `output_dir`. Runs may take minutes to hours.
#[async_trait]
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    /// Run the transformation and return the produced files, sorted.
    async fn run(&self, request: &TransformRequest) -> Result<Vec<PathBuf>, EngineError>;
}

/// Runs an external program per job.
///
/// The command line is split on whitespace; `{input}`, `{inputs_dir}` and
/// `{output_dir}` are substituted, and every option is appended as `--key=value`.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandEngine {
    pub fn new(name: &str, command_line: &str, timeout: Duration) -> Result<Self, EngineError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| EngineError::InvalidCommand(name.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            program,
            args: parts.collect(),
            timeout,
        })
    }

    fn build_args(&self, request: &TransformRequest) -> Result<Vec<String>, EngineError> {
        let mut args = Vec::with_capacity(self.args.len() + request.options.len());
        for arg in &self.args {
            if arg.contains("{input}") && request.input.is_none() {
                return Err(EngineError::MissingInput(self.name.clone()));
            }
            let input = request
                .input
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            args.push(
                arg.replace("{input}", &input)
                    .replace("{inputs_dir}", &request.inputs_dir.display().to_string())
                    .replace("{output_dir}", &request.output_dir.display().to_string()),
            );
        }
        args.extend(
            request
                .options
                .iter()
                .map(|(key, value)| format!("--{key}={value}")),
        );
        Ok(args)
    }
}

/// Files directly inside `dir`, sorted by path.
pub async fn list_outputs(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(20);
    lines[start..].join("\n")
}

#[async_trait]
impl Transform for CommandEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, request: &TransformRequest) -> Result<Vec<PathBuf>, EngineError> {
        let args = self.build_args(request)?;
        tracing::debug!(engine = %self.name, program = %self.program, ?args, "Starting engine");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EngineError::ProgramNotFound(self.program.clone())
                } else {
                    EngineError::Io(e)
                }
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| EngineError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            })??;

        if !output.status.success() {
            return Err(EngineError::Failed {
                code: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        list_outputs(&request.output_dir).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine {0} has an empty command line")]
    InvalidCommand(String),

    #[error("Engine {0} needs an input file")]
    MissingInput(String),

    #[error("Engine program not found: {0}")]
    ProgramNotFound(String),

    #[error("Engine exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("Engine timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}
