use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::NativeAnalyzerError;
use crate::result::AnalysisResult;
use crate::types::DumpIdentifier;

pub const STDOUT_LOG: &str = "native-analysis.log";
pub const STDERR_LOG: &str = "native-analysis.err.log";

const UNKNOWN_EXIT_MESSAGE: &str =
    "An unknown error occurred during the analysis. Please check the log files for more details.";

/// Maps native analyzer exit codes to readable causes.
#[derive(Debug, Clone)]
pub struct ExitCodeTable {
    messages: HashMap<i32, String>,
}

impl ExitCodeTable {
    pub fn new(entries: impl IntoIterator<Item = (i32, String)>) -> Self {
        Self {
            messages: entries.into_iter().collect(),
        }
    }

    /// Codes returned by the Linux core dump analyzer.
    pub fn linux_analyzer() -> Self {
        Self::new([
            (0, String::new()),
            (
                2,
                "Invalid analyzation call. Please verify the call arguments in the configuration."
                    .to_string(),
            ),
            (3, "Could not find a coredump.".to_string()),
            (
                4,
                "Cannot analyze dumps without NT_FILE note. This note is only present in more recent kernel releases."
                    .to_string(),
            ),
        ])
    }

    pub fn message(&self, code: i32) -> &str {
        self.messages
            .get(&code)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_EXIT_MESSAGE)
    }
}

impl Default for ExitCodeTable {
    fn default() -> Self {
        Self::linux_analyzer()
    }
}

/// Inputs of one native analyzer invocation.
#[derive(Debug, Clone)]
pub struct NativeRequest {
    pub id: DumpIdentifier,
    pub dump_path: PathBuf,
    pub work_dir: PathBuf,
    pub output_path: PathBuf,
}

/// Black box turning a dump file into an [`AnalysisResult`].
#[async_trait]
pub trait NativeAnalyzer: Send + Sync {
    async fn analyze(&self, request: &NativeRequest) -> Result<AnalysisResult, NativeAnalyzerError>;
}

/// Runs an external command built from a placeholder template and reads
/// the JSON it writes to `{outputpath}`.
pub struct CommandNativeAnalyzer {
    template: Vec<String>,
    timeout: Duration,
    exit_codes: Arc<ExitCodeTable>,
}

impl CommandNativeAnalyzer {
    pub fn new(
        template: &str,
        timeout: Duration,
        exit_codes: Arc<ExitCodeTable>,
    ) -> Result<Self, NativeAnalyzerError> {
        let template = shell_words::split(template)?;
        if template.is_empty() {
            return Err(NativeAnalyzerError::EmptyCommand);
        }
        Ok(Self {
            template,
            timeout,
            exit_codes,
        })
    }

    /// Substitute placeholders per argument, so paths with spaces stay intact.
    fn render(&self, request: &NativeRequest) -> Vec<String> {
        let file_name = |p: &Path| {
            p.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        let replacements = [
            ("{bundleid}", request.id.bundle_id.clone()),
            ("{dumpid}", request.id.dump_id.clone()),
            ("{dumpdir}", request.work_dir.display().to_string()),
            ("{dumppath}", request.dump_path.display().to_string()),
            ("{dumpname}", file_name(&request.dump_path)),
            ("{outputpath}", request.output_path.display().to_string()),
            ("{outputname}", file_name(&request.output_path)),
        ];
        self.template
            .iter()
            .map(|arg| {
                replacements
                    .iter()
                    .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
            })
            .collect()
    }
}

#[async_trait]
impl NativeAnalyzer for CommandNativeAnalyzer {
    async fn analyze(&self, request: &NativeRequest) -> Result<AnalysisResult, NativeAnalyzerError> {
        let argv = self.render(request);
        let Some((program, args)) = argv.split_first() else {
            return Err(NativeAnalyzerError::EmptyCommand);
        };
        tracing::info!(dump = %request.id, program = %program, ?args, "running native analyzer");

        let child = Command::new(program)
            .args(args)
            .current_dir(&request.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| NativeAnalyzerError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| NativeAnalyzerError::Timeout(self.timeout))??;

        if !output.stdout.is_empty() {
            tokio::fs::write(request.work_dir.join(STDOUT_LOG), &output.stdout).await?;
        }
        if !output.stderr.is_empty() {
            tokio::fs::write(request.work_dir.join(STDERR_LOG), &output.stderr).await?;
        }

        if !output.status.success() {
            // killed by a signal has no code
            let code = output.status.code().unwrap_or(-1);
            let message = self.exit_codes.message(code).to_string();
            tracing::warn!(dump = %request.id, code, "native analyzer failed: {message}");
            return Err(NativeAnalyzerError::ExitCode { code, message });
        }

        if !request.output_path.exists() {
            return Err(NativeAnalyzerError::MissingOutput(
                request.output_path.display().to_string(),
            ));
        }
        let content = tokio::fs::read_to_string(&request.output_path).await?;
        let result: AnalysisResult = serde_json::from_str(&content)?;
        tracing::debug!(dump = %request.id, threads = result.threads.len(), "native analysis parsed");
        Ok(result)
    }
}
