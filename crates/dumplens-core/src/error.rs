use std::time::Duration;

use thiserror::Error;

use crate::types::DumpIdentifier;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),
    #[error("scheduler is shut down, cannot enqueue on '{0}'")]
    ShutDown(String),
}

#[derive(Debug, Error)]
pub enum NativeAnalyzerError {
    #[error("no native analyzer command configured (set analysis.native_command)")]
    NotConfigured,
    #[error("native analyzer command is empty")]
    EmptyCommand,
    #[error("invalid native analyzer command: {0}")]
    InvalidCommand(#[from] shell_words::ParseError),
    #[error("failed to spawn native analyzer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("native analyzer timed out after {0:?}")]
    Timeout(Duration),
    #[error("native analyzer exited with code {code}: {message}")]
    ExitCode { code: i32, message: String },
    #[error("native analyzer produced no output at '{0}'")]
    MissingOutput(String),
    #[error("failed to read native analyzer output: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse native analyzer output: {0}")]
    InvalidOutput(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("dump {0} not found")]
    DumpNotFound(DumpIdentifier),
    #[error("no analysis result stored for dump {0}")]
    ResultNotFound(DumpIdentifier),
    #[error("invalid bundle id '{0}': must be a plain name without '/', '\\', ':' or '..'")]
    InvalidBundleId(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid file pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}
