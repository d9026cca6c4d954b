use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const CONFIG_FILE: &str = ".dumplens.toml";

/// Top-level configuration from `.dumplens.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".dumplens/data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// How dump files are discovered and handed to the native analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub native_command: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_dump_patterns")]
    pub dump_patterns: Vec<String>,
    #[serde(default = "default_archive_patterns")]
    pub archive_patterns: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_dump_patterns() -> Vec<String> {
    vec![
        "*.dmp".to_string(),
        "*.core".to_string(),
        "*.core.gz".to_string(),
    ]
}

fn default_archive_patterns() -> Vec<String> {
    vec![
        "*.zip".to_string(),
        "*.tar".to_string(),
        "*.tar.gz".to_string(),
        "*.tgz".to_string(),
        "*.7z".to_string(),
    ]
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            native_command: None,
            timeout_secs: default_timeout_secs(),
            dump_patterns: default_dump_patterns(),
            archive_patterns: default_archive_patterns(),
        }
    }
}

impl AnalysisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Worker counts per named queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_queues")]
    pub queues: BTreeMap<String, usize>,
}

pub const QUEUE_DOWNLOAD: &str = "download";
pub const QUEUE_ANALYSIS: &str = "analysis";
pub const QUEUE_ELASTICSEARCH: &str = "elasticsearch";
pub const QUEUE_RETENTION: &str = "retention";
pub const QUEUE_SIMILARITY: &str = "similarityanalysis";
pub const QUEUE_CLUSTERING: &str = "clustering";

fn default_queues() -> BTreeMap<String, usize> {
    let mut m = BTreeMap::new();
    m.insert(QUEUE_DOWNLOAD.to_string(), 4);
    m.insert(QUEUE_ANALYSIS.to_string(), 2);
    m.insert(QUEUE_ELASTICSEARCH.to_string(), 1);
    m.insert(QUEUE_RETENTION.to_string(), 1);
    m.insert(QUEUE_SIMILARITY.to_string(), 2);
    m.insert(QUEUE_CLUSTERING.to_string(), 1);
    m
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
        }
    }
}

impl SchedulerConfig {
    /// Queue sizes with zero clamped to one. Queues the pipeline relies on
    /// are always present.
    pub fn effective_queues(&self) -> BTreeMap<String, usize> {
        let mut queues = default_queues();
        for (name, workers) in &self.queues {
            queues.insert(name.clone(), *workers);
        }
        for workers in queues.values_mut() {
            *workers = (*workers).max(1);
        }
        queues
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_days")]
    pub max_days: i64,
    #[serde(default = "default_cluster_interval")]
    pub cluster_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_days() -> i64 {
    30
}

fn default_cluster_interval() -> u64 {
    60
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_days: default_max_days(),
            cluster_interval_secs: default_cluster_interval(),
        }
    }
}

impl SimilarityConfig {
    pub fn cluster_interval(&self) -> Duration {
        Duration::from_secs(self.cluster_interval_secs.max(1))
    }
}

/// Compile glob patterns into a set matched case-insensitively against
/// file names.
pub fn build_globset(patterns: &[String]) -> Result<GlobSet, ConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| ConfigError::InvalidPattern {
        pattern: patterns.join(", "),
        source,
    })
}

impl Config {
    /// Load configuration from a `.dumplens.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let mut config: Config = toml::from_str(&content).with_context(|| {
            format!(
                "failed to parse '{}'. Run `dumplens init` to create a valid config file",
                path.display()
            )
        })?;
        // Relative data dirs are anchored at the config file, not the cwd.
        if config.storage.data_dir.is_relative() {
            if let Some(parent) = path.parent() {
                config.storage.data_dir = parent.join(&config.storage.data_dir);
            }
        }
        Ok(config)
    }

    /// Load from `.dumplens.toml` in the given directory or any ancestor, or return defaults.
    pub fn load_or_default(dir: &Path) -> Self {
        let start = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        let mut current = start.as_path();
        loop {
            let config_path = current.join(CONFIG_FILE);
            if config_path.exists() {
                return match Self::load(&config_path) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!(
                            path = %config_path.display(),
                            "failed to load config: {e:#}. Using defaults."
                        );
                        Self::default()
                    }
                };
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        let mut config = Self::default();
        config.storage.data_dir = start.join(&config.storage.data_dir);
        config
    }

    /// Generate default TOML content for `dumplens init`.
    pub fn default_toml() -> String {
        r#"# dumplens - crash dump analysis configuration

[storage]
# Root of the file-based dump and relationship storage
data_dir = ".dumplens/data"

[analysis]
# Command template for the native analyzer. Placeholders:
# {bundleid} {dumpid} {dumpdir} {dumppath} {dumpname} {outputpath} {outputname}
# native_command = "linux-analyzer {dumppath} {outputpath}"
timeout_secs = 1800
dump_patterns = ["*.dmp", "*.core", "*.core.gz"]
archive_patterns = ["*.zip", "*.tar", "*.tar.gz", "*.tgz", "*.7z"]

[scheduler.queues]
# Worker count per queue
download = 4
analysis = 2
elasticsearch = 1
retention = 1
similarityanalysis = 2
clustering = 1

[similarity]
enabled = true
# Only dumps created within this many days are compared
max_days = 30
cluster_interval_secs = 60
"#
        .to_string()
    }
}
