//! Concrete pipeline stages and post-analysis jobs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use globset::GlobSet;

use crate::config::{build_globset, AnalysisConfig};
use crate::error::{NativeAnalyzerError, StorageError};
use crate::native::{NativeAnalyzer, NativeRequest};
use crate::pipeline::{AnalyzerJob, AnalyzerState, InitialAnalyzerJob, PostAnalysisJob};
use crate::repository::{
    DumpRepository, PROP_EXECUTABLE, PROP_PROCESS_ARCHITECTURE, PROP_PROCESS_ARGS,
    PROP_SYSTEM_ARCHITECTURE,
};
use crate::result::SystemContext;
use crate::similarity::SimilarityService;
use crate::tagging::DynamicAnalysis;
use crate::types::{DumpMetainfo, DumpStatus, DumpType};

const NATIVE_OUTPUT_FILE: &str = "native-result.json";

/// Sorted regular files directly inside `dir`.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory '{}'", dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn has_subdirectories(dir: &Path) -> Result<bool> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory '{}'", dir.display()))?
    {
        if entry?.file_type()?.is_dir() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn file_matches(set: &GlobSet, path: &Path) -> bool {
    path.file_name()
        .map(|name| set.is_match(name))
        .unwrap_or(false)
}

fn dump_type_for(path: &Path) -> DumpType {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.ends_with(".dmp") {
        DumpType::WindowsDump
    } else {
        DumpType::LinuxCoreDump
    }
}

fn system_properties(system: &SystemContext) -> Vec<(String, String)> {
    [
        (PROP_SYSTEM_ARCHITECTURE, &system.system_architecture),
        (PROP_PROCESS_ARCHITECTURE, &system.process_architecture),
        (PROP_EXECUTABLE, &system.executable),
        (PROP_PROCESS_ARGS, &system.process_args),
    ]
    .into_iter()
    .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
    .collect()
}

/// Creates one dump per dump file and runs the native analyzer on it.
pub struct NativeDumpAnalyzerJob {
    repo: Arc<DumpRepository>,
    analyzer: Option<Arc<dyn NativeAnalyzer>>,
    dump_files: GlobSet,
}

impl NativeDumpAnalyzerJob {
    pub fn new(
        repo: Arc<DumpRepository>,
        analyzer: Option<Arc<dyn NativeAnalyzer>>,
        config: &AnalysisConfig,
    ) -> Result<Self> {
        Ok(Self {
            repo,
            analyzer,
            dump_files: build_globset(&config.dump_patterns)?,
        })
    }
}

#[async_trait]
impl AnalyzerJob for NativeDumpAnalyzerJob {
    fn name(&self) -> &str {
        "native-dump-analyzer"
    }

    async fn analyze_dump(
        &self,
        dump: &DumpMetainfo,
        work_dir: &Path,
        previous: AnalyzerState,
    ) -> Result<AnalyzerState> {
        if !matches!(dump.dump_type, DumpType::WindowsDump | DumpType::LinuxCoreDump) {
            return Ok(previous);
        }

        let Some(dump_path) = dump.dump_file.clone() else {
            self.repo
                .set_error_message(&dump.id, Some(format!("Primary dump file not set (id: {})", dump.id)))?;
            return Ok(AnalyzerState::Failed);
        };
        let size = match std::fs::metadata(&dump_path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                self.repo.set_error_message(
                    &dump.id,
                    Some(format!(
                        "Primary dump file not found (id: {}, path: {})",
                        dump.id,
                        dump_path.display()
                    )),
                )?;
                return Ok(AnalyzerState::Failed);
            }
        };
        if size == 0 {
            self.repo
                .set_error_message(&dump.id, Some("The primary dump file is empty".to_string()))?;
            return Ok(AnalyzerState::Failed);
        }

        let analyzer = self
            .analyzer
            .as_ref()
            .ok_or(NativeAnalyzerError::NotConfigured)?;
        let request = NativeRequest {
            id: dump.id.clone(),
            dump_path,
            work_dir: work_dir.to_path_buf(),
            output_path: work_dir.join(NATIVE_OUTPUT_FILE),
        };
        let result = analyzer.analyze(&request).await?;

        self.repo
            .set_properties(&dump.id, system_properties(&result.system))?;
        self.repo.write_result(&dump.id, &result)?;
        Ok(AnalyzerState::Succeeded)
    }
}

#[async_trait]
impl InitialAnalyzerJob for NativeDumpAnalyzerJob {
    async fn create_dump_infos(&self, bundle_id: &str, dir: &Path) -> Result<Vec<DumpMetainfo>> {
        let mut dumps = Vec::new();
        for file in list_files(dir)? {
            if file_matches(&self.dump_files, &file) {
                dumps.push(
                    self.repo
                        .create_dump(bundle_id, dump_type_for(&file), Some(&file))?,
                );
            }
        }
        Ok(dumps)
    }
}

/// Placeholder dump for leaf directories holding files nobody can analyze.
pub struct EmptyAnalyzerJob {
    repo: Arc<DumpRepository>,
    dump_files: GlobSet,
    archives: GlobSet,
}

impl EmptyAnalyzerJob {
    pub fn new(repo: Arc<DumpRepository>, config: &AnalysisConfig) -> Result<Self> {
        Ok(Self {
            repo,
            dump_files: build_globset(&config.dump_patterns)?,
            archives: build_globset(&config.archive_patterns)?,
        })
    }
}

#[async_trait]
impl AnalyzerJob for EmptyAnalyzerJob {
    fn name(&self) -> &str {
        "empty-analyzer"
    }

    async fn analyze_dump(
        &self,
        dump: &DumpMetainfo,
        _work_dir: &Path,
        previous: AnalyzerState,
    ) -> Result<AnalyzerState> {
        if dump.dump_type == DumpType::Empty {
            Ok(AnalyzerState::Cancelled)
        } else {
            Ok(previous)
        }
    }
}

#[async_trait]
impl InitialAnalyzerJob for EmptyAnalyzerJob {
    async fn create_dump_infos(&self, bundle_id: &str, dir: &Path) -> Result<Vec<DumpMetainfo>> {
        if has_subdirectories(dir)? {
            return Ok(Vec::new());
        }
        let files = list_files(dir)?;
        let claimed = files.iter().any(|f| file_matches(&self.dump_files, f));
        let has_plain_files = files.iter().any(|f| !file_matches(&self.archives, f));
        if claimed || !has_plain_files {
            return Ok(Vec::new());
        }
        Ok(vec![self.repo.create_dump(bundle_id, DumpType::Empty, None)?])
    }
}

/// Applies the dynamic tag rules to the stored result.
pub struct TaggingJob {
    repo: Arc<DumpRepository>,
    analysis: DynamicAnalysis,
}

impl TaggingJob {
    pub fn new(repo: Arc<DumpRepository>, analysis: DynamicAnalysis) -> Self {
        Self { repo, analysis }
    }
}

#[async_trait]
impl AnalyzerJob for TaggingJob {
    fn name(&self) -> &str {
        "tagging"
    }

    async fn analyze_dump(
        &self,
        dump: &DumpMetainfo,
        _work_dir: &Path,
        previous: AnalyzerState,
    ) -> Result<AnalyzerState> {
        if previous != AnalyzerState::Succeeded {
            return Ok(previous);
        }
        let mut result = self
            .repo
            .get_result(&dump.id)?
            .ok_or_else(|| StorageError::ResultNotFound(dump.id.clone()))?;
        self.analysis.analyze(&mut result);
        self.repo.write_result(&dump.id, &result)?;
        tracing::debug!(dump = %dump.id, tags = result.all_tags().len(), "tagged result");
        Ok(previous)
    }
}

/// Schedules similarity detection for dumps that have a result.
pub struct SimilarityAnalyzerJob {
    repo: Arc<DumpRepository>,
    similarity: Arc<SimilarityService>,
    max_days: i64,
}

impl SimilarityAnalyzerJob {
    pub fn new(repo: Arc<DumpRepository>, similarity: Arc<SimilarityService>, max_days: i64) -> Self {
        Self {
            repo,
            similarity,
            max_days,
        }
    }
}

#[async_trait]
impl PostAnalysisJob for SimilarityAnalyzerJob {
    fn name(&self) -> &str {
        "similarity-analyzer"
    }

    async fn analyze_dump(&self, dump: &DumpMetainfo) -> Result<()> {
        if dump.status != DumpStatus::Succeeded || self.repo.get_result(&dump.id)?.is_none() {
            return Ok(());
        }
        let not_before = Utc::now() - Duration::days(self.max_days);
        self.similarity
            .schedule_similarity_analysis(dump, false, not_before)?;
        Ok(())
    }
}
