use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::QUEUE_ANALYSIS;
use crate::error::{SchedulerError, StorageError};
use crate::repository::{validate_bundle_id, DumpRepository};
use crate::scheduler::JobScheduler;
use crate::types::{DumpIdentifier, DumpMetainfo, DumpStatus};

/// State threaded through the stages of one dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerState {
    /// No stage has produced anything yet.
    Initialized,
    /// A primary dump was analyzed; later stages continue.
    Succeeded,
    /// No primary dump was analyzed; later stages continue.
    Failed,
    /// Later stages are skipped.
    Cancelled,
}

impl fmt::Display for AnalyzerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalyzerState::Initialized => write!(f, "initialized"),
            AnalyzerState::Succeeded => write!(f, "succeeded"),
            AnalyzerState::Failed => write!(f, "failed"),
            AnalyzerState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One stage of the per-dump pipeline.
#[async_trait]
pub trait AnalyzerJob: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze_dump(
        &self,
        dump: &DumpMetainfo,
        work_dir: &Path,
        previous: AnalyzerState,
    ) -> Result<AnalyzerState>;

    /// Entry point used by the pipeline. A cancelled dump never reaches
    /// `analyze_dump`.
    async fn run(
        &self,
        dump: &DumpMetainfo,
        work_dir: &Path,
        previous: AnalyzerState,
    ) -> Result<AnalyzerState> {
        if previous == AnalyzerState::Cancelled {
            return Ok(AnalyzerState::Cancelled);
        }
        self.analyze_dump(dump, work_dir, previous).await
    }
}

/// A stage that also decides which dumps a bundle directory contains.
#[async_trait]
pub trait InitialAnalyzerJob: AnalyzerJob {
    async fn create_dump_infos(&self, bundle_id: &str, dir: &Path) -> Result<Vec<DumpMetainfo>>;
}

/// Side effect run after all stages, whatever their outcome.
#[async_trait]
pub trait PostAnalysisJob: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze_dump(&self, dump: &DumpMetainfo) -> Result<()>;
}

/// Ordered stages plus post-analysis jobs.
#[derive(Default, Clone)]
pub struct AnalyzerPipeline {
    initial: Vec<Arc<dyn InitialAnalyzerJob>>,
    stages: Vec<Arc<dyn AnalyzerJob>>,
    post: Vec<Arc<dyn PostAnalysisJob>>,
}

impl AnalyzerPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the job both as dump discoverer and as a stage.
    pub fn with_initial<J: InitialAnalyzerJob + 'static>(mut self, job: J) -> Self {
        let job = Arc::new(job);
        self.initial.push(job.clone());
        self.stages.push(job);
        self
    }

    pub fn with_stage<J: AnalyzerJob + 'static>(mut self, job: J) -> Self {
        self.stages.push(Arc::new(job));
        self
    }

    pub fn with_post<J: PostAnalysisJob + 'static>(mut self, job: J) -> Self {
        self.post.push(Arc::new(job));
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn post_job_names(&self) -> Vec<&str> {
        self.post.iter().map(|p| p.name()).collect()
    }

    /// Ask every initial analyzer for the dumps in `dir`. A failing
    /// analyzer contributes zero dumps.
    pub async fn create_dump_infos(&self, bundle_id: &str, dir: &Path) -> Vec<DumpMetainfo> {
        let mut dumps = Vec::new();
        for job in &self.initial {
            match job.create_dump_infos(bundle_id, dir).await {
                Ok(found) => dumps.extend(found),
                Err(e) => tracing::warn!(
                    analyzer = job.name(),
                    dir = %dir.display(),
                    "failed to create dump infos: {e:#}"
                ),
            }
        }
        dumps
    }

    /// Run every stage for one dump, then the post-analysis jobs.
    pub async fn analyze(&self, repo: &DumpRepository, id: &DumpIdentifier) -> Result<AnalyzerState> {
        let work_dir = repo.work_dir(id)?;
        repo.set_status(id, DumpStatus::Analyzing)?;

        let mut state = AnalyzerState::Initialized;
        for stage in &self.stages {
            let dump = repo
                .get(id)
                .ok_or_else(|| StorageError::DumpNotFound(id.clone()))?;
            state = match stage.run(&dump, &work_dir, state).await {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(dump = %id, stage = stage.name(), "stage failed: {e:#}");
                    repo.set_error_message(id, Some(format!("{e:#}")))?;
                    AnalyzerState::Failed
                }
            };
            tracing::debug!(dump = %id, stage = stage.name(), %state, "stage finished");
            if state == AnalyzerState::Cancelled {
                break;
            }
        }

        let status = match state {
            AnalyzerState::Succeeded | AnalyzerState::Cancelled => DumpStatus::Succeeded,
            AnalyzerState::Failed => DumpStatus::Failed,
            AnalyzerState::Initialized => {
                if repo.get(id).and_then(|d| d.error_message).is_none() {
                    repo.set_error_message(id, Some("no analyzer accepted this dump".to_string()))?;
                }
                DumpStatus::Failed
            }
        };
        let dump = repo.set_status(id, status)?;
        tracing::info!(dump = %id, %status, "analysis finished");

        for job in &self.post {
            if let Err(e) = job.analyze_dump(&dump).await {
                tracing::warn!(dump = %id, job = job.name(), "post-analysis job failed: {e:#}");
            }
        }
        Ok(state)
    }
}

/// Routes dumps through the pipeline on the analysis queue.
#[derive(Clone)]
pub struct AnalysisService {
    pipeline: Arc<AnalyzerPipeline>,
    repo: Arc<DumpRepository>,
    scheduler: Arc<JobScheduler>,
}

impl AnalysisService {
    pub fn new(
        pipeline: Arc<AnalyzerPipeline>,
        repo: Arc<DumpRepository>,
        scheduler: Arc<JobScheduler>,
    ) -> Self {
        Self {
            pipeline,
            repo,
            scheduler,
        }
    }

    pub fn pipeline(&self) -> &AnalyzerPipeline {
        &self.pipeline
    }

    /// Discover dumps in an extracted bundle (the directory and all of its
    /// subdirectories) and schedule each of them.
    pub async fn analyze_bundle(&self, bundle_id: &str, dir: &Path) -> Result<Vec<DumpIdentifier>> {
        validate_bundle_id(bundle_id)?;
        let dirs: Vec<PathBuf> = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.into_path())
            .collect();

        let mut ids = Vec::new();
        for dir in dirs {
            for dump in self.pipeline.create_dump_infos(bundle_id, &dir).await {
                ids.push(dump.id);
            }
        }
        tracing::info!(bundle = bundle_id, dumps = ids.len(), "bundle discovered");
        for id in &ids {
            self.schedule_analysis(id)?;
        }
        Ok(ids)
    }

    /// Enqueue the full pipeline for one dump. Runs for the same dump are
    /// serialized.
    pub fn schedule_analysis(&self, id: &DumpIdentifier) -> Result<(), SchedulerError> {
        let pipeline = self.pipeline.clone();
        let repo = self.repo.clone();
        let id = id.clone();
        self.scheduler
            .enqueue_keyed(QUEUE_ANALYSIS, id.to_string(), async move {
                pipeline.analyze(&repo, &id).await.map(|_| ())
            })
    }

    /// Reset a dump and analyze it again. The previous result, its digest
    /// and the analyzer properties are dropped once earlier runs for the
    /// dump have finished, so a failing rerun leaves no stale result.
    pub fn rerun(&self, id: &DumpIdentifier) -> Result<()> {
        if !self.repo.contains(id) {
            return Err(StorageError::DumpNotFound(id.clone()).into());
        }
        self.repo.set_status(id, DumpStatus::Analyzing)?;
        self.repo.set_error_message(id, None)?;

        let pipeline = self.pipeline.clone();
        let repo = self.repo.clone();
        let key = id.clone();
        self.scheduler
            .enqueue_keyed(QUEUE_ANALYSIS, id.to_string(), async move {
                repo.clear_analysis(&key)?;
                pipeline.analyze(&repo, &key).await.map(|_| ())
            })?;
        tracing::info!(dump = %id, "analysis rescheduled");
        Ok(())
    }
}
