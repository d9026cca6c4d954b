use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::admin::AdminActions;
use crate::cluster::ClusterRepository;
use crate::config::Config;
use crate::error::NativeAnalyzerError;
use crate::jobs::{EmptyAnalyzerJob, NativeDumpAnalyzerJob, SimilarityAnalyzerJob, TaggingJob};
use crate::native::{CommandNativeAnalyzer, ExitCodeTable, NativeAnalyzer};
use crate::pipeline::{AnalysisService, AnalyzerPipeline};
use crate::relationships::{RelationshipRepository, RelationshipStore};
use crate::repository::DumpRepository;
use crate::scheduler::JobScheduler;
use crate::similarity::SimilarityService;
use crate::storage::{DumpStorage, FileStorage, InMemoryStorage};
use crate::tagging::DynamicAnalysis;
use crate::types::DumpIdentifier;

/// Fully wired dump analysis service.
pub struct DumpLens {
    config: Config,
    scheduler: Arc<JobScheduler>,
    dumps: Arc<DumpRepository>,
    relationships: Arc<RelationshipRepository>,
    clusters: Arc<ClusterRepository>,
    analysis: AnalysisService,
    admin: AdminActions,
    native_configured: bool,
}

impl DumpLens {
    /// Build on file storage below `config.storage.data_dir`. Must be
    /// called inside a tokio runtime.
    pub fn from_config(config: Config) -> Result<Self> {
        let analyzer = match config.analysis.native_command.as_deref() {
            Some(template) => {
                let analyzer = CommandNativeAnalyzer::new(
                    template,
                    config.analysis.timeout(),
                    Arc::new(ExitCodeTable::default()),
                )
                .context("invalid analysis.native_command")?;
                Some(Arc::new(analyzer) as Arc<dyn NativeAnalyzer>)
            }
            None => None,
        };
        std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
            format!(
                "failed to create data directory '{}'",
                config.storage.data_dir.display()
            )
        })?;
        let storage = Arc::new(FileStorage::new(&config.storage.data_dir));
        Self::with_storage(config, storage.clone(), storage, analyzer)
    }

    /// Volatile variant; work directories are created below `work_root`.
    pub fn in_memory(
        config: Config,
        work_root: &Path,
        analyzer: Option<Arc<dyn NativeAnalyzer>>,
    ) -> Result<Self> {
        let storage = Arc::new(InMemoryStorage::new(work_root));
        Self::with_storage(config, storage.clone(), storage, analyzer)
    }

    pub fn with_storage(
        config: Config,
        dump_storage: Arc<dyn DumpStorage>,
        relationship_store: Arc<dyn RelationshipStore>,
        analyzer: Option<Arc<dyn NativeAnalyzer>>,
    ) -> Result<Self> {
        let scheduler = Arc::new(JobScheduler::new(&config.scheduler.effective_queues()));

        let dumps = Arc::new(DumpRepository::new(dump_storage));
        let loaded = dumps.populate()?;
        let relationships = Arc::new(RelationshipRepository::new(relationship_store));
        relationships.populate(&dumps.ids());
        tracing::info!(dumps = loaded, "loaded dump repository");

        let similarity = Arc::new(SimilarityService::new(
            dumps.clone(),
            relationships.clone(),
            scheduler.clone(),
            config.similarity.max_days,
        ));
        let clusters = Arc::new(ClusterRepository::new(dumps.clone(), relationships.clone()));

        let native_configured = analyzer.is_some();
        let mut pipeline = AnalyzerPipeline::new()
            .with_initial(NativeDumpAnalyzerJob::new(
                dumps.clone(),
                analyzer,
                &config.analysis,
            )?)
            .with_initial(EmptyAnalyzerJob::new(dumps.clone(), &config.analysis)?)
            .with_stage(TaggingJob::new(
                dumps.clone(),
                DynamicAnalysis::with_default_rules(),
            ));
        if config.similarity.enabled {
            pipeline = pipeline.with_post(SimilarityAnalyzerJob::new(
                dumps.clone(),
                similarity.clone(),
                config.similarity.max_days,
            ));
        }
        tracing::debug!(
            stages = ?pipeline.stage_names(),
            post = ?pipeline.post_job_names(),
            "analysis pipeline ready"
        );

        let analysis = AnalysisService::new(Arc::new(pipeline), dumps.clone(), scheduler.clone());
        let admin = AdminActions::new(
            dumps.clone(),
            relationships.clone(),
            similarity,
            clusters.clone(),
        );

        Ok(Self {
            config,
            scheduler,
            dumps,
            relationships,
            clusters,
            analysis,
            admin,
            native_configured,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn dumps(&self) -> &Arc<DumpRepository> {
        &self.dumps
    }

    pub fn relationships(&self) -> &Arc<RelationshipRepository> {
        &self.relationships
    }

    pub fn clusters(&self) -> &Arc<ClusterRepository> {
        &self.clusters
    }

    pub fn analysis(&self) -> &AnalysisService {
        &self.analysis
    }

    pub fn admin(&self) -> &AdminActions {
        &self.admin
    }

    /// Discover and schedule the dumps of an extracted bundle. Requires a
    /// native analyzer.
    pub async fn analyze_bundle(&self, bundle_id: &str, dir: &Path) -> Result<Vec<DumpIdentifier>> {
        if !self.native_configured {
            return Err(NativeAnalyzerError::NotConfigured.into());
        }
        // dump paths are handed to a process running in another directory
        let dir = dir
            .canonicalize()
            .with_context(|| format!("bundle directory '{}' does not exist", dir.display()))?;
        if !dir.is_dir() {
            anyhow::bail!("'{}' is not a directory", dir.display());
        }
        self.analysis.analyze_bundle(bundle_id, &dir).await
    }

    /// Register recurring background work.
    pub fn start_background(&self) -> Result<()> {
        if self.config.similarity.enabled {
            self.clusters
                .start_recurring(&self.scheduler, self.config.similarity.cluster_interval())?;
        }
        Ok(())
    }

    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    /// Drain the queues, stop the workers and persist pending relationships.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown().await;
        self.relationships.flush_dirty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QUEUE_CLUSTERING;
    use crate::native::NativeRequest;
    use crate::result::{AnalysisResult, FrameType, StackFrame, Tag, Thread};
    use crate::types::{DumpStatus, DumpType};
    use async_trait::async_trait;
    use std::time::Duration;

    struct CannedAnalyzer;

    #[async_trait]
    impl NativeAnalyzer for CannedAnalyzer {
        async fn analyze(&self, _request: &NativeRequest) -> Result<AnalysisResult, NativeAnalyzerError> {
            let frames = vec![
                StackFrame::new(FrameType::Native, "app", Some("main")),
                StackFrame::new(FrameType::Native, "libc.so.6", Some("raise")),
            ];
            let mut result = AnalysisResult::default();
            result.system.executable = Some("app".to_string());
            result.threads.insert(7, Thread::new(7, frames));
            Ok(result)
        }
    }

    fn write_bundle(root: &Path) -> std::path::PathBuf {
        let upload = root.join("upload");
        std::fs::create_dir_all(upload.join("app")).unwrap();
        std::fs::create_dir_all(upload.join("logs")).unwrap();
        std::fs::write(upload.join("app/first.dmp"), b"MDMP").unwrap();
        std::fs::write(upload.join("app/second.core"), b"ELF").unwrap();
        std::fs::write(upload.join("logs/readme.txt"), b"hello").unwrap();
        upload
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_to_end_analysis_and_clustering() {
        let dir = tempfile::tempdir().unwrap();
        let upload = write_bundle(dir.path());
        let lens = DumpLens::in_memory(
            Config::default(),
            &dir.path().join("work"),
            Some(Arc::new(CannedAnalyzer)),
        )
        .unwrap();

        let ids = lens.analyze_bundle("bundle-1", &upload).await.unwrap();
        assert_eq!(ids.len(), 3);
        lens.wait_idle().await;

        let dumps = lens.dumps().get_bundle("bundle-1");
        assert!(dumps.iter().all(|d| d.status == DumpStatus::Succeeded));
        let real: Vec<_> = dumps
            .iter()
            .filter(|d| d.dump_type != DumpType::Empty)
            .collect();
        assert_eq!(real.len(), 2);
        for dump in &real {
            let result = lens.dumps().get_result(&dump.id).unwrap().unwrap();
            assert!(result.threads[&7].tags.contains(&Tag::NativeException));
            assert_eq!(dump.properties.get("Executable").map(String::as_str), Some("app"));
        }
        assert_eq!(lens.relationships().relationship(&real[0].id, &real[1].id), 1.0);

        let snapshot = lens.admin().rebuild_cluster_heap();
        assert_eq!(snapshot.clusters.len(), 2);
        assert_eq!(snapshot.cluster_of(&real[0].id).unwrap().size(), 2);

        lens.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_analyze_requires_native_analyzer() {
        let dir = tempfile::tempdir().unwrap();
        let upload = write_bundle(dir.path());
        let lens = DumpLens::in_memory(Config::default(), &dir.path().join("work"), None).unwrap();
        let err = lens.analyze_bundle("b", &upload).await.unwrap_err();
        assert!(err.to_string().contains("native_command"));
        assert!(lens.dumps().get_all().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_command_is_a_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().join("data");
        config.analysis.native_command = Some("tool 'unterminated".to_string());
        let err = DumpLens::from_config(config).err().unwrap();
        assert!(err.to_string().contains("native_command"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_storage_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let upload = write_bundle(dir.path());
        let mut config = Config::default();
        config.storage.data_dir = dir.path().join("data");
        config.analysis.native_command = Some("true".to_string());

        {
            let lens = DumpLens::from_config(config.clone()).unwrap();
            lens.analyze_bundle("b", &upload).await.unwrap();
            lens.wait_idle().await;
            lens.shutdown().await.unwrap();
        }

        let lens = DumpLens::from_config(config).unwrap();
        let dumps = lens.dumps().get_bundle("b");
        assert_eq!(dumps.len(), 3);
        // `true` writes no output file
        let failed = dumps.iter().filter(|d| d.status == DumpStatus::Failed).count();
        assert_eq!(failed, 2);
        lens.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_clustering() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.similarity.cluster_interval_secs = 1;
        let lens = DumpLens::in_memory(config, dir.path(), None).unwrap();
        lens.dumps()
            .create_dump("b", DumpType::WindowsDump, None)
            .unwrap();
        lens.start_background().unwrap();

        let started = std::time::Instant::now();
        while lens.clusters().current().dump_count == 0 && started.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(lens.clusters().current().dump_count, 1);
        assert!(lens
            .scheduler()
            .queue_stats(QUEUE_CLUSTERING)
            .unwrap()
            .enqueued
            >= 1);
        lens.shutdown().await.unwrap();
    }
}
