use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::cluster::{ClusterRepository, ClusterSnapshot};
use crate::error::StorageError;
use crate::relationships::RelationshipRepository;
use crate::repository::DumpRepository;
use crate::similarity::SimilarityService;
use crate::types::DumpIdentifier;

/// Maintenance operations on similarity data.
#[derive(Clone)]
pub struct AdminActions {
    dumps: Arc<DumpRepository>,
    relationships: Arc<RelationshipRepository>,
    similarity: Arc<SimilarityService>,
    clusters: Arc<ClusterRepository>,
}

impl AdminActions {
    pub fn new(
        dumps: Arc<DumpRepository>,
        relationships: Arc<RelationshipRepository>,
        similarity: Arc<SimilarityService>,
        clusters: Arc<ClusterRepository>,
    ) -> Self {
        Self {
            dumps,
            relationships,
            similarity,
            clusters,
        }
    }

    /// Recompute similarity for one dump regardless of its age.
    pub fn trigger_similarity_analysis(&self, id: &DumpIdentifier) -> Result<bool> {
        let dump = self
            .dumps
            .get(id)
            .ok_or_else(|| StorageError::DumpNotFound(id.clone()))?;
        let scheduled =
            self.similarity
                .schedule_similarity_analysis(&dump, true, DateTime::<Utc>::MIN_UTC)?;
        Ok(scheduled)
    }

    /// Recompute similarity for every analyzed dump of the last `days` days.
    pub fn trigger_similarity_analysis_since(&self, days: i64, force: bool) -> Result<usize> {
        let since = Utc::now() - Duration::days(days);
        self.similarity.trigger_for_all(since, force)
    }

    pub fn wipe_all_relationships(&self) -> Result<()> {
        self.relationships.wipe_all(&self.dumps.ids())
    }

    pub fn rebuild_cluster_heap(&self) -> Arc<ClusterSnapshot> {
        self.clusters.rebuild()
    }

    pub fn clean_similarity_queue(&self) -> usize {
        let dropped = self.similarity.clean_queue();
        tracing::info!(dropped, "cleaned similarity queue");
        dropped
    }
}
