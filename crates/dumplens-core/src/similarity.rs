use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::config::QUEUE_SIMILARITY;
use crate::digest::{CrashSimilarity, DumpMiniInfo};
use crate::error::SchedulerError;
use crate::relationships::{RelationshipMap, RelationshipRepository};
use crate::repository::DumpRepository;
use crate::scheduler::JobScheduler;
use crate::types::{DumpIdentifier, DumpMetainfo, DumpStatus};

/// Schedules and computes pairwise similarity between dumps.
pub struct SimilarityService {
    dumps: Arc<DumpRepository>,
    relationships: Arc<RelationshipRepository>,
    scheduler: Arc<JobScheduler>,
    /// Dumps with a computation queued or running, with the generation of
    /// the schedule call that owns the marker.
    pending: Mutex<HashMap<DumpIdentifier, u64>>,
    generation: AtomicU64,
    max_days: i64,
}

impl SimilarityService {
    pub fn new(
        dumps: Arc<DumpRepository>,
        relationships: Arc<RelationshipRepository>,
        scheduler: Arc<JobScheduler>,
        max_days: i64,
    ) -> Self {
        Self {
            dumps,
            relationships,
            scheduler,
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            max_days,
        }
    }

    /// Oldest creation time still compared against.
    pub fn window_start(&self) -> DateTime<Utc> {
        Utc::now() - Duration::days(self.max_days)
    }

    /// Queue a computation for `dump`. Returns `false` when skipped because
    /// one is already pending, or because the dump was created before
    /// `not_before` and `force` is off.
    pub fn schedule_similarity_analysis(
        self: &Arc<Self>,
        dump: &DumpMetainfo,
        force: bool,
        not_before: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        if !force && dump.created < not_before {
            tracing::debug!(dump = %dump.id, "too old for similarity analysis");
            return Ok(false);
        }
        let generation = {
            let mut pending = self.pending.lock();
            if pending.contains_key(&dump.id) {
                tracing::debug!(dump = %dump.id, "similarity analysis already pending");
                return Ok(false);
            }
            let generation = self.generation.fetch_add(1, Ordering::Relaxed);
            pending.insert(dump.id.clone(), generation);
            generation
        };

        let this = self.clone();
        let id = dump.id.clone();
        let queued = self.scheduler.enqueue(QUEUE_SIMILARITY, async move {
            let outcome = this.calculate_similarity(&id).await;
            this.release(&id, generation);
            outcome.map(|_| ())
        });
        if let Err(e) = queued {
            self.release(&dump.id, generation);
            return Err(e);
        }
        Ok(true)
    }

    /// Drop the marker for `id` only if it still belongs to `generation`;
    /// a newer schedule after [`Self::clean_queue`] keeps its own.
    fn release(&self, id: &DumpIdentifier, generation: u64) {
        let mut pending = self.pending.lock();
        if pending.get(id) == Some(&generation) {
            pending.remove(id);
        }
    }

    /// Schedule every analyzed dump created since `since`.
    pub fn trigger_for_all(self: &Arc<Self>, since: DateTime<Utc>, force: bool) -> Result<usize> {
        let mut scheduled = 0;
        for dump in self.dumps.get_all() {
            if dump.status != DumpStatus::Succeeded || dump.created < since {
                continue;
            }
            if self.schedule_similarity_analysis(&dump, force, since)? {
                scheduled += 1;
            }
        }
        tracing::info!(scheduled, "triggered similarity analysis");
        Ok(scheduled)
    }

    /// Compare one dump against every other dump in the recent window and
    /// store the scores. Returns the number of peers compared.
    pub async fn calculate_similarity(&self, id: &DumpIdentifier) -> Result<usize> {
        let Some(own) = self.dumps.get_or_create_mini_info(id)? else {
            tracing::debug!(dump = %id, "no result, skipping similarity");
            return Ok(0);
        };

        let since = self.window_start();
        let mut peers: Vec<(DumpIdentifier, DumpMiniInfo)> = Vec::new();
        for other in self.dumps.get_all() {
            if &other.id == id || other.created < since {
                continue;
            }
            match self.dumps.get_or_create_mini_info(&other.id) {
                Ok(Some(info)) => peers.push((other.id, info)),
                Ok(None) => {}
                Err(e) => tracing::warn!(dump = %other.id, "skipping peer: {e:#}"),
            }
        }

        let similarities: RelationshipMap = tokio::task::spawn_blocking(move || {
            peers
                .par_iter()
                .map(|(peer, info)| (peer.clone(), CrashSimilarity::calculate(&own, info).overall))
                .collect::<RelationshipMap>()
        })
        .await?;

        let compared = similarities.len();
        self.relationships.update_similarities(id, &similarities)?;
        tracing::info!(dump = %id, compared, "similarity analysis finished");
        Ok(compared)
    }

    /// Forget pending markers so dumps can be scheduled again. Jobs already
    /// queued still run.
    pub fn clean_queue(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
