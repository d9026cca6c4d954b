use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::types::DumpIdentifier;

/// Similarity scores owned by one dump, keyed by the peer.
pub type RelationshipMap = HashMap<DumpIdentifier, f64>;

/// Score above which two dumps count as related.
pub const SIMILARITY_THRESHOLD: f64 = 0.8;

/// Persistence contract for per-dump relationship maps. Writes overwrite.
pub trait RelationshipStore: Send + Sync {
    fn read_relationships(&self, id: &DumpIdentifier) -> Result<Option<RelationshipMap>>;
    fn store_relationships(&self, id: &DumpIdentifier, relationships: &RelationshipMap) -> Result<()>;
    fn wipe(&self, id: &DumpIdentifier) -> Result<()>;
}

#[derive(Default)]
struct Cache {
    relationships: HashMap<DumpIdentifier, RelationshipMap>,
    dirty: HashSet<DumpIdentifier>,
}

/// In-memory view of all relationships with write-back to a store.
pub struct RelationshipRepository {
    store: Arc<dyn RelationshipStore>,
    cache: Mutex<Cache>,
}

impl RelationshipRepository {
    pub fn new(store: Arc<dyn RelationshipStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Load stored relationships for the given dumps. Unreadable entries
    /// are wiped so they get recomputed.
    pub fn populate<'a>(&self, ids: impl IntoIterator<Item = &'a DumpIdentifier>) {
        let mut loaded = Vec::new();
        for id in ids {
            match self.store.read_relationships(id) {
                Ok(Some(map)) => loaded.push((id.clone(), map)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(dump = %id, "wiping corrupt relationships: {e:#}");
                    if let Err(e) = self.store.wipe(id) {
                        tracing::error!(dump = %id, "failed to wipe relationships: {e:#}");
                    }
                }
            }
        }
        let mut cache = self.cache.lock();
        for (id, map) in loaded {
            cache.relationships.insert(id, map);
        }
    }

    /// Record a score in both directions and mark both owners dirty.
    pub fn update_similarity(&self, a: &DumpIdentifier, b: &DumpIdentifier, similarity: f64) {
        if a == b {
            return;
        }
        let mut cache = self.cache.lock();
        cache
            .relationships
            .entry(a.clone())
            .or_default()
            .insert(b.clone(), similarity);
        cache
            .relationships
            .entry(b.clone())
            .or_default()
            .insert(a.clone(), similarity);
        cache.dirty.insert(a.clone());
        cache.dirty.insert(b.clone());
    }

    /// Record all scores of one computation and persist the touched owners.
    pub fn update_similarities(
        &self,
        id: &DumpIdentifier,
        similarities: &RelationshipMap,
    ) -> Result<()> {
        for (other, score) in similarities {
            self.update_similarity(id, other, *score);
        }
        self.flush_dirty()
    }

    /// Persist every owner changed since the last flush.
    pub fn flush_dirty(&self) -> Result<()> {
        let pending: Vec<(DumpIdentifier, RelationshipMap)> = {
            let mut cache = self.cache.lock();
            let dirty: Vec<DumpIdentifier> = cache.dirty.drain().collect();
            dirty
                .into_iter()
                .filter_map(|id| {
                    let map = cache.relationships.get(&id).cloned()?;
                    Some((id, map))
                })
                .collect()
        };
        for (id, map) in &pending {
            if let Err(e) = self.store.store_relationships(id, map) {
                // keep it dirty so the next flush retries
                self.cache.lock().dirty.insert(id.clone());
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn relationships(&self, id: &DumpIdentifier) -> RelationshipMap {
        self.cache
            .lock()
            .relationships
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Stored score between two dumps, looked up in both directions.
    pub fn relationship(&self, a: &DumpIdentifier, b: &DumpIdentifier) -> f64 {
        let cache = self.cache.lock();
        cache
            .relationships
            .get(a)
            .and_then(|m| m.get(b))
            .or_else(|| cache.relationships.get(b).and_then(|m| m.get(a)))
            .copied()
            .unwrap_or(0.0)
    }

    /// Peers scoring strictly above `threshold`, highest first.
    pub fn similar_dumps(&self, id: &DumpIdentifier, threshold: f64) -> Vec<(DumpIdentifier, f64)> {
        let mut similar: Vec<_> = self
            .relationships(id)
            .into_iter()
            .filter(|(_, score)| *score > threshold)
            .collect();
        similar.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        similar
    }

    /// Copy of the whole relationship graph, for clustering.
    pub fn snapshot(&self) -> HashMap<DumpIdentifier, RelationshipMap> {
        self.cache.lock().relationships.clone()
    }

    pub fn wipe(&self, id: &DumpIdentifier) -> Result<()> {
        {
            let mut cache = self.cache.lock();
            cache.relationships.remove(id);
            cache.dirty.remove(id);
        }
        self.store.wipe(id)
    }

    /// Drop every relationship in memory and in the store. `known` covers
    /// owners persisted but never loaded.
    pub fn wipe_all<'a>(&self, known: impl IntoIterator<Item = &'a DumpIdentifier>) -> Result<()> {
        let mut owners: HashSet<DumpIdentifier> = {
            let mut cache = self.cache.lock();
            cache.dirty.clear();
            cache.relationships.drain().map(|(id, _)| id).collect()
        };
        owners.extend(known.into_iter().cloned());
        for id in &owners {
            self.store.wipe(id)?;
        }
        tracing::info!(count = owners.len(), "wiped all relationships");
        Ok(())
    }
}
