//! Groups related dumps into clusters and summarizes each cluster.
//!
//! Clustering is greedy and seeded by recency: dumps are visited newest
//! first, every dump gets (or keeps) a cluster, and its unassigned peers
//! above the similarity threshold join that cluster. Results depend on the
//! visiting order and are not a transitive closure.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::QUEUE_CLUSTERING;
use crate::error::SchedulerError;
use crate::relationships::{RelationshipMap, RelationshipRepository, SIMILARITY_THRESHOLD};
use crate::repository::{
    DumpRepository, PROP_EXECUTABLE, PROP_PROCESS_ARCHITECTURE, PROP_PROCESS_ARGS,
    PROP_SYSTEM_ARCHITECTURE,
};
use crate::scheduler::JobScheduler;
use crate::types::{DumpIdentifier, DumpMetainfo};

pub const MAX_RECENT_DUMPS: usize = 10;
pub const TOP_PROPERTY_VALUES: usize = 3;

pub const PROP_DUMP_FILE_NAME: &str = "DumpFileName";

/// Dimensions summarized for every cluster, in report order.
pub const CLUSTER_PROPERTIES: [&str; 5] = [
    PROP_DUMP_FILE_NAME,
    PROP_SYSTEM_ARCHITECTURE,
    PROP_PROCESS_ARCHITECTURE,
    PROP_EXECUTABLE,
    PROP_PROCESS_ARGS,
];

fn property_value<'a>(dump: &'a DumpMetainfo, property: &str) -> Option<&'a str> {
    if property == PROP_DUMP_FILE_NAME {
        dump.dump_file_name.as_deref()
    } else {
        dump.properties.get(property).map(String::as_str)
    }
}

/// Counts values of one property across a cluster.
#[derive(Debug, Default)]
pub struct StatsBuilder {
    counts: HashMap<String, usize>,
    total: usize,
}

impl StatsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Missing values count toward the total but not toward any value.
    pub fn add(&mut self, value: Option<&str>) {
        self.total += 1;
        if let Some(value) = value {
            *self.counts.entry(value.to_string()).or_insert(0) += 1;
        }
    }

    /// Most frequent values with their share of the total, most frequent
    /// first (ties by value).
    pub fn get_top_x(&self, x: usize) -> Vec<PropertyValue> {
        let mut entries: Vec<(&String, &usize)> = self.counts.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .take(x)
            .map(|(value, count)| PropertyValue {
                value: value.clone(),
                percentage: *count as f64 / self.total as f64,
            })
            .collect()
    }

    pub fn distinct_value_count(&self) -> usize {
        self.counts.len()
    }

    pub fn build(&self, name: &str, top: usize) -> PropertyStat {
        PropertyStat {
            name: name.to_string(),
            top: self.get_top_x(top),
            distinct_count: self.distinct_value_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyValue {
    pub value: String,
    /// Share of the cluster in `[0, 1]`.
    pub percentage: f64,
}

/// How homogeneous a cluster is along one property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyStat {
    pub name: String,
    pub top: Vec<PropertyValue>,
    pub distinct_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    pub id: usize,
    pub dump_ids: BTreeSet<DumpIdentifier>,
    /// Creation time of the oldest member.
    pub first: DateTime<Utc>,
    /// Creation time of the newest member.
    pub latest: DateTime<Utc>,
    pub common_properties: Vec<PropertyStat>,
    /// Newest first.
    pub recent_dumps: Vec<DumpIdentifier>,
}

impl Cluster {
    fn from_members(id: usize, members: &[&DumpMetainfo]) -> Option<Self> {
        let first = members.iter().map(|d| d.created).min()?;
        let latest = members.iter().map(|d| d.created).max()?;

        let mut by_recency: Vec<&&DumpMetainfo> = members.iter().collect();
        by_recency.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
        let recent_dumps = by_recency
            .iter()
            .take(MAX_RECENT_DUMPS)
            .map(|d| d.id.clone())
            .collect();

        let common_properties = CLUSTER_PROPERTIES
            .iter()
            .map(|property| {
                let mut stats = StatsBuilder::new();
                for dump in members {
                    stats.add(property_value(dump, property));
                }
                stats.build(property, TOP_PROPERTY_VALUES)
            })
            .collect();

        Some(Self {
            id,
            dump_ids: members.iter().map(|d| d.id.clone()).collect(),
            first,
            latest,
            common_properties,
            recent_dumps,
        })
    }

    pub fn size(&self) -> usize {
        self.dump_ids.len()
    }

    pub fn contains(&self, id: &DumpIdentifier) -> bool {
        self.dump_ids.contains(id)
    }
}

/// Immutable result of one clustering run.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    pub clusters: Vec<Cluster>,
    pub built_at: DateTime<Utc>,
    /// Number of dumps that were clustered.
    pub dump_count: usize,
}

impl ClusterSnapshot {
    pub fn empty() -> Self {
        Self {
            clusters: Vec::new(),
            built_at: Utc::now(),
            dump_count: 0,
        }
    }

    pub fn cluster_of(&self, id: &DumpIdentifier) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.contains(id))
    }

    /// Clusters with more than one member.
    pub fn multi_dump_clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.iter().filter(|c| c.size() > 1)
    }
}

pub struct ClusterCalculator {
    threshold: f64,
}

impl Default for ClusterCalculator {
    fn default() -> Self {
        Self {
            threshold: SIMILARITY_THRESHOLD,
        }
    }
}

impl ClusterCalculator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Build a snapshot from scratch. Relationships to dumps outside
    /// `dumps` are ignored.
    pub fn calculate(
        &self,
        dumps: &[DumpMetainfo],
        relationships: &HashMap<DumpIdentifier, RelationshipMap>,
    ) -> ClusterSnapshot {
        let known: HashMap<&DumpIdentifier, &DumpMetainfo> =
            dumps.iter().map(|d| (&d.id, d)).collect();

        // relationships are stored per owner; look them up in both directions
        let mut neighbors: HashMap<&DumpIdentifier, HashMap<&DumpIdentifier, f64>> = HashMap::new();
        for (owner, peers) in relationships {
            let Some((owner, _)) = known.get_key_value(owner) else {
                continue;
            };
            for (peer, score) in peers {
                let Some((peer, _)) = known.get_key_value(peer) else {
                    continue;
                };
                for (a, b) in [(*owner, *peer), (*peer, *owner)] {
                    let entry = neighbors.entry(a).or_default().entry(b).or_insert(*score);
                    *entry = entry.max(*score);
                }
            }
        }

        let mut order: Vec<&DumpMetainfo> = dumps.iter().collect();
        order.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));

        let mut assignment: HashMap<&DumpIdentifier, usize> = HashMap::new();
        let mut members: Vec<Vec<&DumpMetainfo>> = Vec::new();
        for dump in &order {
            let cluster = match assignment.get(&dump.id) {
                Some(idx) => *idx,
                None => {
                    members.push(vec![*dump]);
                    assignment.insert(&dump.id, members.len() - 1);
                    members.len() - 1
                }
            };
            let Some(peers) = neighbors.get(&dump.id) else {
                continue;
            };
            let mut similar: Vec<&DumpIdentifier> = peers
                .iter()
                .filter(|(_, score)| **score > self.threshold)
                .map(|(peer, _)| *peer)
                .collect();
            similar.sort();
            for peer in similar {
                if assignment.contains_key(peer) {
                    continue;
                }
                assignment.insert(peer, cluster);
                members[cluster].push(known[peer]);
            }
        }

        let clusters: Vec<Cluster> = members
            .iter()
            .enumerate()
            .filter_map(|(id, m)| Cluster::from_members(id, m))
            .collect();
        ClusterSnapshot {
            dump_count: clusters.iter().map(Cluster::size).sum(),
            clusters,
            built_at: Utc::now(),
        }
    }
}

/// Holds the current snapshot. Readers get a complete snapshot; rebuilds
/// swap in a new one.
pub struct ClusterRepository {
    dumps: Arc<DumpRepository>,
    relationships: Arc<RelationshipRepository>,
    calculator: ClusterCalculator,
    snapshot: RwLock<Arc<ClusterSnapshot>>,
}

impl ClusterRepository {
    pub fn new(dumps: Arc<DumpRepository>, relationships: Arc<RelationshipRepository>) -> Self {
        Self {
            dumps,
            relationships,
            calculator: ClusterCalculator::default(),
            snapshot: RwLock::new(Arc::new(ClusterSnapshot::empty())),
        }
    }

    pub fn current(&self) -> Arc<ClusterSnapshot> {
        self.snapshot.read().clone()
    }

    fn publish(&self, snapshot: ClusterSnapshot) -> Arc<ClusterSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write() = snapshot.clone();
        snapshot
    }

    /// Recompute from the current dumps and relationships and publish.
    pub fn rebuild(&self) -> Arc<ClusterSnapshot> {
        let dumps = self.dumps.get_all();
        let relationships = self.relationships.snapshot();
        let snapshot = self.calculator.calculate(&dumps, &relationships);
        tracing::info!(
            clusters = snapshot.clusters.len(),
            dumps = snapshot.dump_count,
            "rebuilt cluster snapshot"
        );
        self.publish(snapshot)
    }

    /// Rebuild on the clustering queue every `period`.
    pub fn start_recurring(
        self: &Arc<Self>,
        scheduler: &JobScheduler,
        period: Duration,
    ) -> Result<(), SchedulerError> {
        let this = self.clone();
        scheduler.schedule_recurring("cluster-rebuild", QUEUE_CLUSTERING, period, move || {
            let this = this.clone();
            async move {
                tokio::task::spawn_blocking(move || this.rebuild()).await?;
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::types::DumpType;
    use chrono::Duration as ChronoDuration;

    fn dump(name: &str, minutes_ago: i64) -> DumpMetainfo {
        let mut info = DumpMetainfo::new(
            DumpIdentifier::new("b", name),
            DumpType::WindowsDump,
            Utc::now() - ChronoDuration::minutes(minutes_ago),
        );
        info.dump_file_name = Some(format!("{name}.dmp"));
        info
    }

    fn rel(pairs: &[(&DumpMetainfo, &DumpMetainfo, f64)]) -> HashMap<DumpIdentifier, RelationshipMap> {
        let mut map: HashMap<DumpIdentifier, RelationshipMap> = HashMap::new();
        for (a, b, score) in pairs {
            map.entry(a.id.clone()).or_default().insert(b.id.clone(), *score);
        }
        map
    }

    fn ids(cluster: &Cluster) -> Vec<&str> {
        cluster.dump_ids.iter().map(|d| d.dump_id.as_str()).collect()
    }

    #[test]
    fn test_top_x_and_distinct_count() {
        let mut stats = StatsBuilder::new();
        for value in ["x.dmp", "x.dmp", "y.dmp"] {
            stats.add(Some(value));
        }
        let top = stats.get_top_x(1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].value, "x.dmp");
        assert!((top[0].percentage - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.distinct_value_count(), 2);
    }

    #[test]
    fn test_missing_values_count_toward_size_only() {
        let mut stats = StatsBuilder::new();
        stats.add(Some("x64"));
        stats.add(None);
        let stat = stats.build("SystemArchitecture", 3);
        assert_eq!(stat.distinct_count, 1);
        assert_eq!(stat.top[0].percentage, 0.5);
    }

    #[test]
    fn test_threshold_clustering() {
        let a = dump("a", 1);
        let b = dump("b", 2);
        let c = dump("c", 3);
        let relationships = rel(&[(&a, &b, 0.9), (&b, &c, 0.5)]);

        let snapshot =
            ClusterCalculator::default().calculate(&[c.clone(), a.clone(), b.clone()], &relationships);

        assert_eq!(snapshot.clusters.len(), 2);
        assert_eq!(ids(&snapshot.clusters[0]), vec!["a", "b"]);
        assert_eq!(ids(&snapshot.clusters[1]), vec!["c"]);
        assert_eq!(snapshot.dump_count, 3);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let a = dump("a", 1);
        let b = dump("b", 2);
        let snapshot = ClusterCalculator::default().calculate(&[a.clone(), b.clone()], &rel(&[(&a, &b, 0.8)]));
        assert_eq!(snapshot.clusters.len(), 2);
    }

    #[test]
    fn test_first_writer_wins() {
        // b is similar to both a and c; a is newer and claims it first
        let a = dump("a", 1);
        let c = dump("c", 2);
        let b = dump("b", 3);
        let relationships = rel(&[(&a, &b, 0.95), (&c, &b, 0.99)]);

        let snapshot = ClusterCalculator::default().calculate(&[a.clone(), b.clone(), c.clone()], &relationships);

        assert_eq!(ids(snapshot.cluster_of(&b.id).unwrap()), vec!["a", "b"]);
        assert_eq!(ids(snapshot.cluster_of(&c.id).unwrap()), vec!["c"]);
    }

    #[test]
    fn test_relationships_to_unknown_dumps_are_ignored() {
        let a = dump("a", 1);
        let ghost = dump("ghost", 2);
        let snapshot = ClusterCalculator::default().calculate(&[a.clone()], &rel(&[(&a, &ghost, 0.99)]));
        assert_eq!(snapshot.clusters.len(), 1);
        assert_eq!(snapshot.dump_count, 1);
    }

    #[test]
    fn test_cluster_summary() {
        let newest = dump("n", 1);
        let mut members = vec![newest.clone()];
        let mut pairs = Vec::new();
        for i in 0..12 {
            let mut d = dump(&format!("m{i:02}"), 10 + i);
            d.dump_file_name = Some("same.dmp".to_string());
            d.properties
                .insert(PROP_SYSTEM_ARCHITECTURE.to_string(), "x64".to_string());
            members.push(d);
        }
        for m in &members[1..] {
            pairs.push((newest.id.clone(), m.id.clone()));
        }
        let mut relationships: HashMap<DumpIdentifier, RelationshipMap> = HashMap::new();
        for (a, b) in pairs {
            relationships.entry(a).or_default().insert(b, 0.9);
        }

        let snapshot = ClusterCalculator::default().calculate(&members, &relationships);
        assert_eq!(snapshot.clusters.len(), 1);
        let cluster = &snapshot.clusters[0];
        assert_eq!(cluster.size(), 13);
        assert_eq!(cluster.latest, newest.created);
        assert_eq!(cluster.first, members.last().unwrap().created);
        assert_eq!(cluster.recent_dumps.len(), MAX_RECENT_DUMPS);
        assert_eq!(cluster.recent_dumps[0], newest.id);

        let file_names = &cluster.common_properties[0];
        assert_eq!(file_names.name, PROP_DUMP_FILE_NAME);
        assert_eq!(file_names.top[0].value, "same.dmp");
        assert_eq!(file_names.distinct_count, 2);
        let arch = &cluster.common_properties[1];
        assert!((arch.top[0].percentage - 12.0 / 13.0).abs() < 1e-9);
        assert_eq!(cluster.common_properties.len(), CLUSTER_PROPERTIES.len());
    }

    #[test]
    fn test_readers_never_see_partial_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(InMemoryStorage::new(dir.path()));
        let dumps = Arc::new(DumpRepository::new(storage.clone()));
        let relationships = Arc::new(RelationshipRepository::new(storage));
        let repo = Arc::new(ClusterRepository::new(dumps.clone(), relationships.clone()));

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let repo = repo.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    let mut reads = 0usize;
                    while !stop.load(std::sync::atomic::Ordering::SeqCst) {
                        let snapshot = repo.current();
                        let members: usize = snapshot.clusters.iter().map(Cluster::size).sum();
                        assert_eq!(members, snapshot.dump_count);
                        reads += 1;
                    }
                    reads
                })
            })
            .collect();

        let mut previous: Option<DumpIdentifier> = None;
        for _ in 0..50 {
            let info = dumps.create_dump("b", DumpType::WindowsDump, None).unwrap();
            if let Some(prev) = &previous {
                relationships.update_similarity(prev, &info.id, 0.9);
            }
            previous = Some(info.id);
            repo.rebuild();
        }
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(repo.current().dump_count, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recurring_rebuild_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(InMemoryStorage::new(dir.path()));
        let dumps = Arc::new(DumpRepository::new(storage.clone()));
        let relationships = Arc::new(RelationshipRepository::new(storage));
        dumps.create_dump("b", DumpType::WindowsDump, None).unwrap();
        let repo = Arc::new(ClusterRepository::new(dumps, relationships));

        let mut queues = std::collections::BTreeMap::new();
        queues.insert(QUEUE_CLUSTERING.to_string(), 1);
        let scheduler = JobScheduler::new(&queues);
        repo.start_recurring(&scheduler, Duration::from_millis(10))
            .unwrap();

        let started = std::time::Instant::now();
        while repo.current().dump_count == 0 && started.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        scheduler.shutdown().await;
        assert_eq!(repo.current().dump_count, 1);
    }
}
