use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::digest::DumpMiniInfo;
use crate::relationships::{RelationshipMap, RelationshipStore};
use crate::result::AnalysisResult;
use crate::types::{DumpIdentifier, DumpMetainfo};

/// Key/value contract the pipeline needs from dump persistence.
pub trait DumpStorage: Send + Sync {
    fn load_all(&self) -> Result<Vec<DumpMetainfo>>;
    fn get_metainfo(&self, id: &DumpIdentifier) -> Result<Option<DumpMetainfo>>;
    fn store_metainfo(&self, info: &DumpMetainfo) -> Result<()>;
    fn read_result(&self, id: &DumpIdentifier) -> Result<Option<AnalysisResult>>;
    fn write_result(&self, id: &DumpIdentifier, result: &AnalysisResult) -> Result<()>;
    fn read_mini_info(&self, id: &DumpIdentifier) -> Result<Option<DumpMiniInfo>>;
    fn store_mini_info(&self, id: &DumpIdentifier, info: &DumpMiniInfo) -> Result<()>;
    /// Drop the stored result and the digest derived from it.
    fn remove_result(&self, id: &DumpIdentifier) -> Result<()>;
    /// Scratch directory for a dump's stage artifacts. Created on demand.
    fn work_dir(&self, id: &DumpIdentifier) -> Result<PathBuf>;
}

const METAINFO_FILE: &str = "metainfo.json";
const RESULT_FILE: &str = "result.json";
const MINI_INFO_FILE: &str = "miniinfo.json";
const RELATIONSHIPS_FILE: &str = "relationships.json";

/// JSON files under `<root>/<bundle>/<dump>/`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dump_dir(&self, id: &DumpIdentifier) -> PathBuf {
        self.root.join(&id.bundle_id).join(&id.dump_id)
    }

    fn read_json<T: DeserializeOwned>(&self, id: &DumpIdentifier, file: &str) -> Result<Option<T>> {
        let path = self.dump_dir(id).join(file);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse '{}'", path.display()))?;
        Ok(Some(value))
    }

    fn write_json<T: Serialize>(&self, id: &DumpIdentifier, file: &str, value: &T) -> Result<()> {
        let dir = self.dump_dir(id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create '{}'", dir.display()))?;
        let path = dir.join(file);
        let content = serde_json::to_string_pretty(value)
            .with_context(|| format!("failed to serialize '{file}' for {id}"))?;
        std::fs::write(&path, content)
            .with_context(|| format!("failed to write '{}'", path.display()))?;
        Ok(())
    }
}

impl DumpStorage for FileStorage {
    fn load_all(&self) -> Result<Vec<DumpMetainfo>> {
        let mut infos = Vec::new();
        if !self.root.exists() {
            return Ok(infos);
        }
        for entry in walkdir::WalkDir::new(&self.root)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() == METAINFO_FILE)
        {
            let path = entry.path();
            let parsed = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read '{}'", path.display()))
                .and_then(|content| {
                    serde_json::from_str::<DumpMetainfo>(&content)
                        .with_context(|| format!("failed to parse '{}'", path.display()))
                });
            match parsed {
                Ok(info) => infos.push(info),
                Err(e) => tracing::warn!("skipping dump: {e:#}"),
            }
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    fn get_metainfo(&self, id: &DumpIdentifier) -> Result<Option<DumpMetainfo>> {
        self.read_json(id, METAINFO_FILE)
    }

    fn store_metainfo(&self, info: &DumpMetainfo) -> Result<()> {
        self.write_json(&info.id, METAINFO_FILE, info)
    }

    fn read_result(&self, id: &DumpIdentifier) -> Result<Option<AnalysisResult>> {
        self.read_json(id, RESULT_FILE)
    }

    fn write_result(&self, id: &DumpIdentifier, result: &AnalysisResult) -> Result<()> {
        self.write_json(id, RESULT_FILE, result)
    }

    fn read_mini_info(&self, id: &DumpIdentifier) -> Result<Option<DumpMiniInfo>> {
        self.read_json(id, MINI_INFO_FILE)
    }

    fn store_mini_info(&self, id: &DumpIdentifier, info: &DumpMiniInfo) -> Result<()> {
        self.write_json(id, MINI_INFO_FILE, info)
    }

    fn remove_result(&self, id: &DumpIdentifier) -> Result<()> {
        for file in [RESULT_FILE, MINI_INFO_FILE] {
            let path = self.dump_dir(id).join(file);
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove '{}'", path.display()))?;
            }
        }
        Ok(())
    }

    fn work_dir(&self, id: &DumpIdentifier) -> Result<PathBuf> {
        let dir = self.dump_dir(id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create '{}'", dir.display()))?;
        Ok(dir)
    }
}

impl RelationshipStore for FileStorage {
    fn read_relationships(&self, id: &DumpIdentifier) -> Result<Option<RelationshipMap>> {
        self.read_json(id, RELATIONSHIPS_FILE)
    }

    fn store_relationships(&self, id: &DumpIdentifier, relationships: &RelationshipMap) -> Result<()> {
        self.write_json(id, RELATIONSHIPS_FILE, relationships)
    }

    fn wipe(&self, id: &DumpIdentifier) -> Result<()> {
        let path = self.dump_dir(id).join(RELATIONSHIPS_FILE);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove '{}'", path.display()))?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    metainfo: HashMap<DumpIdentifier, DumpMetainfo>,
    results: HashMap<DumpIdentifier, AnalysisResult>,
    mini_infos: HashMap<DumpIdentifier, DumpMiniInfo>,
    relationships: HashMap<DumpIdentifier, RelationshipMap>,
}

/// Volatile storage for tests and one-shot runs. Work directories still
/// live on disk below `work_root`.
pub struct InMemoryStorage {
    state: Mutex<MemoryState>,
    work_root: PathBuf,
}

impl InMemoryStorage {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            work_root: work_root.into(),
        }
    }
}

impl DumpStorage for InMemoryStorage {
    fn load_all(&self) -> Result<Vec<DumpMetainfo>> {
        let mut infos: Vec<_> = self.state.lock().metainfo.values().cloned().collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    fn get_metainfo(&self, id: &DumpIdentifier) -> Result<Option<DumpMetainfo>> {
        Ok(self.state.lock().metainfo.get(id).cloned())
    }

    fn store_metainfo(&self, info: &DumpMetainfo) -> Result<()> {
        self.state
            .lock()
            .metainfo
            .insert(info.id.clone(), info.clone());
        Ok(())
    }

    fn read_result(&self, id: &DumpIdentifier) -> Result<Option<AnalysisResult>> {
        Ok(self.state.lock().results.get(id).cloned())
    }

    fn write_result(&self, id: &DumpIdentifier, result: &AnalysisResult) -> Result<()> {
        self.state.lock().results.insert(id.clone(), result.clone());
        Ok(())
    }

    fn read_mini_info(&self, id: &DumpIdentifier) -> Result<Option<DumpMiniInfo>> {
        Ok(self.state.lock().mini_infos.get(id).cloned())
    }

    fn store_mini_info(&self, id: &DumpIdentifier, info: &DumpMiniInfo) -> Result<()> {
        self.state.lock().mini_infos.insert(id.clone(), info.clone());
        Ok(())
    }

    fn remove_result(&self, id: &DumpIdentifier) -> Result<()> {
        let mut state = self.state.lock();
        state.results.remove(id);
        state.mini_infos.remove(id);
        Ok(())
    }

    fn work_dir(&self, id: &DumpIdentifier) -> Result<PathBuf> {
        let dir = self.work_root.join(&id.bundle_id).join(&id.dump_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create '{}'", dir.display()))?;
        Ok(dir)
    }
}

impl RelationshipStore for InMemoryStorage {
    fn read_relationships(&self, id: &DumpIdentifier) -> Result<Option<RelationshipMap>> {
        Ok(self.state.lock().relationships.get(id).cloned())
    }

    fn store_relationships(&self, id: &DumpIdentifier, relationships: &RelationshipMap) -> Result<()> {
        self.state
            .lock()
            .relationships
            .insert(id.clone(), relationships.clone());
        Ok(())
    }

    fn wipe(&self, id: &DumpIdentifier) -> Result<()> {
        self.state.lock().relationships.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DumpType;
    use chrono::Utc;

    fn sample(bundle: &str, dump: &str) -> DumpMetainfo {
        DumpMetainfo::new(DumpIdentifier::new(bundle, dump), DumpType::WindowsDump, Utc::now())
    }

    #[test]
    fn test_file_storage_metainfo_persists() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let info = sample("b1", "d1");
        storage.store_metainfo(&info).unwrap();

        assert!(dir.path().join("b1").join("d1").join(METAINFO_FILE).exists());
        let loaded = storage.get_metainfo(&info.id).unwrap().unwrap();
        assert_eq!(loaded.id, info.id);
        assert!(storage
            .get_metainfo(&DumpIdentifier::new("b1", "other"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_file_storage_load_all_skips_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.store_metainfo(&sample("b1", "d2")).unwrap();
        storage.store_metainfo(&sample("b1", "d1")).unwrap();
        let broken = dir.path().join("b2").join("d1");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(METAINFO_FILE), "{not json").unwrap();

        let all = storage.load_all().unwrap();
        let ids: Vec<String> = all.iter().map(|i| i.id.to_string()).collect();
        assert_eq!(ids, vec!["b1:d1", "b1:d2"]);
    }

    #[test]
    fn test_file_storage_relationships_wipe() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let id = DumpIdentifier::new("b", "d");
        let mut map = RelationshipMap::new();
        map.insert(DumpIdentifier::new("b", "e"), 0.9);
        storage.store_relationships(&id, &map).unwrap();
        assert_eq!(storage.read_relationships(&id).unwrap(), Some(map));

        storage.wipe(&id).unwrap();
        assert!(storage.read_relationships(&id).unwrap().is_none());
        storage.wipe(&id).unwrap();
    }

    #[test]
    fn test_in_memory_storage_result_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = InMemoryStorage::new(dir.path());
        let id = DumpIdentifier::new("b", "d");
        assert!(storage.read_result(&id).unwrap().is_none());
        storage.write_result(&id, &AnalysisResult::default()).unwrap();
        assert!(storage.read_result(&id).unwrap().is_some());
        assert!(storage.work_dir(&id).unwrap().is_dir());
    }

    #[test]
    fn test_file_storage_remove_result_drops_digest() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let id = DumpIdentifier::new("b", "d");
        let result = AnalysisResult::default();
        storage.write_result(&id, &result).unwrap();
        storage
            .store_mini_info(&id, &DumpMiniInfo::from_result(&result))
            .unwrap();

        storage.remove_result(&id).unwrap();
        assert!(storage.read_result(&id).unwrap().is_none());
        assert!(storage.read_mini_info(&id).unwrap().is_none());
        storage.remove_result(&id).unwrap();
    }
}
