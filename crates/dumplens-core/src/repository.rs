use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::digest::DumpMiniInfo;
use crate::error::StorageError;
use crate::result::AnalysisResult;
use crate::storage::DumpStorage;
use crate::types::{DumpIdentifier, DumpMetainfo, DumpStatus, DumpType};

/// Property keys used for cluster statistics.
pub const PROP_SYSTEM_ARCHITECTURE: &str = "SystemArchitecture";
pub const PROP_PROCESS_ARCHITECTURE: &str = "ProcArchitecture";
pub const PROP_EXECUTABLE: &str = "Executable";
pub const PROP_PROCESS_ARGS: &str = "ProcessArgs";

/// Properties derived from an analysis result, dropped when it is reset.
pub const ANALYZER_PROPERTIES: &[&str] = &[
    PROP_SYSTEM_ARCHITECTURE,
    PROP_PROCESS_ARCHITECTURE,
    PROP_EXECUTABLE,
    PROP_PROCESS_ARGS,
];

/// Bundle ids become directory names, so they must be a single plain
/// path component without the identifier separator.
pub fn validate_bundle_id(bundle_id: &str) -> Result<(), StorageError> {
    let valid = !bundle_id.is_empty()
        && bundle_id != "."
        && bundle_id != ".."
        && !bundle_id.contains(['/', '\\', ':', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidBundleId(bundle_id.to_string()))
    }
}

/// Index of all dumps over a [`DumpStorage`]. Every mutation writes through.
pub struct DumpRepository {
    storage: Arc<dyn DumpStorage>,
    dumps: RwLock<HashMap<DumpIdentifier, DumpMetainfo>>,
    /// Serializes result writes with digest derivation.
    digests: Mutex<()>,
}

impl DumpRepository {
    pub fn new(storage: Arc<dyn DumpStorage>) -> Self {
        Self {
            storage,
            dumps: RwLock::new(HashMap::new()),
            digests: Mutex::new(()),
        }
    }

    /// Load everything the storage already holds.
    pub fn populate(&self) -> Result<usize> {
        let all = self.storage.load_all()?;
        let mut dumps = self.dumps.write();
        for info in all {
            dumps.insert(info.id.clone(), info);
        }
        Ok(dumps.len())
    }

    /// Register a new dump with the next free sequential id in its bundle.
    pub fn create_dump(
        &self,
        bundle_id: &str,
        dump_type: DumpType,
        dump_file: Option<&Path>,
    ) -> Result<DumpMetainfo> {
        validate_bundle_id(bundle_id)?;
        let info = {
            let mut dumps = self.dumps.write();
            let next = dumps
                .keys()
                .filter(|id| id.bundle_id == bundle_id)
                .filter_map(|id| id.dump_id.parse::<u64>().ok())
                .max()
                .map_or(1, |n| n + 1);
            let mut info = DumpMetainfo::new(
                DumpIdentifier::new(bundle_id, next.to_string()),
                dump_type,
                Utc::now(),
            );
            info.dump_file = dump_file.map(Path::to_path_buf);
            info.dump_file_name = dump_file
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned());
            dumps.insert(info.id.clone(), info.clone());
            info
        };
        self.storage.store_metainfo(&info)?;
        tracing::debug!(dump = %info.id, "created dump");
        Ok(info)
    }

    /// Insert or replace a record verbatim.
    pub fn insert(&self, info: DumpMetainfo) -> Result<()> {
        self.storage.store_metainfo(&info)?;
        self.dumps.write().insert(info.id.clone(), info);
        Ok(())
    }

    fn update(&self, id: &DumpIdentifier, f: impl FnOnce(&mut DumpMetainfo)) -> Result<DumpMetainfo> {
        let info = {
            let mut dumps = self.dumps.write();
            let info = dumps
                .get_mut(id)
                .ok_or_else(|| StorageError::DumpNotFound(id.clone()))?;
            f(info);
            info.clone()
        };
        self.storage.store_metainfo(&info)?;
        Ok(info)
    }

    /// Terminal states stamp `finished`; `Analyzing` clears it.
    pub fn set_status(&self, id: &DumpIdentifier, status: DumpStatus) -> Result<DumpMetainfo> {
        self.update(id, |info| {
            info.status = status;
            info.finished = if status.is_terminal() {
                Some(Utc::now())
            } else {
                None
            };
        })
    }

    pub fn set_error_message(&self, id: &DumpIdentifier, message: Option<String>) -> Result<DumpMetainfo> {
        self.update(id, |info| info.error_message = message)
    }

    pub fn set_properties(
        &self,
        id: &DumpIdentifier,
        properties: impl IntoIterator<Item = (String, String)>,
    ) -> Result<DumpMetainfo> {
        self.update(id, |info| info.properties.extend(properties))
    }

    pub fn get(&self, id: &DumpIdentifier) -> Option<DumpMetainfo> {
        self.dumps.read().get(id).cloned()
    }

    pub fn contains(&self, id: &DumpIdentifier) -> bool {
        self.dumps.read().contains_key(id)
    }

    /// All dumps ordered by identifier.
    pub fn get_all(&self) -> Vec<DumpMetainfo> {
        let mut all: Vec<_> = self.dumps.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn get_bundle(&self, bundle_id: &str) -> Vec<DumpMetainfo> {
        self.get_all()
            .into_iter()
            .filter(|d| d.id.bundle_id == bundle_id)
            .collect()
    }

    pub fn ids(&self) -> Vec<DumpIdentifier> {
        self.dumps.read().keys().cloned().collect()
    }

    pub fn get_result(&self, id: &DumpIdentifier) -> Result<Option<AnalysisResult>> {
        self.storage.read_result(id)
    }

    /// Store a result and replace the digest derived from the previous one.
    pub fn write_result(&self, id: &DumpIdentifier, result: &AnalysisResult) -> Result<()> {
        let _guard = self.digests.lock();
        self.storage.write_result(id, result)?;
        self.storage
            .store_mini_info(id, &DumpMiniInfo::from_result(result))
    }

    /// Forget everything a previous analysis produced: the result, its
    /// digest and the analyzer properties.
    pub fn clear_analysis(&self, id: &DumpIdentifier) -> Result<DumpMetainfo> {
        {
            let _guard = self.digests.lock();
            self.storage.remove_result(id)?;
        }
        self.update(id, |info| {
            info.properties
                .retain(|key, _| !ANALYZER_PROPERTIES.contains(&key.as_str()));
        })
    }

    /// Stored digest, rebuilt from the result when missing or outdated.
    pub fn get_or_create_mini_info(&self, id: &DumpIdentifier) -> Result<Option<DumpMiniInfo>> {
        let _guard = self.digests.lock();
        if let Some(info) = self.storage.read_mini_info(id)? {
            if info.is_current() {
                return Ok(Some(info));
            }
        }
        let Some(result) = self.storage.read_result(id)? else {
            return Ok(None);
        };
        let info = DumpMiniInfo::from_result(&result);
        self.storage.store_mini_info(id, &info)?;
        Ok(Some(info))
    }

    pub fn work_dir(&self, id: &DumpIdentifier) -> Result<PathBuf> {
        self.storage.work_dir(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{FrameType, StackFrame, Tag, Thread};
    use crate::storage::{FileStorage, InMemoryStorage};

    fn repo() -> (tempfile::TempDir, DumpRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = DumpRepository::new(Arc::new(InMemoryStorage::new(dir.path())));
        (dir, repo)
    }

    #[test]
    fn test_create_dump_assigns_sequential_ids() {
        let (_dir, repo) = repo();
        let a = repo
            .create_dump("bundle", DumpType::WindowsDump, Some(Path::new("/x/a.dmp")))
            .unwrap();
        let b = repo.create_dump("bundle", DumpType::Empty, None).unwrap();
        let other = repo.create_dump("other", DumpType::Empty, None).unwrap();

        assert_eq!(a.id.to_string(), "bundle:1");
        assert_eq!(b.id.to_string(), "bundle:2");
        assert_eq!(other.id.to_string(), "other:1");
        assert_eq!(a.dump_file_name.as_deref(), Some("a.dmp"));
        assert_eq!(a.status, DumpStatus::Created);
    }

    #[test]
    fn test_set_status_stamps_finished() {
        let (_dir, repo) = repo();
        let info = repo.create_dump("b", DumpType::WindowsDump, None).unwrap();
        let analyzing = repo.set_status(&info.id, DumpStatus::Analyzing).unwrap();
        assert!(analyzing.finished.is_none());
        let done = repo.set_status(&info.id, DumpStatus::Failed).unwrap();
        assert!(done.finished.is_some());
        assert_eq!(repo.get(&info.id).unwrap().status, DumpStatus::Failed);
    }

    #[test]
    fn test_update_unknown_dump_fails() {
        let (_dir, repo) = repo();
        let err = repo
            .set_status(&DumpIdentifier::new("x", "1"), DumpStatus::Succeeded)
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_populate_reloads_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::new(dir.path()));
        let repo = DumpRepository::new(storage.clone());
        let info = repo.create_dump("b", DumpType::LinuxCoreDump, None).unwrap();
        repo.set_error_message(&info.id, Some("boom".to_string()))
            .unwrap();

        let reloaded = DumpRepository::new(storage);
        assert_eq!(reloaded.populate().unwrap(), 1);
        let got = reloaded.get(&info.id).unwrap();
        assert_eq!(got.error_message.as_deref(), Some("boom"));
        let next = reloaded.create_dump("b", DumpType::Empty, None).unwrap();
        assert_eq!(next.id.dump_id, "2");
    }

    #[test]
    fn test_mini_info_derived_lazily() {
        let (_dir, repo) = repo();
        let info = repo.create_dump("b", DumpType::WindowsDump, None).unwrap();
        assert!(repo.get_or_create_mini_info(&info.id).unwrap().is_none());

        repo.write_result(&info.id, &AnalysisResult::default())
            .unwrap();
        let mini = repo.get_or_create_mini_info(&info.id).unwrap().unwrap();
        assert!(mini.is_current());
    }

    fn raise_result(tagged: bool) -> AnalysisResult {
        let frames = vec![StackFrame::new(FrameType::Native, "libc.so.6", Some("raise"))];
        let mut thread = Thread::new(1, frames);
        if tagged {
            thread.tags.insert(Tag::NativeException);
        }
        let mut result = AnalysisResult::default();
        result.threads.insert(1, thread);
        result
    }

    #[test]
    fn test_mini_info_follows_rewritten_result() {
        let (_dir, repo) = repo();
        let info = repo.create_dump("b", DumpType::LinuxCoreDump, None).unwrap();

        repo.write_result(&info.id, &raise_result(false)).unwrap();
        let untagged = repo.get_or_create_mini_info(&info.id).unwrap().unwrap();
        assert!(untagged.faulting_thread.is_none());

        let tagged = raise_result(true);
        repo.write_result(&info.id, &tagged).unwrap();
        let fresh = repo.get_or_create_mini_info(&info.id).unwrap().unwrap();
        assert_eq!(fresh, DumpMiniInfo::from_result(&tagged));
        assert!(fresh.faulting_thread.is_some());
    }

    #[test]
    fn test_clear_analysis_drops_result_and_analyzer_properties() {
        let (_dir, repo) = repo();
        let info = repo.create_dump("b", DumpType::LinuxCoreDump, None).unwrap();
        repo.write_result(&info.id, &raise_result(true)).unwrap();
        repo.set_properties(
            &info.id,
            [
                (PROP_EXECUTABLE.to_string(), "/bin/app".to_string()),
                ("Owner".to_string(), "ops".to_string()),
            ],
        )
        .unwrap();

        let cleared = repo.clear_analysis(&info.id).unwrap();

        assert!(repo.get_result(&info.id).unwrap().is_none());
        assert!(repo.get_or_create_mini_info(&info.id).unwrap().is_none());
        assert!(!cleared.properties.contains_key(PROP_EXECUTABLE));
        assert_eq!(cleared.properties.get("Owner").map(String::as_str), Some("ops"));
    }

    #[test]
    fn test_bundle_id_must_be_a_plain_name() {
        let (_dir, repo) = repo();
        for bad in ["", ".", "..", "../x", "a/b", "a\\b", "a:b"] {
            let err = repo.create_dump(bad, DumpType::Empty, None).unwrap_err();
            assert!(err.to_string().contains("invalid bundle id"), "{bad}: {err}");
        }
        assert!(repo.get_all().is_empty());
        assert!(repo.create_dump("bundle-1.v2", DumpType::Empty, None).is_ok());
    }
}
