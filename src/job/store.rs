//! Single-job persistence over an injected key-value store.
//!
//! The store holds at most one [`JobRecord`], serialised as JSON under
//! [`STORAGE_KEY`]. Reads never fail: missing or unparsable data is "no job".
//! Writes are last-write-wins.

use super::record::{JobPatch, JobRecord};
use crate::error::StoreError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, warn};

/// Well-known key the active job lives under.
pub const STORAGE_KEY: &str = "handwritten_job";

/// Minimal string key-value persistence.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process store; state disappears with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries().remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a directory.
///
/// Writes go to a temp file first and are renamed into place, so a crash
/// mid-write never leaves a truncated record behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<platform data dir>/handdoc`, e.g. `~/.local/share/handdoc` on Linux.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join("handdoc"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let write_err = |source| StoreError::Write {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(write_err)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, value).map_err(write_err)?;
        std::fs::rename(&tmp_path, &path).map_err(write_err)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Remove { path, source }),
        }
    }
}

/// The single active job on this device.
#[derive(Debug)]
pub struct JobStore<S> {
    kv: S,
}

impl<S: KeyValueStore> JobStore<S> {
    pub fn new(kv: S) -> Self {
        Self { kv }
    }

    pub fn backing(&self) -> &S {
        &self.kv
    }

    /// Replace whatever is stored with `job`.
    ///
    /// A record without a job id is refused: it is logged and `Ok(false)` is
    /// returned without touching storage.
    pub fn save(&self, job: &JobRecord) -> Result<bool, StoreError> {
        if job.job_id.trim().is_empty() {
            error!("Refusing to save a job record without a job id");
            return Ok(false);
        }
        let json = serde_json::to_string(job)?;
        self.kv.set(STORAGE_KEY, &json)?;
        debug!("Saved job {} in state {}", job.job_id, job.state);
        Ok(true)
    }

    /// The stored job, or `None` if there is none or it cannot be parsed.
    pub fn load(&self) -> Option<JobRecord> {
        let raw = self.kv.get(STORAGE_KEY)?;
        match serde_json::from_str::<JobRecord>(&raw) {
            Ok(job) if !job.job_id.trim().is_empty() => Some(job),
            Ok(_) => {
                warn!("Ignoring stored job record without a job id");
                None
            }
            Err(e) => {
                warn!("Ignoring unreadable job record: {}", e);
                None
            }
        }
    }

    /// Merge `patch` into the stored job. The stored job id always wins.
    ///
    /// Returns the updated record, or `None` (and writes nothing) when no job
    /// is stored.
    pub fn patch(&self, patch: JobPatch) -> Result<Option<JobRecord>, StoreError> {
        let Some(mut job) = self.load() else {
            debug!("Patch ignored: no job stored");
            return Ok(None);
        };
        patch.merge_into(&mut job);
        self.save(&job)?;
        Ok(Some(job))
    }

    /// Remove the stored job, if any.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.kv.remove(STORAGE_KEY)?;
        debug!("Cleared stored job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSource, JobState};

    fn store() -> JobStore<MemoryStore> {
        JobStore::new(MemoryStore::new())
    }

    #[test]
    fn patch_preserves_identity() {
        let store = store();
        store
            .save(&JobRecord::new("abc", "/tmp/a.png", JobSource::Scanned, true))
            .unwrap();
        let patched = store
            .patch(JobPatch {
                job_id: Some("xyz".into()),
                state: Some(JobState::Paid),
                ..Default::default()
            })
            .unwrap()
            .unwrap();
        assert_eq!(patched.job_id, "abc");
        let loaded = store.load().unwrap();
        assert_eq!(loaded.job_id, "abc");
        assert_eq!(loaded.state, JobState::Paid);
    }

    #[test]
    fn patch_on_absent_job_is_noop() {
        let store = store();
        let out = store
            .patch(JobPatch {
                state: Some(JobState::Paid),
                ..Default::default()
            })
            .unwrap();
        assert!(out.is_none());
        assert!(store.load().is_none());
        assert!(store.backing().get(STORAGE_KEY).is_none());
    }

    #[test]
    fn save_rejects_missing_job_id() {
        let store = store();
        let saved = store
            .save(&JobRecord::new("", "p", JobSource::Scanned, true))
            .unwrap();
        assert!(!saved);
        assert!(store.load().is_none());
    }

    #[test]
    fn save_replaces_previous_job() {
        let store = store();
        store
            .save(&JobRecord::new("one", "p1", JobSource::Scanned, true))
            .unwrap();
        store
            .save(&JobRecord::new("two", "p2", JobSource::DigitalPdf, false))
            .unwrap();
        let job = store.load().unwrap();
        assert_eq!(job.job_id, "two");
        assert!(!job.strict);
    }

    #[test]
    fn unreadable_record_loads_as_none() {
        let store = store();
        store.backing().set(STORAGE_KEY, "{not json").unwrap();
        assert!(store.load().is_none());
        store.backing().set(STORAGE_KEY, r#"{"state":"ready"}"#).unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn clear_removes_record() {
        let store = store();
        store
            .save(&JobRecord::new("abc", "p", JobSource::Scanned, true))
            .unwrap();
        store.clear().unwrap();
        assert!(store.load().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn file_store_roundtrips_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(FileStore::new(dir.path().join("state")));
        store
            .save(&JobRecord::new("abc", "p", JobSource::Scanned, true))
            .unwrap();
        assert!(dir.path().join("state/handwritten_job.json").exists());
        assert!(!dir.path().join("state/handwritten_job.json.tmp").exists());
        assert_eq!(store.load().unwrap().job_id, "abc");
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.load().is_none());
    }
}
