//! Job persistence.
//!
//! The scheduler treats storage as a keyed map of [`Job`] records. Two
//! implementations are provided: an in-memory map for tests and one-shot
//! runs, and a directory of `<id>.json` files that survives restarts.

use crate::jobs::Job;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

/// Error type for job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize job: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("job {0} already exists")]
    Duplicate(String),

    #[error("job {0} not found")]
    NotFound(String),
}

/// Keyed storage for job records.
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails if the id is taken.
    fn create(&self, job: &Job) -> Result<(), StoreError>;
    /// Overwrite an existing record.
    fn update(&self, job: &Job) -> Result<(), StoreError>;
    fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;
    /// All records, oldest first.
    fn list(&self) -> Result<Vec<Job>, StoreError>;
    /// Remove a record. Returns whether it existed.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Job>> {
        // A poisoned map is still structurally valid.
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl JobStore for MemoryJobStore {
    fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.lock();
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(job.id.clone())),
        }
    }

    fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().get(id).cloned())
    }

    fn list(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock().remove(id).is_some())
    }
}

/// Stores each job as `<state_dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct JsonDirJobStore {
    state_dir: PathBuf,
}

impl JsonDirJobStore {
    /// Creates the state directory if needed.
    pub fn open<P: Into<PathBuf>>(state_dir: P) -> Result<Self, StoreError> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)?;
        Ok(Self { state_dir })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", id))
    }

    fn write(&self, job: &Job) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(job)?;
        let tmp = self.state_dir.join(format!(".{}.json.tmp", job.id));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.path_for(&job.id))?;
        Ok(())
    }
}

impl JobStore for JsonDirJobStore {
    fn create(&self, job: &Job) -> Result<(), StoreError> {
        if self.path_for(&job.id).exists() {
            return Err(StoreError::Duplicate(job.id.clone()));
        }
        self.write(job)
    }

    fn update(&self, job: &Job) -> Result<(), StoreError> {
        if !self.path_for(&job.id).exists() {
            return Err(StoreError::NotFound(job.id.clone()));
        }
        self.write(job)
    }

    fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        match fs::read_to_string(self.path_for(id)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Skips files that fail to parse and logs warnings.
    fn list(&self) -> Result<Vec<Job>, StoreError> {
        if !self.state_dir.exists() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.state_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let loaded = fs::read_to_string(&path)
                .map_err(StoreError::from)
                .and_then(|content| serde_json::from_str::<Job>(&content).map_err(StoreError::from));
            match loaded {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job file"),
            }
        }

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use crate::preset::EncodeSpec;
    use tempfile::TempDir;

    fn make_job(input: &str) -> Job {
        let json = format!(
            r#"{{"input":"{}","output":"/out/x.mkv","container":".mkv","codec":"hevc",
               "scale":null,"audio_codec":"copy","audio_bitrate":null,"flac_compression":null,
               "quality":{{"crf":28}},"allow_fallback":true,"force_software":false,"overwrite":true}}"#,
            input
        );
        let spec: EncodeSpec = serde_json::from_str(&json).unwrap();
        Job::new(spec, None)
    }

    fn exercise_store(store: &dyn JobStore) {
        let mut job = make_job("/in/a.mp4");
        store.create(&job).unwrap();
        assert!(matches!(store.create(&job), Err(StoreError::Duplicate(_))));

        job.start();
        store.update(&job).unwrap();
        let loaded = store.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Processing);

        let other = make_job("/in/b.mp4");
        assert!(matches!(store.update(&other), Err(StoreError::NotFound(_))));
        store.create(&other).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);

        assert!(store.delete(&job.id).unwrap());
        assert!(!store.delete(&job.id).unwrap());
        assert!(store.get(&job.id).unwrap().is_none());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store_operations() {
        exercise_store(&MemoryJobStore::new());
    }

    #[test]
    fn test_json_dir_store_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonDirJobStore::open(temp_dir.path()).unwrap();
        exercise_store(&store);
    }

    #[test]
    fn test_json_dir_store_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = temp_dir.path().join("nested").join("state");
        let store = JsonDirJobStore::open(&state_dir).unwrap();
        let job = make_job("/in/a.mp4");
        store.create(&job).unwrap();
        assert!(state_dir.join(format!("{}.json", job.id)).exists());
    }

    #[test]
    fn test_json_dir_list_skips_bad_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonDirJobStore::open(temp_dir.path()).unwrap();
        let job = make_job("/in/a.mp4");
        store.create(&job).unwrap();
        fs::write(temp_dir.path().join("garbage.json"), "{ not json").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "ignored").unwrap();

        let jobs = store.list().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
    }

    #[test]
    fn test_json_dir_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let job = make_job("/in/a.mp4");
        {
            let store = JsonDirJobStore::open(temp_dir.path()).unwrap();
            store.create(&job).unwrap();
        }
        let store = JsonDirJobStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.get(&job.id).unwrap(), Some(job));
    }

    #[test]
    fn test_list_is_creation_ordered() {
        let store = MemoryJobStore::new();
        let mut first = make_job("/in/a.mp4");
        first.created_at = 10;
        let mut second = make_job("/in/b.mp4");
        second.created_at = 20;
        store.create(&second).unwrap();
        store.create(&first).unwrap();
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
