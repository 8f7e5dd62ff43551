//! File-backed job registry shared by every jobman process on the host.
//!
//! Layout under `<jobs_dir>/.jobman/`:
//! - `meta.json`: map of job id to [`JobRecord`]
//! - `next_job_id.txt`: last allocated numeric id
//! - `lock`: sentinel held with `flock` around every read-modify-write

use crate::core::job::JobRecord;
use crate::core::{format_job_id, JobId};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const STATE_DIR: &str = ".jobman";
const META_FILE: &str = "meta.json";
const COUNTER_FILE: &str = "next_job_id.txt";
const LOCK_FILE: &str = "lock";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("corrupt registry {0}: {1}")]
    Parse(PathBuf, String),
    #[error("failed to write registry {0}: {1}")]
    Write(PathBuf, String),
    #[error("corrupt id counter {0}: {1:?}")]
    Counter(PathBuf, String),
}

pub type Registry = BTreeMap<JobId, JobRecord>;

#[derive(Debug, Clone)]
pub struct MetadataStore {
    state_dir: PathBuf,
}

impl MetadataStore {
    pub fn new(jobs_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: jobs_dir.as_ref().join(STATE_DIR),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn meta_path(&self) -> PathBuf {
        self.state_dir.join(META_FILE)
    }

    fn counter_path(&self) -> PathBuf {
        self.state_dir.join(COUNTER_FILE)
    }

    /// Runs `f` while holding the exclusive registry lock.
    ///
    /// The lock is released when the sentinel file handle drops, including on
    /// early return or panic inside `f`.
    pub fn with_lock<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Result<T, StoreError>,
    {
        std::fs::create_dir_all(&self.state_dir)
            .map_err(|e| StoreError::Io(self.state_dir.clone(), e))?;

        let lock_path = self.state_dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::Io(lock_path.clone(), e))?;
        lock.lock_exclusive()
            .map_err(|e| StoreError::Lock(lock_path.clone(), e))?;

        let result = f();

        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!("Failed to release registry lock {:?}: {}", lock_path, e);
        }
        result
    }

    /// Reserves the next job id. Ids are never reused, even after deletion.
    pub fn allocate_next_id(&self) -> Result<JobId, StoreError> {
        self.with_lock(|| {
            let path = self.counter_path();
            let current = match std::fs::read_to_string(&path) {
                Ok(text) if text.trim().is_empty() => 0,
                Ok(text) => text
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| StoreError::Counter(path.clone(), text.trim().to_string()))?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(StoreError::Io(path, e)),
            };

            let next = current + 1;
            let id = format_job_id(next);
            write_atomically(&path, |w| w.write_all(id.as_bytes()).map_err(|e| e.to_string()))?;
            Ok(id)
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.with_lock(|| Ok(self.read_registry()?.remove(id)))
    }

    pub fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.with_lock(|| Ok(self.read_registry()?.into_values().collect()))
    }

    pub fn upsert(&self, record: JobRecord) -> Result<(), StoreError> {
        self.with_lock(|| {
            let mut registry = self.read_registry()?;
            registry.insert(record.id.clone(), record);
            self.write_registry(&registry)
        })
    }

    /// Applies `f` to the record for `id` under the lock. Returns the updated
    /// record, or `None` if no such job exists.
    pub fn update<F>(&self, id: &str, f: F) -> Result<Option<JobRecord>, StoreError>
    where
        F: FnOnce(&mut JobRecord),
    {
        self.with_lock(|| {
            let mut registry = self.read_registry()?;
            let Some(record) = registry.get_mut(id) else {
                return Ok(None);
            };
            f(record);
            let updated = record.clone();
            self.write_registry(&registry)?;
            Ok(Some(updated))
        })
    }

    pub fn remove(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.with_lock(|| {
            let mut registry = self.read_registry()?;
            let removed = registry.remove(id);
            if removed.is_some() {
                self.write_registry(&registry)?;
            }
            Ok(removed)
        })
    }

    fn read_registry(&self) -> Result<Registry, StoreError> {
        let path = self.meta_path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Registry::new()),
            Err(e) => return Err(StoreError::Io(path, e)),
        };

        if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
            return Ok(Registry::new());
        }

        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StoreError::Parse(path, e.to_string()))
    }

    fn write_registry(&self, registry: &Registry) -> Result<(), StoreError> {
        write_atomically(&self.meta_path(), |w| {
            serde_json::to_writer_pretty(w, registry).map_err(|e| e.to_string())
        })
    }
}

/// Writes through a sibling temp file and renames it into place, so readers
/// never observe a partially written file.
fn write_atomically<F>(path: &Path, write: F) -> Result<(), StoreError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), String>,
{
    let tmp_path = path.with_extension("tmp");
    let file = File::create(&tmp_path).map_err(|e| StoreError::Io(tmp_path.clone(), e))?;
    let mut writer = BufWriter::new(file);
    write(&mut writer).map_err(|e| StoreError::Write(path.to_path_buf(), e))?;
    writer
        .flush()
        .map_err(|e| StoreError::Io(tmp_path.clone(), e))?;
    drop(writer);

    std::fs::rename(&tmp_path, path).map_err(|e| StoreError::Io(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobStatus;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[test]
    fn test_allocate_ids_are_sequential_and_padded() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());

        assert_eq!(store.allocate_next_id().unwrap(), "000001");
        assert_eq!(store.allocate_next_id().unwrap(), "000002");

        let counter = std::fs::read_to_string(dir.path().join(".jobman/next_job_id.txt")).unwrap();
        assert_eq!(counter, "000002");
    }

    /// Allocates ids from `threads` independent stores at once and returns
    /// the sorted numeric ids.
    fn allocate_concurrently(root: &Path, threads: usize, per_thread: usize) -> Vec<u64> {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let root = root.to_path_buf();
                std::thread::spawn(move || {
                    // A fresh store per thread stands in for a separate process.
                    let store = MetadataStore::new(&root);
                    (0..per_thread)
                        .map(|_| store.allocate_next_id().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: Vec<JobId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<_> = ids.iter().cloned().collect();
        assert_eq!(unique.len(), threads * per_thread);

        let mut numbers: Vec<u64> = ids.iter().map(|id| id.parse().unwrap()).collect();
        numbers.sort_unstable();
        numbers
    }

    #[test]
    fn test_allocate_ids_across_processes_never_collide() {
        let dir = TempDir::new().unwrap();
        let numbers = allocate_concurrently(dir.path(), 8, 10);
        let expected: Vec<u64> = (1..=80).collect();
        assert_eq!(numbers, expected);
    }

    #[test]
    fn test_concurrent_ids_continue_from_existing_counter() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        std::fs::create_dir_all(store.state_dir()).unwrap();
        std::fs::write(store.state_dir().join("next_job_id.txt"), "000041").unwrap();

        let numbers = allocate_concurrently(dir.path(), 6, 5);
        let expected: Vec<u64> = (42..=71).collect();
        assert_eq!(numbers, expected);
    }

    #[test]
    fn test_concurrent_upserts_lose_nothing() {
        let dir = TempDir::new().unwrap();

        let handles: Vec<_> = (1..=16u64)
            .map(|n| {
                let root = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    let store = MetadataStore::new(&root);
                    store.upsert(JobRecord::new(format_job_id(n))).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let records = MetadataStore::new(dir.path()).list().unwrap();
        assert_eq!(records.len(), 16);
    }

    #[test]
    fn test_update_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        store.upsert(JobRecord::new("000001".to_string())).unwrap();

        let updated = store
            .update("000001", |r| r.status = JobStatus::Running)
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, JobStatus::Running);
        assert_eq!(
            store.get("000001").unwrap().unwrap().status,
            JobStatus::Running
        );

        assert!(store.update("000009", |_| {}).unwrap().is_none());
        assert!(store.remove("000001").unwrap().is_some());
        assert!(store.get("000001").unwrap().is_none());
        assert!(store.remove("000001").unwrap().is_none());
    }

    #[test]
    fn test_missing_registry_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        assert!(store.list().unwrap().is_empty());
        assert!(store.get("000001").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_registry_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        std::fs::create_dir_all(store.state_dir()).unwrap();
        std::fs::write(store.state_dir().join("meta.json"), "{not json").unwrap();

        assert!(matches!(store.list(), Err(StoreError::Parse(..))));
    }

    #[test]
    fn test_corrupt_counter_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        std::fs::create_dir_all(store.state_dir()).unwrap();
        std::fs::write(store.state_dir().join("next_job_id.txt"), "abc").unwrap();

        assert!(matches!(
            store.allocate_next_id(),
            Err(StoreError::Counter(..))
        ));
    }
}
