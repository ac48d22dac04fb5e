//! Persisted session record shared by the timer and the rename pipeline.
//!
//! Every update is a read-modify-write under one mutex, and the file is
//! replaced atomically, so concurrent writers never interleave.

use crate::error::StoreError;
use directories::ProjectDirs;
use duorec_ipc::{SessionPatch, SessionRecord};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<StoreInner>>,
}

struct StoreInner {
    path: Option<PathBuf>,
    record: SessionRecord,
}

impl SessionStore {
    pub fn default_path() -> Result<PathBuf, StoreError> {
        let proj_dirs =
            ProjectDirs::from("com", "duorec", "duorec").ok_or(StoreError::NoDataDir)?;
        Ok(proj_dirs.data_dir().join("session.json"))
    }

    /// Loads the record at `path`, or starts from defaults if it does not exist yet.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let record = if path.exists() {
            let json = fs::read_to_string(path).map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str(&json)?
        } else {
            SessionRecord::default()
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner {
                path: Some(path.to_path_buf()),
                record,
            })),
        })
    }

    /// A store that never touches the disk.
    pub fn in_memory(record: SessionRecord) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner { path: None, record })),
        }
    }

    pub fn get(&self) -> SessionRecord {
        self.lock().record.clone()
    }

    /// Applies `f` and persists the result. If the write fails the
    /// in-memory record is left as it was.
    pub fn update<F>(&self, f: F) -> Result<SessionRecord, StoreError>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let mut inner = self.lock();
        let mut next = inner.record.clone();
        f(&mut next);
        if let Some(path) = &inner.path {
            write_atomic(path, &next)?;
        }
        inner.record = next.clone();
        Ok(next)
    }

    pub fn apply(&self, patch: SessionPatch) -> Result<SessionRecord, StoreError> {
        self.update(|record| patch.apply(record))
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A panic while holding the lock cannot leave a half-written record.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn write_atomic(path: &Path, record: &SessionRecord) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(record)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use duorec_ipc::{Channel, TimerMode};

    #[test]
    fn update_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let store = SessionStore::open(&path).unwrap();
        assert_eq!(store.get().segment_counter, 0);

        store
            .update(|r| {
                r.segment_counter = 7;
                r.last_channel = Channel::B;
                r.timer_mode = TimerMode::Down;
            })
            .unwrap();

        let reopened = SessionStore::open(&path).unwrap().get();
        assert_eq!(reopened.segment_counter, 7);
        assert_eq!(reopened.last_channel, Channel::B);
        assert_eq!(reopened.timer_mode, TimerMode::Down);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn failed_write_keeps_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("session.json");
        fs::create_dir_all(path.join("blocker")).unwrap();
        let store = SessionStore {
            inner: Arc::new(Mutex::new(StoreInner {
                path: Some(path),
                record: SessionRecord::default(),
            })),
        };

        assert!(store.update(|r| r.segment_counter = 99).is_err());
        assert_eq!(store.get().segment_counter, 0);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let store = SessionStore::in_memory(SessionRecord::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store.update(|r| r.segment_counter += 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get().segment_counter, 800);
    }
}
