//! Durable catalog of downloaded model artifacts, persisted as a JSON list.
//!
//! Reads are copy-out snapshots. Every mutation persists the whole list with a
//! write-temp-then-rename and then broadcasts a [`ManifestChange`]; subscribers
//! that are not listening at that moment simply miss it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

use crate::error::{ManifestResolutionError, PersistenceError};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub id: String,
    pub local_path: PathBuf,
    pub downloaded_at: DateTime<Utc>,
}

impl ManifestEntry {
    pub fn new(id: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            local_path: local_path.into(),
            downloaded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManifestChange {
    Added(String),
    Removed(String),
}

pub struct ManifestStore {
    path: PathBuf,
    entries: Mutex<Vec<ManifestEntry>>,
    changes: broadcast::Sender<ManifestChange>,
}

impl ManifestStore {
    /// Load the list at `path`. Missing, unreadable or corrupt files all yield an
    /// empty catalog so startup never blocks on the manifest.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("[manifest] starting with an empty catalog: {}", e);
                Vec::new()
            }
        };
        log::info!("[manifest] loaded {} entries from {}", entries.len(), path.display());
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            path,
            entries: Mutex::new(entries),
            changes,
        }
    }

    pub fn all(&self) -> Vec<ManifestEntry> {
        self.entries.lock().clone()
    }

    pub fn get(&self, id: &str) -> Option<ManifestEntry> {
        self.entries.lock().iter().find(|e| e.id == id).cloned()
    }

    pub fn resolve(&self, id: &str) -> Result<ManifestEntry, ManifestResolutionError> {
        self.get(id)
            .ok_or_else(|| ManifestResolutionError(id.to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManifestChange> {
        self.changes.subscribe()
    }

    /// Insert or replace the entry with the same id, persist, then notify.
    ///
    /// On a persistence failure the in-memory list keeps the entry and the event
    /// is still sent; the error tells the caller it may not survive a restart.
    pub fn add(&self, entry: ManifestEntry) -> Result<(), PersistenceError> {
        let id = entry.id.clone();
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        let result = write_entries(&self.path, &entries);
        let _ = self.changes.send(ManifestChange::Added(id.clone()));
        drop(entries);

        match &result {
            Ok(()) => log::info!("[manifest] added {}", id),
            Err(e) => log::error!("[manifest] added {} in memory only: {}", id, e),
        }
        result
    }

    /// Remove every entry with `id`. Returns `Ok(false)` without persisting or
    /// notifying when nothing matched.
    pub fn remove(&self, id: &str) -> Result<bool, PersistenceError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Ok(false);
        }
        let result = write_entries(&self.path, &entries);
        let _ = self.changes.send(ManifestChange::Removed(id.to_string()));
        drop(entries);

        log::info!("[manifest] removed {}", id);
        result.map(|_| true)
    }
}

fn read_entries(path: &Path) -> Result<Vec<ManifestEntry>, PersistenceError> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(PersistenceError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };
    serde_json::from_slice(&data).map_err(|e| PersistenceError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_entries(path: &Path, entries: &[ManifestEntry]) -> Result<(), PersistenceError> {
    let write_err = |e: &dyn std::fmt::Display| PersistenceError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| write_err(&e))?;
    }
    let data = serde_json::to_vec_pretty(entries).map_err(|e| write_err(&e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data).map_err(|e| write_err(&e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        write_err(&e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> ManifestStore {
        ManifestStore::open(dir.join("models.json"))
    }

    // ── load ──

    #[test]
    fn test_missing_file_is_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store_in(dir.path()).all().is_empty());
    }

    #[test]
    fn test_corrupt_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("models.json"), b"[{\"id\":").unwrap();
        assert!(store_in(dir.path()).all().is_empty());
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add(ManifestEntry::new("org/m1", "/m/m1.gguf")).unwrap();
        store.add(ManifestEntry::new("org/m2", "/m/m2.gguf")).unwrap();

        let reopened = store_in(dir.path());
        let ids: Vec<String> = reopened.all().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["org/m1", "org/m2"]);
        assert!(!dir.path().join("models.json.tmp").exists());
    }

    #[test]
    fn test_persisted_keys_are_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add(ManifestEntry::new("m1", "/m/m1.gguf")).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("models.json")).unwrap();
        assert!(raw.contains("localPath"));
        assert!(raw.contains("downloadedAt"));
    }

    // ── add / remove ──

    #[test]
    fn test_add_then_remove_restores_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add(ManifestEntry::new("keep", "/m/keep.gguf")).unwrap();
        let before = store.all();

        store.add(ManifestEntry::new("m1", "/m/m1.gguf")).unwrap();
        assert!(store.remove("m1").unwrap());
        assert_eq!(store.all(), before);
    }

    #[test]
    fn test_add_same_id_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add(ManifestEntry::new("m1", "/old.gguf")).unwrap();
        store.add(ManifestEntry::new("m1", "/new.gguf")).unwrap();
        let all = store.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].local_path, PathBuf::from("/new.gguf"));
    }

    #[test]
    fn test_remove_twice_is_silent_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add(ManifestEntry::new("m1", "/m1.gguf")).unwrap();
        let mut rx = store.subscribe();

        assert!(store.remove("m1").unwrap());
        assert!(!store.remove("m1").unwrap());

        assert_eq!(rx.try_recv().unwrap(), ManifestChange::Removed("m1".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_resolve_missing_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert_eq!(
            store.resolve("nope").unwrap_err(),
            ManifestResolutionError("nope".into())
        );
    }

    // ── events ──

    #[test]
    fn test_events_arrive_in_emission_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mut rx = store.subscribe();
        store.add(ManifestEntry::new("a", "/a.gguf")).unwrap();
        store.add(ManifestEntry::new("b", "/b.gguf")).unwrap();
        store.remove("a").unwrap();

        assert_eq!(rx.try_recv().unwrap(), ManifestChange::Added("a".into()));
        assert_eq!(rx.try_recv().unwrap(), ManifestChange::Added("b".into()));
        assert_eq!(rx.try_recv().unwrap(), ManifestChange::Removed("a".into()));
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add(ManifestEntry::new("a", "/a.gguf")).unwrap();
        let mut rx = store.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_write_failure_keeps_memory_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        // The manifest path is a directory, so the rename cannot succeed.
        let path = dir.path().join("models.json");
        std::fs::create_dir_all(path.join("occupied")).unwrap();
        let store = ManifestStore::open(&path);

        let err = store.add(ManifestEntry::new("m1", "/m1.gguf")).unwrap_err();
        assert!(matches!(err, PersistenceError::Write { .. }));
        assert_eq!(store.all().len(), 1);
    }
}
