//! Bounded cache of loaded engines with least-recently-used eviction.
//!
//! The cache is the only owner of engine handles. Callers get an
//! [`EngineLease`] for the length of one generation; while any lease on a path
//! is alive that entry is never chosen for eviction.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::engine::{validate_model_file, Engine, EngineLoader};
use crate::error::EngineLoadError;

struct CacheEntry {
    id: u64,
    engine: Arc<dyn Engine>,
    last_used_at: Instant,
    /// Monotonic use counter; orders entries even when `last_used_at` ties.
    last_used_tick: u64,
    borrows: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<PathBuf, CacheEntry>,
    tick: u64,
    next_id: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

pub struct EngineCache {
    loader: Arc<dyn EngineLoader>,
    capacity: usize,
    state: Arc<Mutex<CacheState>>,
    load_lock: tokio::sync::Mutex<()>,
}

impl EngineCache {
    pub fn new(loader: Arc<dyn EngineLoader>, capacity: usize) -> Self {
        Self {
            loader,
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(CacheState::default())),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.state.lock().entries.contains_key(path)
    }

    pub fn borrow_count(&self, path: &Path) -> usize {
        self.state
            .lock()
            .entries
            .get(path)
            .map(|e| e.borrows)
            .unwrap_or(0)
    }

    /// Borrow the engine for `path`, loading it on a miss.
    ///
    /// Loads are serialized; hits on other paths are served while a load runs.
    pub async fn acquire(&self, path: &Path) -> Result<EngineLease, EngineLoadError> {
        if let Some(lease) = self.try_hit(path) {
            return Ok(lease);
        }

        let _loading = self.load_lock.lock().await;
        if let Some(lease) = self.try_hit(path) {
            return Ok(lease);
        }

        validate_model_file(path)?;

        let evicted = self.make_room()?;
        if let Some((evicted_path, engine)) = evicted {
            drop(engine);
            log::info!("[engine_cache] evicted {}", evicted_path.display());
        }

        log::info!("[engine_cache] loading {}", path.display());
        let engine = self.loader.load(path).await?;
        Ok(self.insert(path, engine))
    }

    fn try_hit(&self, path: &Path) -> Option<EngineLease> {
        let mut state = self.state.lock();
        let tick = state.next_tick();
        let entry = state.entries.get_mut(path)?;
        entry.last_used_at = Instant::now();
        entry.last_used_tick = tick;
        entry.borrows += 1;
        Some(EngineLease {
            path: path.to_path_buf(),
            entry_id: entry.id,
            engine: Arc::clone(&entry.engine),
            state: Arc::clone(&self.state),
        })
    }

    /// Remove the least recently used idle entry if the cache is full.
    fn make_room(&self) -> Result<Option<(PathBuf, Arc<dyn Engine>)>, EngineLoadError> {
        let mut state = self.state.lock();
        if state.entries.len() < self.capacity {
            return Ok(None);
        }
        let victim = state
            .entries
            .iter()
            .filter(|(_, e)| e.borrows == 0)
            .min_by_key(|(_, e)| e.last_used_tick)
            .map(|(p, _)| p.clone());
        match victim {
            Some(path) => {
                let entry = state.entries.remove(&path).map(|e| e.engine);
                Ok(entry.map(|engine| (path, engine)))
            }
            None => {
                log::warn!(
                    "[engine_cache] all {} engines are borrowed, refusing to load",
                    self.capacity
                );
                Err(EngineLoadError::CacheFull {
                    capacity: self.capacity,
                })
            }
        }
    }

    fn insert(&self, path: &Path, engine: Arc<dyn Engine>) -> EngineLease {
        let mut state = self.state.lock();
        let tick = state.next_tick();
        state.next_id += 1;
        let id = state.next_id;
        state.entries.insert(
            path.to_path_buf(),
            CacheEntry {
                id,
                engine: Arc::clone(&engine),
                last_used_at: Instant::now(),
                last_used_tick: tick,
                borrows: 1,
            },
        );
        EngineLease {
            path: path.to_path_buf(),
            entry_id: id,
            engine,
            state: Arc::clone(&self.state),
        }
    }

    /// Drop the idle engine for `path`. Refuses while a generation holds it.
    pub fn release_path(&self, path: &Path) -> Result<bool, EngineLoadError> {
        let removed = {
            let mut state = self.state.lock();
            match state.entries.get(path) {
                None => return Ok(false),
                Some(e) if e.borrows > 0 => {
                    return Err(EngineLoadError::Busy(path.to_path_buf()))
                }
                Some(_) => state.entries.remove(path),
            }
        };
        drop(removed);
        log::info!("[engine_cache] released {}", path.display());
        Ok(true)
    }

    /// Release every engine. Callers must make sure no generation is running.
    pub fn clear(&self) {
        let drained: Vec<CacheEntry> = {
            let mut state = self.state.lock();
            state.entries.drain().map(|(_, e)| e).collect()
        };
        let count = drained.len();
        drop(drained);
        log::info!("[engine_cache] cleared {} engines", count);
    }

    /// Paths from least to most recently used.
    pub fn paths_by_recency(&self) -> Vec<PathBuf> {
        let state = self.state.lock();
        let mut entries: Vec<(&PathBuf, &CacheEntry)> = state.entries.iter().collect();
        entries.sort_by_key(|(_, e)| e.last_used_tick);
        entries.into_iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn last_used_at(&self, path: &Path) -> Option<Instant> {
        self.state.lock().entries.get(path).map(|e| e.last_used_at)
    }
}

/// A borrowed engine. Dropping it returns the borrow to the cache.
pub struct EngineLease {
    path: PathBuf,
    entry_id: u64,
    engine: Arc<dyn Engine>,
    state: Arc<Mutex<CacheState>>,
}

impl Deref for EngineLease {
    type Target = dyn Engine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref()
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&self.path) {
            // A cleared and reloaded path gets a new id; stale leases leave it alone.
            if entry.id == self.entry_id {
                entry.borrows = entry.borrows.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_model_file, FakeLoader};
    use std::time::Duration;

    fn setup(capacity: usize) -> (tempfile::TempDir, Arc<FakeLoader>, EngineCache) {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(FakeLoader::new(vec!["tok".into()]));
        let cache = EngineCache::new(loader.clone(), capacity);
        (dir, loader, cache)
    }

    // ── hits and loads ──

    #[tokio::test]
    async fn test_second_acquire_is_a_hit() {
        let (dir, loader, cache) = setup(3);
        let a = write_model_file(dir.path(), "a.gguf");
        drop(cache.acquire(&a).await.unwrap());
        drop(cache.acquire(&a).await.unwrap());
        assert_eq!(loader.load_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_lease_tracks_borrow_count() {
        let (dir, _loader, cache) = setup(3);
        let a = write_model_file(dir.path(), "a.gguf");
        let l1 = cache.acquire(&a).await.unwrap();
        let l2 = cache.acquire(&a).await.unwrap();
        assert_eq!(cache.borrow_count(&a), 2);
        drop(l1);
        assert_eq!(cache.borrow_count(&a), 1);
        drop(l2);
        assert_eq!(cache.borrow_count(&a), 0);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_one_load() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(
            FakeLoader::new(vec!["tok".into()]).with_load_delay(Duration::from_millis(50)),
        );
        let cache = EngineCache::new(loader.clone(), 3);
        let a = write_model_file(dir.path(), "a.gguf");

        let (l1, l2) = tokio::join!(cache.acquire(&a), cache.acquire(&a));
        let (l1, l2) = (l1.unwrap(), l2.unwrap());
        assert_eq!(loader.load_count(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.borrow_count(&a), 2);
        drop(l1);
        drop(l2);
        assert_eq!(cache.borrow_count(&a), 0);
    }

    #[tokio::test]
    async fn test_validation_errors_are_specific() {
        let (dir, loader, cache) = setup(3);
        let missing = dir.path().join("missing.gguf");
        assert_eq!(
            cache.acquire(&missing).await.err(),
            Some(EngineLoadError::NotFound(missing))
        );
        let tiny = dir.path().join("tiny.gguf");
        std::fs::write(&tiny, b"GGUF").unwrap();
        assert_eq!(cache.acquire(&tiny).await.err(), Some(EngineLoadError::TooSmall(4)));
        assert_eq!(loader.load_count(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_loader_failure_is_passed_through() {
        let (dir, loader, cache) = setup(3);
        let a = write_model_file(dir.path(), "a.gguf");
        loader.fail_next(EngineLoadError::OutOfMemory {
            required: 10,
            available: 1,
        });
        assert!(matches!(
            cache.acquire(&a).await,
            Err(EngineLoadError::OutOfMemory { .. })
        ));
        assert!(!cache.contains(&a));
    }

    // ── eviction ──

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let (dir, loader, cache) = setup(3);
        let paths: Vec<PathBuf> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| write_model_file(dir.path(), &format!("{n}.gguf")))
            .collect();
        for p in &paths[..3] {
            drop(cache.acquire(p).await.unwrap());
        }
        // Touch a so b becomes the oldest.
        drop(cache.acquire(&paths[0]).await.unwrap());
        drop(cache.acquire(&paths[3]).await.unwrap());

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&paths[1]));
        assert_eq!(loader.dropped_count(), 1);
        assert_eq!(
            cache.paths_by_recency(),
            vec![paths[2].clone(), paths[0].clone(), paths[3].clone()]
        );
    }

    #[tokio::test]
    async fn test_borrowed_entries_are_never_evicted() {
        let (dir, _loader, cache) = setup(2);
        let a = write_model_file(dir.path(), "a.gguf");
        let b = write_model_file(dir.path(), "b.gguf");
        let c = write_model_file(dir.path(), "c.gguf");

        let held = cache.acquire(&a).await.unwrap();
        drop(cache.acquire(&b).await.unwrap());
        drop(cache.acquire(&c).await.unwrap());

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        drop(held);
    }

    #[tokio::test]
    async fn test_full_of_borrowed_engines_refuses_load() {
        let (dir, loader, cache) = setup(1);
        let a = write_model_file(dir.path(), "a.gguf");
        let b = write_model_file(dir.path(), "b.gguf");
        let _held = cache.acquire(&a).await.unwrap();

        assert_eq!(
            cache.acquire(&b).await.err(),
            Some(EngineLoadError::CacheFull { capacity: 1 })
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn test_size_never_exceeds_capacity() {
        let (dir, _loader, cache) = setup(3);
        let paths: Vec<PathBuf> = (0..6)
            .map(|i| write_model_file(dir.path(), &format!("m{i}.gguf")))
            .collect();
        for round in 0..3 {
            for (i, p) in paths.iter().enumerate() {
                if (i + round) % 2 == 0 {
                    drop(cache.acquire(p).await.unwrap());
                    assert!(cache.len() <= cache.capacity());
                }
            }
        }
    }

    // ── release / clear ──

    #[tokio::test]
    async fn test_release_path_refuses_when_borrowed() {
        let (dir, loader, cache) = setup(3);
        let a = write_model_file(dir.path(), "a.gguf");
        let lease = cache.acquire(&a).await.unwrap();
        assert_eq!(cache.release_path(&a), Err(EngineLoadError::Busy(a.clone())));
        drop(lease);
        assert_eq!(cache.release_path(&a), Ok(true));
        assert_eq!(cache.release_path(&a), Ok(false));
        assert_eq!(loader.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_clear_releases_everything() {
        let (dir, loader, cache) = setup(3);
        for n in ["a", "b"] {
            let p = write_model_file(dir.path(), &format!("{n}.gguf"));
            drop(cache.acquire(&p).await.unwrap());
        }
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(loader.dropped_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_lease_does_not_touch_reloaded_entry() {
        let (dir, _loader, cache) = setup(3);
        let a = write_model_file(dir.path(), "a.gguf");
        let stale = cache.acquire(&a).await.unwrap();
        cache.clear();
        let fresh = cache.acquire(&a).await.unwrap();
        drop(stale);
        assert_eq!(cache.borrow_count(&a), 1);
        drop(fresh);
    }
}
