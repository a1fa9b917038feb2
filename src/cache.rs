//! Source snapshot cache keyed by `(repo, revision)`
//!
//! Snapshots live at `<sources_dir>/<host>/<repo name>/<revision>.tar.gz` and are
//! never modified once published. Population is single-writer per key: the first
//! caller runs the fetch while later callers for the same key wait on the key's lock
//! and then reuse the published entry.
//!
//! Git checkouts also leave `<revision>.git.tar.gz` next to the snapshot: the
//! repository history at that revision. A later revision of the same repository is
//! checked out on top of the newest history so only the missing objects are fetched.

use crate::archive;
use crate::error::{Result, VendorError};
use crate::scm::RepoLocation;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

const HISTORY_SUFFIX: &str = ".git.tar.gz";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub repo: String,
    pub revision: String,
}

impl CacheKey {
    pub fn new(repo: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            revision: revision.into(),
        }
    }

    fn relative_path(&self) -> Result<PathBuf> {
        let location = RepoLocation::parse(&self.repo)?;
        Ok(location
            .cache_dir()
            .join(format!("{}.tar.gz", self.revision)))
    }
}

/// A published, read-only snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub archive: PathBuf,
    pub sha256: String,
    pub size: u64,
}

#[derive(Clone)]
pub struct SourceCache {
    root: PathBuf,
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
    writers: Arc<Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>>,
    populated: Arc<AtomicUsize>,
}

impl SourceCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: Arc::new(RwLock::new(HashMap::new())),
            writers: Arc::new(Mutex::new(HashMap::new())),
            populated: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_path(&self, key: &CacheKey) -> Result<PathBuf> {
        Ok(self.root.join(key.relative_path()?))
    }

    pub fn history_path(&self, key: &CacheKey) -> Result<PathBuf> {
        let location = RepoLocation::parse(&key.repo)?;
        Ok(self
            .root
            .join(location.cache_dir())
            .join(format!("{}{}", key.revision, HISTORY_SUFFIX)))
    }

    /// The most recently published history of `repo`
    pub fn newest_history(&self, repo: &str) -> Result<Option<PathBuf>> {
        let dir = self.root.join(RepoLocation::parse(repo)?.cache_dir());
        let Ok(listing) = std::fs::read_dir(&dir) else {
            return Ok(None);
        };
        let newest = listing
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.ends_with(HISTORY_SUFFIX))
            })
            .filter_map(|entry| {
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((modified, entry.path()))
            })
            .max()
            .map(|(_, path)| path);
        Ok(newest)
    }

    /// Publishes a history archive; the first one published for a key is kept
    pub fn publish_history(&self, key: &CacheKey, staging: &Path) -> Result<()> {
        let target = self.history_path(key)?;
        if target.is_file() {
            let _ = std::fs::remove_file(staging);
            return Ok(());
        }
        archive::publish(staging, &target)?;
        debug!(repo = %key.repo, revision = %key.revision, "Published repository history");
        Ok(())
    }

    /// A fresh file name below `<root>/tmp`
    pub fn staging_path(&self, suffix: &str) -> Result<PathBuf> {
        let staging_dir = self.root.join("tmp");
        std::fs::create_dir_all(&staging_dir)
            .map_err(|e| VendorError::io(staging_dir.display(), e))?;
        Ok(staging_dir.join(format!("{}{}", uuid::Uuid::new_v4(), suffix)))
    }

    /// Number of snapshots this process has populated
    pub fn populated_count(&self) -> usize {
        self.populated.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the published entry for `key`, loading it from disk if needed
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.entries.read().ok().and_then(|e| e.get(key).cloned()) {
            if entry.archive.is_file() {
                return Ok(Some(entry));
            }
            warn!(path = %entry.archive.display(), "Snapshot vanished from disk, forgetting it");
            self.forget(key);
        }

        let path = self.archive_path(key)?;
        if !path.is_file() {
            return Ok(None);
        }
        if !archive::is_readable(&path) {
            warn!(path = %path.display(), "Discarding corrupt snapshot");
            std::fs::remove_file(&path).map_err(|e| VendorError::io(path.display(), e))?;
            return Ok(None);
        }
        let entry = describe(&path)?;
        debug!(repo = %key.repo, revision = %key.revision, "Loaded snapshot from disk");
        self.remember(key, entry.clone());
        Ok(Some(entry))
    }

    fn remember(&self, key: &CacheKey, entry: CacheEntry) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.clone(), entry);
        }
    }

    fn forget(&self, key: &CacheKey) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }

    fn writers(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>> {
        match self.writers.lock() {
            Ok(writers) => writers,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn writer_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        self.writers()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drops the key's lock once no other caller holds or waits on it
    fn release_writer(&self, key: &CacheKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut writers = self.writers();
        // One reference in the map plus ours
        if Arc::strong_count(&lock) <= 2 {
            writers.remove(key);
        }
    }

    /// Number of keys with a live writer lock
    pub fn pending_writers(&self) -> usize {
        self.writers().len()
    }

    /// Returns the entry for `key`, running `populate` to create it on a miss
    ///
    /// `populate` receives a staging path it must write the complete archive to.
    /// The returned flag is true when the entry already existed.
    pub async fn get_or_populate<F, Fut>(
        &self,
        key: &CacheKey,
        populate: F,
    ) -> Result<(CacheEntry, bool)>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let lock = self.writer_lock(key);
        let result = {
            let _guard = lock.lock().await;
            self.populate_locked(key, populate).await
        };
        self.release_writer(key, lock);
        result
    }

    async fn populate_locked<F, Fut>(&self, key: &CacheKey, populate: F) -> Result<(CacheEntry, bool)>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if let Some(entry) = self.lookup(key)? {
            debug!(repo = %key.repo, revision = %key.revision, "Source cache hit");
            return Ok((entry, true));
        }

        let target = self.archive_path(key)?;
        let staging = self.staging_path(".tar.gz.part")?;

        info!(repo = %key.repo, revision = %key.revision, "Populating source cache");
        if let Err(err) = populate(staging.clone()).await {
            let _ = std::fs::remove_file(&staging);
            return Err(err);
        }

        if target.is_file() {
            // Published by another process while this one was fetching
            warn!(path = %target.display(), "Snapshot already published, discarding ours");
            let _ = std::fs::remove_file(&staging);
        } else {
            archive::publish(&staging, &target)?;
            self.populated.fetch_add(1, Ordering::SeqCst);
        }

        let entry = describe(&target)?;
        self.remember(key, entry.clone());
        Ok((entry, false))
    }
}

fn describe(path: &Path) -> Result<CacheEntry> {
    let size = std::fs::metadata(path)
        .map_err(|e| VendorError::io(path.display(), e))?
        .len();
    Ok(CacheEntry {
        archive: path.to_path_buf(),
        sha256: archive::sha256_file(path)?,
        size,
    })
}
