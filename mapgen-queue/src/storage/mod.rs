//! TTL-bound result cache.
//!
//! Every job writes exactly one [`StorageEntry`] here. Entries expire after
//! a fixed time-to-live, are evicted oldest-inserted first once the cache is
//! full, and can be removed explicitly. Whatever the reason, an evicted
//! entry takes its on-disk artifacts with it. Deletion runs on the blocking
//! thread pool when a runtime is available.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::SessionId;

/// Configuration for the result cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Lifetime of an entry in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum number of entries kept.
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Interval between expiry sweeps in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_max_size() -> usize {
    1000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_size: default_max_size(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl StorageConfig {
    pub fn with_ttl_secs(mut self, secs: u64) -> Self {
        self.ttl_secs = secs;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }
}

/// Outcome of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub success: bool,
    pub description: String,
    /// Working directory owned by the entry.
    pub directory: Option<PathBuf>,
    /// Primary artifact.
    pub file_path: Option<PathBuf>,
    pub previews: Vec<PathBuf>,
    /// Files outside the working directory that belong to the entry.
    #[serde(default)]
    pub attachments: Vec<PathBuf>,
}

impl StorageEntry {
    /// Create a successful entry.
    pub fn completed(
        description: impl Into<String>,
        directory: Option<PathBuf>,
        file_path: PathBuf,
        previews: Vec<PathBuf>,
    ) -> Self {
        Self {
            success: true,
            description: description.into(),
            directory,
            file_path: Some(file_path),
            previews,
            attachments: Vec::new(),
        }
    }

    /// Create a failed entry. It has no artifact.
    pub fn failed(description: impl Into<String>, directory: Option<PathBuf>) -> Self {
        Self {
            success: false,
            description: description.into(),
            directory,
            file_path: None,
            previews: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<PathBuf>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Delete the entry's directory, an artifact stored outside it and its
    /// attachments.
    ///
    /// Paths shared with `keep` are left alone.
    fn purge_files(&self, keep: Option<&StorageEntry>) {
        let kept = |path: &Path| {
            keep.is_some_and(|k| {
                k.directory.as_deref() == Some(path)
                    || k.file_path.as_deref() == Some(path)
                    || k.attachments.iter().any(|a| a == path)
            })
        };

        if let Some(dir) = &self.directory
            && !kept(dir)
        {
            remove_path(dir);
        }

        if let Some(file) = &self.file_path {
            let inside = self
                .directory
                .as_deref()
                .is_some_and(|dir| file.starts_with(dir));
            if !inside && !kept(file) {
                remove_path(file);
            }
        }

        for attachment in &self.attachments {
            if !kept(attachment) {
                remove_path(attachment);
            }
        }
    }
}

/// Files of an evicted entry waiting for deletion.
struct Purge {
    entry: StorageEntry,
    keep: Option<StorageEntry>,
}

impl Purge {
    fn of(entry: StorageEntry) -> Self {
        Self { entry, keep: None }
    }
}

fn run_purges(purges: &[Purge]) {
    for purge in purges {
        purge.entry.purge_files(purge.keep.as_ref());
    }
}

/// Deletions handed to the blocking pool and not yet finished.
#[derive(Debug, Default)]
struct PendingPurges {
    count: AtomicUsize,
    done: Notify,
}

/// Marks one pending purge finished when dropped, even if it never ran.
struct PurgeGuard(Arc<PendingPurges>);

impl Drop for PurgeGuard {
    fn drop(&mut self) {
        self.0.count.fetch_sub(1, Ordering::SeqCst);
        self.0.done.notify_waiters();
    }
}

/// Remove a file or directory, retrying once before giving up.
fn remove_path(path: &Path) {
    for attempt in 1..=2 {
        let result = if path.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };

        match result {
            Ok(()) => {
                debug!(path = %path.display(), "Removed cached artifact");
                return;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) if attempt == 1 => {
                debug!(path = %path.display(), error = %e, "Removal failed, retrying");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove cached artifact");
            }
        }
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub expired: u64,
    pub evicted: u64,
    pub removed: u64,
}

#[derive(Debug)]
struct CachedEntry {
    entry: StorageEntry,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
    sequence: u64,
}

impl CachedEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<SessionId, CachedEntry>,
    /// Insertion order, oldest first.
    order: BTreeMap<u64, SessionId>,
    next_sequence: u64,
    expired: u64,
    evicted: u64,
    removed: u64,
}

impl CacheState {
    fn take(&mut self, key: &SessionId) -> Option<CachedEntry> {
        let cached = self.entries.remove(key)?;
        self.order.remove(&cached.sequence);
        Some(cached)
    }

    fn take_oldest(&mut self) -> Option<(SessionId, CachedEntry)> {
        let (_, key) = self.order.pop_first()?;
        let cached = self.entries.remove(&key)?;
        Some((key, cached))
    }
}

/// The result cache service.
pub struct ResultCache {
    config: StorageConfig,
    state: Mutex<CacheState>,
    pending: Arc<PendingPurges>,
}

impl ResultCache {
    /// Create a new result cache.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            pending: Arc::new(PendingPurges::default()),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    /// Hand purges to the blocking pool. Without a runtime they are returned
    /// to be run inline.
    ///
    /// Called with the state lock held, so a purge is pending before its
    /// entry is observably gone.
    fn schedule(&self, purges: Vec<Purge>) -> Vec<Purge> {
        if purges.is_empty() {
            return purges;
        }
        let Ok(handle) = Handle::try_current() else {
            return purges;
        };

        self.pending.count.fetch_add(1, Ordering::SeqCst);
        let guard = PurgeGuard(Arc::clone(&self.pending));
        handle.spawn_blocking(move || {
            let _guard = guard;
            run_purges(&purges);
        });
        Vec::new()
    }

    /// Store an entry, evicting older entries as needed.
    pub fn put(&self, key: SessionId, entry: StorageEntry) {
        let inline = {
            let mut state = self.state.lock();
            let mut purges = Vec::new();

            if let Some(old) = state.take(&key) {
                debug!(session = %key, "Replacing cached result");
                purges.push(Purge {
                    entry: old.entry,
                    keep: Some(entry.clone()),
                });
            }

            // A cache always holds at least the entry just written.
            let capacity = self.config.max_size.max(1);
            while state.entries.len() >= capacity {
                let Some((session, oldest)) = state.take_oldest() else {
                    break;
                };
                debug!(session = %session, "Evicting cached result over capacity");
                state.evicted += 1;
                purges.push(Purge::of(oldest.entry));
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.order.insert(sequence, key.clone());
            state.entries.insert(
                key.clone(),
                CachedEntry {
                    entry: entry.clone(),
                    expires_at: Instant::now().checked_add(self.ttl()),
                    sequence,
                },
            );
            self.schedule(purges)
        };

        run_purges(&inline);
        debug!(session = %key, success = entry.success, "Cached result");
    }

    /// Look up a live entry. Expired entries are evicted and reported absent.
    pub fn get(&self, key: &SessionId) -> Option<StorageEntry> {
        let inline = {
            let mut state = self.state.lock();
            let cached = state.entries.get(key)?;
            if !cached.is_expired(Instant::now()) {
                return Some(cached.entry.clone());
            }
            debug!(session = %key, "Cached result expired");
            state.expired += 1;
            let purges = state.take(key).map(|c| Purge::of(c.entry)).into_iter().collect();
            self.schedule(purges)
        };

        run_purges(&inline);
        None
    }

    /// Whether a live entry exists.
    pub fn contains(&self, key: &SessionId) -> bool {
        self.get(key).is_some()
    }

    /// Remove an entry and delete its artifacts. Removing an absent key is a no-op.
    pub fn remove(&self, key: &SessionId) -> bool {
        self.pop(key).is_some()
    }

    /// Remove and return an entry, deleting its artifacts.
    ///
    /// Inside a runtime the deletion is still running when this returns;
    /// await [`wait_for_purges`](Self::wait_for_purges) to observe it.
    pub fn pop(&self, key: &SessionId) -> Option<StorageEntry> {
        let (entry, inline) = {
            let mut state = self.state.lock();
            let cached = state.take(key)?;
            state.removed += 1;
            let entry = cached.entry.clone();
            (entry, self.schedule(vec![Purge::of(cached.entry)]))
        };
        run_purges(&inline);
        debug!(session = %key, "Removed cached result");
        Some(entry)
    }

    /// Evict every expired entry. Returns the number evicted.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let (count, inline) = {
            let mut state = self.state.lock();
            let keys: Vec<SessionId> = state
                .entries
                .iter()
                .filter(|(_, cached)| cached.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            state.expired += keys.len() as u64;
            let purges: Vec<Purge> = keys
                .iter()
                .filter_map(|key| state.take(key))
                .map(|cached| Purge::of(cached.entry))
                .collect();
            (purges.len(), self.schedule(purges))
        };

        run_purges(&inline);
        count
    }

    /// Wait until every artifact deletion scheduled so far has finished.
    pub async fn wait_for_purges(&self) {
        loop {
            let done = self.pending.done.notified();
            if self.pending.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            done.await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            capacity: self.config.max_size,
            expired: state.expired,
            evicted: state.evicted,
            removed: state.removed,
        }
    }

    /// Start the periodic expiry sweep.
    pub fn start_background_sweeper(
        self: &Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            let mut sweep_interval = interval(period);
            info!(
                "Result cache sweeper started (ttl: {}s, interval: {}s)",
                cache.config.ttl_secs,
                period.as_secs()
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Result cache sweeper shutting down");
                        break;
                    }
                    _ = sweep_interval.tick() => {
                        let evicted = cache.cleanup_expired();
                        if evicted > 0 {
                            debug!("Cache sweep completed: {} entries expired", evicted);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(name: &str) -> SessionId {
        SessionId::from_raw(name)
    }

    fn entry_with_dir(root: &Path, name: &str) -> StorageEntry {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("dem.png");
        std::fs::write(&file, b"png").unwrap();
        StorageEntry::completed("Task completed successfully.", Some(dir), file, vec![])
    }

    #[test]
    fn test_get_remove_get() {
        let cache = ResultCache::new(StorageConfig::default());
        cache.put(id("a"), StorageEntry::failed("Task failed with error: boom", None));

        let found = cache.get(&id("a")).unwrap();
        assert!(!found.success);

        assert!(cache.remove(&id("a")));
        assert!(cache.get(&id("a")).is_none());
        assert!(!cache.remove(&id("a")));
    }

    #[test]
    fn test_capacity_evicts_oldest_and_its_directory() {
        let tmp = TempDir::new().unwrap();
        let cache = ResultCache::new(StorageConfig::default().with_max_size(2));

        let first = entry_with_dir(tmp.path(), "first");
        let first_dir = first.directory.clone().unwrap();
        cache.put(id("first"), first);
        cache.put(id("second"), entry_with_dir(tmp.path(), "second"));
        cache.put(id("third"), entry_with_dir(tmp.path(), "third"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&id("first")).is_none());
        assert!(!first_dir.exists());
        assert!(tmp.path().join("second").exists());
        assert!(tmp.path().join("third").exists());
        assert_eq!(cache.stats().evicted, 1);
    }

    #[test]
    fn test_expired_entry_is_absent() {
        let tmp = TempDir::new().unwrap();
        let cache = ResultCache::new(StorageConfig::default().with_ttl_secs(0));
        let entry = entry_with_dir(tmp.path(), "gone");
        let dir = entry.directory.clone().unwrap();

        cache.put(id("gone"), entry);
        assert!(cache.get(&id("gone")).is_none());
        assert!(!dir.exists());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cleanup_expired() {
        let cache = ResultCache::new(StorageConfig::default().with_ttl_secs(0));
        cache.put(id("a"), StorageEntry::failed("x", None));
        cache.put(id("b"), StorageEntry::failed("y", None));

        assert_eq!(cache.cleanup_expired(), 2);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expired, 2);
    }

    #[test]
    fn test_replacing_key_keeps_shared_directory() {
        let tmp = TempDir::new().unwrap();
        let cache = ResultCache::new(StorageConfig::default());

        cache.put(id("a"), entry_with_dir(tmp.path(), "a"));
        let replacement = entry_with_dir(tmp.path(), "a");
        cache.put(id("a"), replacement.clone());

        assert_eq!(cache.len(), 1);
        assert!(tmp.path().join("a").exists());
        assert_eq!(cache.get(&id("a")), Some(replacement));
    }

    #[test]
    fn test_eviction_removes_outside_archive() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("full");
        std::fs::create_dir_all(&dir).unwrap();
        let archive = tmp.path().join("full.zip");
        std::fs::write(&archive, b"zip").unwrap();

        let cache = ResultCache::new(StorageConfig::default());
        cache.put(
            id("full"),
            StorageEntry::completed("ok", Some(dir.clone()), archive.clone(), vec![]),
        );
        let popped = cache.pop(&id("full")).unwrap();

        assert!(popped.success);
        assert!(!dir.exists());
        assert!(!archive.exists());
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let cache = ResultCache::new(StorageConfig::default().with_ttl_secs(u64::MAX));
        cache.put(id("a"), StorageEntry::failed("x", None));

        assert!(cache.get(&id("a")).is_some());
        assert_eq!(cache.cleanup_expired(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_attachments_are_purged() {
        let tmp = TempDir::new().unwrap();
        let osm = tmp.path().join("a_custom.osm");
        std::fs::write(&osm, "<osm/>").unwrap();

        let cache = ResultCache::new(StorageConfig::default());
        cache.put(
            id("a"),
            StorageEntry::failed("x", None).with_attachments(vec![osm.clone()]),
        );
        assert!(osm.exists());

        assert!(cache.remove(&id("a")));
        assert!(!osm.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_purges_run_on_blocking_pool() {
        let tmp = TempDir::new().unwrap();
        let cache = ResultCache::new(StorageConfig::default().with_max_size(1));

        let first = entry_with_dir(tmp.path(), "first");
        let first_dir = first.directory.clone().unwrap();
        cache.put(id("first"), first);
        cache.put(id("second"), entry_with_dir(tmp.path(), "second"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evicted, 1);

        let second_dir = tmp.path().join("second");
        assert!(cache.pop(&id("second")).is_some());

        cache.wait_for_purges().await;
        assert!(!first_dir.exists());
        assert!(!second_dir.exists());
        assert_eq!(cache.pending.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_waiters_all_see_purge_finish() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ResultCache::new(StorageConfig::default()));
        let entry = entry_with_dir(tmp.path(), "shared");
        let dir = entry.directory.clone().unwrap();
        cache.put(id("shared"), entry);
        assert!(cache.remove(&id("shared")));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let dir = dir.clone();
                tokio::spawn(async move {
                    cache.wait_for_purges().await;
                    assert!(!dir.exists());
                })
            })
            .collect();
        for waiter in waiters {
            waiter.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_background_sweeper_stops_on_cancel() {
        let cache = Arc::new(ResultCache::new(
            StorageConfig::default()
                .with_ttl_secs(0)
                .with_sweep_interval_secs(1),
        ));
        cache.put(id("a"), StorageEntry::failed("x", None));

        let token = CancellationToken::new();
        let handle = cache.start_background_sweeper(token.clone());

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.is_empty());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
