//! Disk-based image cache for persistence across sessions.
//!
//! Every method here is blocking. The cache facade calls them from its
//! serial I/O executor, so writes, removals and sweeps never overlap.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

use crate::domain::entities::CacheKey;
use crate::domain::errors::ImageError;

const NAMESPACE_PREFIX: &str = "com.webimage.ImageCache.";

/// One file found while enumerating the cache directory.
#[derive(Debug, Clone)]
pub struct DiskEntry {
    /// File path.
    pub path: PathBuf,
    /// File size in bytes.
    pub size: u64,
    /// Last modification time, the access-time proxy for eviction.
    pub modified: SystemTime,
}

/// Result of one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed for exceeding the maximum age.
    pub expired: usize,
    /// Entries removed to get under the size limit.
    pub evicted: usize,
    /// Bytes left on disk after the sweep.
    pub remaining_bytes: u64,
}

/// Disk-based image cache that persists the original image bytes.
pub struct DiskImageCache {
    root: PathBuf,
    read_only_paths: RwLock<Vec<PathBuf>>,
    disable_backup: bool,
}

impl DiskImageCache {
    /// Opens the namespace directory under `disk_root`, creating it if needed.
    ///
    /// A directory that cannot be created is logged; writes retry the
    /// creation and reads miss until then.
    #[must_use]
    pub fn new(disk_root: &Path, namespace: &str, disable_backup: bool) -> Self {
        let root = Self::namespace_dir(disk_root, namespace);
        match fs::create_dir_all(&root) {
            Ok(()) => debug!(root = %root.display(), "Opened disk image cache"),
            Err(e) => warn!(root = %root.display(), error = %e, "Failed to create cache dir"),
        }
        Self {
            root,
            read_only_paths: RwLock::new(Vec::new()),
            disable_backup,
        }
    }

    /// `<disk_root>/default/com.webimage.ImageCache.<namespace>`.
    #[must_use]
    pub fn namespace_dir(disk_root: &Path, namespace: &str) -> PathBuf {
        disk_root
            .join("default")
            .join(format!("{NAMESPACE_PREFIX}{namespace}"))
    }

    /// Directory that receives writes.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `key` under an arbitrary cache directory.
    #[must_use]
    pub fn cache_path_for_key(key: &CacheKey, root: &Path) -> PathBuf {
        root.join(key.disk_file_name())
    }

    /// Path of `key` under the writable directory.
    #[must_use]
    pub fn default_cache_path_for_key(&self, key: &CacheKey) -> PathBuf {
        Self::cache_path_for_key(key, &self.root)
    }

    /// Adds a pre-populated directory searched after the writable one.
    /// Directories are searched in the order they were added.
    pub fn add_read_only_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut paths = self.read_only_paths.write();
        if !paths.contains(&path) {
            debug!(path = %path.display(), "Added read-only cache path");
            paths.push(path);
        }
    }

    fn candidate_paths(&self, key: &CacheKey) -> Vec<PathBuf> {
        let mut candidates = vec![self.default_cache_path_for_key(key)];
        candidates.extend(
            self.read_only_paths
                .read()
                .iter()
                .map(|root| Self::cache_path_for_key(key, root)),
        );
        candidates
    }

    /// Writes `bytes` for `key`, replacing any existing entry.
    ///
    /// The data goes to a temporary file in the same directory that is then
    /// renamed over the target, so readers see the old or the new file and
    /// never a partial one.
    ///
    /// # Errors
    /// Returns `ImageError::DiskIo` if the file cannot be written.
    pub fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), ImageError> {
        let path = self.default_cache_path_for_key(key);
        if !self.root.exists() {
            fs::create_dir_all(&self.root)
                .map_err(|e| ImageError::disk_io(format!("failed to recreate cache dir: {e}")))?;
        }

        let mut file = NamedTempFile::new_in(&self.root)
            .map_err(|e| ImageError::disk_io(format!("failed to create temp file: {e}")))?;
        file.write_all(bytes)
            .map_err(|e| ImageError::disk_io(format!("failed to write cache file: {e}")))?;
        file.persist(&path)
            .map_err(|e| ImageError::disk_io(format!("failed to persist cache file: {e}")))?;

        if self.disable_backup {
            exclude_from_backup(&path);
        }

        debug!(key = %key, path = %path.display(), size = bytes.len(), "Stored image in disk cache");
        Ok(())
    }

    /// Reads the bytes for `key`, probing the writable directory first and
    /// then each read-only path. Unreadable files count as misses.
    pub fn load_bytes(&self, key: &CacheKey) -> Option<Bytes> {
        for path in self.candidate_paths(key) {
            match fs::read(&path) {
                Ok(bytes) => {
                    trace!(key = %key, path = %path.display(), "Disk cache hit");
                    return Some(Bytes::from(bytes));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(key = %key, path = %path.display(), error = %e, "Failed to read cache file");
                }
            }
        }
        trace!(key = %key, "Disk cache miss");
        None
    }

    /// Checks if an entry exists in any searched directory.
    #[must_use]
    pub fn exists(&self, key: &CacheKey) -> bool {
        self.candidate_paths(key).iter().any(|path| path.is_file())
    }

    /// Removes the writable entry for `key`.
    pub fn remove(&self, key: &CacheKey) {
        let path = self.default_cache_path_for_key(key);
        match fs::remove_file(&path) {
            Ok(()) => debug!(key = %key, "Removed image from disk cache"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(key = %key, error = %e, "Failed to remove from disk cache"),
        }
    }

    /// Deletes the namespace directory and recreates it empty.
    ///
    /// # Errors
    /// Returns `ImageError::DiskIo` if the directory cannot be recreated.
    pub fn clear(&self) -> Result<(), ImageError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to remove cache directory"),
        }
        fs::create_dir_all(&self.root)
            .map_err(|e| ImageError::disk_io(format!("failed to recreate cache dir: {e}")))?;
        debug!(root = %self.root.display(), "Cleared disk cache");
        Ok(())
    }

    /// Lists every cache file in the writable directory.
    #[must_use]
    pub fn entries(&self) -> Vec<DiskEntry> {
        let Ok(dir) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        dir.filter_map(Result::ok)
            .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                Some(DiskEntry {
                    path: entry.path(),
                    size: meta.len(),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                })
            })
            .collect()
    }

    /// Total bytes in the writable directory.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.entries().iter().map(|e| e.size).sum()
    }

    /// Number of files in the writable directory.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries().len()
    }

    /// Two-pass eviction.
    ///
    /// Pass 1 deletes entries older than `max_age` (`None` = no limit).
    /// Pass 2 runs when the remaining total exceeds `max_size` (0 = no limit)
    /// and deletes the oldest entries until the total is at most half of it.
    pub fn sweep_expired(&self, max_age: Option<Duration>, max_size: u64) -> SweepReport {
        let now = SystemTime::now();
        let mut report = SweepReport::default();
        let mut kept = Vec::new();

        for entry in self.entries() {
            let age = now.duration_since(entry.modified).unwrap_or_default();
            if max_age.is_some_and(|limit| age > limit) {
                if remove_entry(&entry) {
                    report.expired += 1;
                }
                continue;
            }
            report.remaining_bytes += entry.size;
            kept.push(entry);
        }

        if max_size > 0 && report.remaining_bytes > max_size {
            let target = max_size / 2;
            debug!(
                current_size = report.remaining_bytes,
                max_size, target, "Disk cache over limit, cleaning up"
            );
            kept.sort_by_key(|entry| entry.modified);
            for entry in kept {
                if report.remaining_bytes <= target {
                    break;
                }
                if remove_entry(&entry) {
                    report.remaining_bytes -= entry.size;
                    report.evicted += 1;
                }
            }
        }

        debug!(
            expired = report.expired,
            evicted = report.evicted,
            remaining_bytes = report.remaining_bytes,
            "Disk cache sweep complete"
        );
        report
    }
}

impl std::fmt::Debug for DiskImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImageCache")
            .field("root", &self.root)
            .field("read_only_paths", &self.read_only_paths.read().len())
            .finish_non_exhaustive()
    }
}

fn remove_entry(entry: &DiskEntry) -> bool {
    match fs::remove_file(&entry.path) {
        Ok(()) => {
            trace!(path = %entry.path.display(), "Removed old cache file");
            true
        }
        Err(e) => {
            warn!(path = %entry.path.display(), error = %e, "Failed to remove old cache file");
            false
        }
    }
}

// No portable backup-exclusion attribute exists outside Apple platforms.
fn exclude_from_backup(path: &Path) {
    trace!(path = %path.display(), "Backup exclusion not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_cache() -> (DiskImageCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskImageCache::new(temp_dir.path(), "test", true);
        (cache, temp_dir)
    }

    fn age_file(path: &Path, age: Duration) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_layout() {
        let (cache, temp) = create_test_cache();
        let key = CacheKey::new("http://x/b.png");

        assert_eq!(
            cache.root(),
            temp.path()
                .join("default")
                .join("com.webimage.ImageCache.test")
        );
        let path = cache.default_cache_path_for_key(&key);
        assert_eq!(path.parent(), Some(cache.root()));
        assert_eq!(path.extension(), None);
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some(key.disk_file_name().as_str())
        );
    }

    #[test]
    fn test_store_and_load_bytes() {
        let (cache, _temp) = create_test_cache();
        let key = CacheKey::new("test1");

        cache.store(&key, b"test image data").unwrap();

        assert_eq!(
            cache.load_bytes(&key).as_deref(),
            Some(&b"test image data"[..])
        );
        assert!(cache.exists(&key));
        assert_eq!(cache.count(), 1, "temp files are not left behind");
    }

    #[test]
    fn test_store_overwrites() {
        let (cache, _temp) = create_test_cache();
        let key = CacheKey::new("k");

        cache.store(&key, b"hello").unwrap();
        cache.store(&key, b"hey").unwrap();

        assert_eq!(cache.load_bytes(&key).as_deref(), Some(&b"hey"[..]));
        assert_eq!(cache.total_size(), 3);
    }

    #[test]
    fn test_cache_miss() {
        let (cache, _temp) = create_test_cache();
        let key = CacheKey::new("nonexistent");

        assert!(cache.load_bytes(&key).is_none());
        assert!(!cache.exists(&key));
    }

    #[test]
    fn test_read_only_paths_searched_after_primary() {
        let (cache, _temp) = create_test_cache();
        let bundle = TempDir::new().unwrap();
        let key = CacheKey::new("bundled");

        fs::write(
            DiskImageCache::cache_path_for_key(&key, bundle.path()),
            b"bundled",
        )
        .unwrap();
        cache.add_read_only_path(bundle.path());

        assert_eq!(cache.load_bytes(&key).as_deref(), Some(&b"bundled"[..]));

        cache.store(&key, b"primary").unwrap();
        assert_eq!(cache.load_bytes(&key).as_deref(), Some(&b"primary"[..]));
    }

    #[test]
    fn test_remove() {
        let (cache, _temp) = create_test_cache();
        let key = CacheKey::new("test1");

        cache.store(&key, b"test").unwrap();
        cache.remove(&key);
        assert!(!cache.exists(&key));

        // Removing again is harmless.
        cache.remove(&key);
    }

    #[test]
    fn test_clear() {
        let (cache, _temp) = create_test_cache();

        cache.store(&CacheKey::new("test1"), b"data1").unwrap();
        cache.store(&CacheKey::new("test2"), b"data2").unwrap();
        assert_eq!(cache.count(), 2);
        assert_eq!(cache.total_size(), 10);

        cache.clear().unwrap();
        assert_eq!(cache.count(), 0);
        assert!(cache.root().is_dir());
    }

    #[test]
    fn test_sweep_removes_expired_entries() {
        let (cache, _temp) = create_test_cache();
        let old = CacheKey::new("old");
        let fresh = CacheKey::new("fresh");
        cache.store(&old, b"old").unwrap();
        cache.store(&fresh, b"fresh").unwrap();
        age_file(&cache.default_cache_path_for_key(&old), Duration::from_secs(3600));

        let report = cache.sweep_expired(Some(Duration::from_secs(60)), 0);

        assert_eq!(report.expired, 1);
        assert!(!cache.exists(&old));
        assert!(cache.exists(&fresh));
    }

    #[test]
    fn test_sweep_without_age_limit_keeps_old_entries() {
        let (cache, _temp) = create_test_cache();
        let old = CacheKey::new("old");
        cache.store(&old, b"old").unwrap();
        age_file(
            &cache.default_cache_path_for_key(&old),
            Duration::from_secs(86_400 * 365),
        );

        let report = cache.sweep_expired(None, 0);
        assert_eq!(report, SweepReport {
            expired: 0,
            evicted: 0,
            remaining_bytes: 3,
        });
    }

    #[test]
    fn test_size_sweep_evicts_oldest_down_to_half() {
        let (cache, _temp) = create_test_cache();
        for i in 0..4u64 {
            let key = CacheKey::new(format!("k{i}"));
            cache.store(&key, &[0u8; 10]).unwrap();
            // k0 is the oldest, k3 the newest
            age_file(
                &cache.default_cache_path_for_key(&key),
                Duration::from_secs(100 - i * 10),
            );
        }

        let report = cache.sweep_expired(None, 30);

        assert_eq!(report.evicted, 3);
        assert_eq!(report.remaining_bytes, 10);
        assert!(cache.exists(&CacheKey::new("k3")));
        assert!(!cache.exists(&CacheKey::new("k0")));
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let (cache, _temp) = create_test_cache();
        for i in 0..6u64 {
            let key = CacheKey::new(format!("k{i}"));
            cache.store(&key, &[1u8; 8]).unwrap();
            age_file(
                &cache.default_cache_path_for_key(&key),
                Duration::from_secs(i * 1000),
            );
        }

        cache.sweep_expired(Some(Duration::from_secs(3500)), 20);
        let mut first: Vec<_> = cache.entries().into_iter().map(|e| e.path).collect();
        first.sort();

        let report = cache.sweep_expired(Some(Duration::from_secs(3500)), 20);
        let mut second: Vec<_> = cache.entries().into_iter().map(|e| e.path).collect();
        second.sort();

        assert_eq!(first, second);
        assert_eq!(report.expired + report.evicted, 0);
    }

    #[test]
    fn test_under_limit_sweep_removes_nothing() {
        let (cache, _temp) = create_test_cache();
        cache.store(&CacheKey::new("a"), b"123456").unwrap();

        let report = cache.sweep_expired(None, 10);
        assert_eq!(report.evicted, 0);
        assert_eq!(cache.count(), 1);
    }
}
