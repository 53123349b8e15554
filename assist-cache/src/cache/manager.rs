//! Cache manager: the facade every consumer talks to
//!
//! Responsibilities:
//! - Hash logical keys into fixed-length identifiers
//! - Assign TTLs by key category
//! - Compress large payloads and route entries between tiers
//! - Promote disk hits into memory and demote evicted memory entries to disk
//! - Collect statistics
//!
//! Failures below this layer never reach callers: corrupt rows, decode
//! errors and slow or broken disk access all degrade to a miss.

use crate::cache::{
    codec,
    config::{CacheConfig, CacheMode},
    disk::{DiskLookup, DiskTier},
    entry::{CacheEntry, EntryMetadata},
    memory::{MemoryLookup, MemoryTier},
    types::{hash_key, short_key, CacheStatistics, CacheValue, KeyCategory, StatsCounters},
};
use crate::error::{CacheError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Entries removed by one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub memory_removed: usize,
    pub disk_removed: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.memory_removed + self.disk_removed
    }
}

/// Where a lookup was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Memory,
    Disk,
}

/// Exclusive hold on tier transitions; advances the epoch on release
struct Transition<'a> {
    _guard: MutexGuard<'a, ()>,
    epoch: &'a AtomicU64,
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        // Runs before the guard field is dropped, so waiters see the new epoch
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

/// Tiered cache manager
///
/// Construct one per process at startup and share it behind an `Arc`.
/// All methods take `&self` and are safe to call concurrently.
pub struct CacheManager {
    config: CacheConfig,

    /// Memory tier; insertion, eviction and byte accounting share one guard
    memory: RwLock<MemoryTier>,

    /// Disk tier, present in `Disk` and `Hybrid` modes
    disk: Option<DiskTier>,

    /// Held by writes, removals, invalidation and tier moves
    transitions: Mutex<()>,

    /// Count of completed transitions
    epoch: AtomicU64,

    stats: StatsCounters,
}

impl CacheManager {
    /// Create a manager, opening the disk tier if the mode uses one
    ///
    /// Configuration and storage-location errors are fatal here and only here.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let disk = if config.mode.uses_disk() {
            std::fs::create_dir_all(&config.cache_dir).map_err(|e| {
                CacheError::Config(format!(
                    "cannot create cache dir {}: {}",
                    config.cache_dir.display(),
                    e
                ))
            })?;
            Some(DiskTier::open(
                &config.database_path(),
                config.disk_budget_bytes,
                config.disk_timeout,
            )?)
        } else {
            None
        };

        info!(
            "Cache manager initialized: {:?} mode, memory budget {} bytes",
            config.mode, config.memory_budget_bytes
        );

        Ok(Self {
            memory: RwLock::new(MemoryTier::new(config.memory_budget_bytes)),
            disk,
            config,
            transitions: Mutex::new(()),
            epoch: AtomicU64::new(0),
            stats: StatsCounters::default(),
        })
    }

    /// Configuration this manager was built with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Retrieve a value
    ///
    /// Every call records exactly one hit or one miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let hashed = hash_key(key);

        let Some((bytes, tier)) = self.lookup(key, &hashed).await else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache miss: {}", short_key(key));
            return None;
        };

        match codec::decode::<T>(&bytes) {
            Ok(value) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit ({:?}): {}", tier, short_key(key));
                Some(value)
            }
            Err(e) => {
                warn!("Undecodable cache entry {}: {}; removing", short_key(key), e);
                self.remove_hashed(&hashed).await;
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value with the category default TTL
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        self.set_with_metadata(key, value, ttl, EntryMetadata::default())
            .await
    }

    /// Store a value with explicit metadata
    ///
    /// Never fails: unencodable values and entries larger than every
    /// budget are dropped with a log line.
    pub async fn set_with_metadata<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        mut metadata: EntryMetadata,
    ) {
        let bytes = match codec::encode(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot serialize value for {}: {}", short_key(key), e);
                return;
            }
        };

        let category = KeyCategory::infer(key);
        let ttl = ttl.unwrap_or_else(|| self.config.ttls.for_category(category));
        let size_bytes = bytes.len();
        metadata.category = Some(category);

        let mut entry = CacheEntry::new(key, bytes, ttl);
        entry.size_bytes = size_bytes;

        if self.config.enable_compression && size_bytes > self.config.compression_threshold {
            match codec::compress(&entry.value) {
                Ok(packed) => {
                    entry.value = packed;
                    metadata.compressed = true;
                }
                Err(e) => warn!("Compression failed for {}: {}", short_key(key), e),
            }
        }
        entry.metadata = metadata;

        let to_memory = match self.config.mode {
            CacheMode::Memory => true,
            CacheMode::Disk => false,
            CacheMode::Hybrid => size_bytes < self.config.compression_threshold,
        };

        debug!(
            "Cache set: {} ({} bytes, TTL {:?}, {})",
            short_key(key),
            size_bytes,
            ttl,
            if to_memory { "memory" } else { "disk" }
        );

        if to_memory {
            self.store_in_memory(entry).await;
        } else {
            self.store_on_disk(entry).await;
        }
    }

    /// Remove one logical key from both tiers
    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.remove_hashed(&hash_key(key)).await;
        if removed {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove entries whose logical key contains `pattern`; `None` clears everything
    ///
    /// Returns the number of entries removed.
    pub async fn invalidate(&self, pattern: Option<&str>) -> usize {
        let transition = self.begin_transition().await;
        let memory_removed = self.memory.write().await.remove_matching(pattern);

        let owned = pattern.map(str::to_string);
        let disk_removed = if self.disk.is_some() {
            self.disk_op("invalidate", move |disk| disk.delete_matching(owned.as_deref()))
                .await
                .unwrap_or_else(|e| {
                    warn!("Disk invalidation failed: {}", e);
                    0
                })
        } else {
            0
        };

        drop(transition);

        let count = memory_removed + disk_removed;
        StatsCounters::add(&self.stats.invalidations, count);
        info!(
            "Invalidated {} cache entries (pattern: {})",
            count,
            pattern.unwrap_or("<all>")
        );
        count
    }

    /// Sweep both tiers for expired entries
    ///
    /// Works in batches of `sweep_batch_size`, releasing locks between
    /// batches so request traffic is never stalled behind a full scan.
    pub async fn cleanup(&self) -> CleanupReport {
        let batch = self.config.sweep_batch_size;
        let mut report = CleanupReport::default();

        let expired = self.memory.read().await.expired_keys();
        for chunk in expired.chunks(batch) {
            report.memory_removed += self.memory.write().await.remove_expired(chunk);
            tokio::task::yield_now().await;
        }

        if self.disk.is_some() {
            loop {
                match self.disk_op("cleanup", move |disk| disk.purge_expired(batch)).await {
                    Ok(n) => {
                        report.disk_removed += n;
                        if n < batch {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Disk sweep stopped early: {}", e);
                        break;
                    }
                }
                tokio::task::yield_now().await;
            }
        }

        StatsCounters::add(&self.stats.expirations, report.total());
        info!(
            "Cleaned up {} expired entries ({} memory, {} disk)",
            report.total(),
            report.memory_removed,
            report.disk_removed
        );
        report
    }

    /// Read-only statistics snapshot
    pub async fn statistics(&self) -> CacheStatistics {
        let mut stats = self.stats.snapshot();

        {
            let memory = self.memory.read().await;
            stats.memory_entries = memory.len();
            stats.size_bytes = memory.size_bytes() as u64;
        }

        if self.disk.is_some() {
            match self.disk_op("statistics", |disk| disk.totals()).await {
                Ok((rows, bytes)) => {
                    stats.disk_entries = rows;
                    stats.size_bytes += bytes;
                }
                Err(e) => warn!("Disk statistics unavailable: {}", e),
            }
        }

        stats.entry_count = stats.memory_entries + stats.disk_entries;
        stats
    }

    /// Find the payload for a key in memory, then on disk
    async fn lookup(&self, key: &str, hashed: &str) -> Option<(CacheValue, Tier)> {
        let memory_hit = self.memory.write().await.get(hashed, key);
        match memory_hit {
            MemoryLookup::Hit(value, compressed) => {
                return match self.unpack(value, compressed) {
                    Ok(bytes) => Some((bytes, Tier::Memory)),
                    Err(e) => {
                        warn!("Corrupt memory entry {}: {}", short_key(key), e);
                        self.memory.write().await.remove(hashed);
                        None
                    }
                };
            }
            MemoryLookup::Expired => {
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            }
            MemoryLookup::Absent => {}
        }

        if self.disk.is_none() {
            return None;
        }

        let observed = self.epoch.load(Ordering::Acquire);
        let owned = hashed.to_string();
        let row = match self.disk_op("fetch", move |disk| disk.fetch(&owned)).await {
            Ok(DiskLookup::Found(row)) => row,
            Ok(DiskLookup::Expired) => {
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Ok(DiskLookup::Absent) => return None,
            Err(e) => {
                warn!("Disk lookup failed for {}: {}", short_key(key), e);
                return None;
            }
        };

        if row.logical_key != key {
            debug!("Hash collision on disk for {}; treating as miss", short_key(key));
            return None;
        }

        let decoded = row.into_entry().and_then(|entry| {
            let bytes = self.unpack(entry.value.clone(), entry.metadata.compressed)?;
            Ok((entry, bytes))
        });

        let (entry, bytes) = match decoded {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Corrupt disk row for {}: {}; deleting", short_key(key), e);
                let owned = hashed.to_string();
                if let Err(e) = self.disk_op("delete", move |disk| disk.delete(&owned)).await {
                    warn!("Could not delete corrupt row: {}", e);
                }
                return None;
            }
        };

        if self.config.mode == CacheMode::Hybrid
            && entry.size_bytes < self.config.compression_threshold
        {
            self.promote(entry, bytes.clone(), observed).await;
        }

        Some((bytes, Tier::Disk))
    }

    /// Move a disk hit into memory, keeping its age and TTL
    ///
    /// Skipped when any write, removal or invalidation finished after the
    /// row was read at `observed`: the row may no longer be current.
    async fn promote(&self, mut entry: CacheEntry, bytes: CacheValue, observed: u64) {
        if !self.memory.read().await.fits_budget(entry.size_bytes) {
            return;
        }

        let _transition = self.transitions.lock().await;
        if self.epoch.load(Ordering::Acquire) != observed {
            debug!("Skipping promotion of {}: cache changed", short_key(&entry.logical_key));
            return;
        }

        entry.value = bytes;
        entry.metadata.compressed = false;
        entry.metadata.promoted = true;
        entry.metadata.demoted = false;
        let hashed = entry.key.clone();

        if self.insert_memory(entry).await {
            let owned = hashed.clone();
            if let Err(e) = self.disk_op("promote", move |disk| disk.delete(&owned)).await {
                warn!("Promoted entry {} left on disk: {}", hashed, e);
            }
        }
    }

    async fn store_in_memory(&self, entry: CacheEntry) {
        let hashed = entry.key.clone();

        let fits = self.memory.read().await.fits_budget(entry.size_bytes);
        if !fits {
            if self.config.mode == CacheMode::Hybrid {
                self.store_on_disk(entry).await;
            } else {
                debug!("Dropping {}: larger than memory budget", short_key(&entry.logical_key));
            }
            return;
        }

        let _transition = self.begin_transition().await;
        if self.insert_memory(entry).await && self.disk.is_some() {
            // A stale copy on disk would resurface once the memory copy expires
            if let Err(e) = self.disk_op("replace", move |disk| disk.delete(&hashed)).await {
                warn!("Could not clear previous disk copy: {}", e);
            }
        }
    }

    /// Insert into memory, demoting evicted entries to disk in hybrid mode
    ///
    /// Callers hold `transitions` so the demoted copies land before any
    /// invalidation can look for them.
    async fn insert_memory(&self, entry: CacheEntry) -> bool {
        let outcome = self.memory.write().await.insert(entry);
        StatsCounters::add(&self.stats.evictions, outcome.evicted.len());

        if self.config.mode == CacheMode::Hybrid {
            for mut evicted in outcome.evicted {
                evicted.metadata.demoted = true;
                evicted.metadata.promoted = false;
                self.write_disk(evicted).await;
            }
        }

        outcome.stored
    }

    async fn store_on_disk(&self, entry: CacheEntry) {
        if self.disk.is_none() {
            return;
        }
        let hashed = entry.key.clone();
        let _transition = self.begin_transition().await;
        self.memory.write().await.remove(&hashed);
        self.write_disk(entry).await;
    }

    async fn write_disk(&self, entry: CacheEntry) {
        let key = entry.logical_key.clone();
        match self.disk_op("put", move |disk| disk.put(&entry)).await {
            Ok(evicted) => StatsCounters::add(&self.stats.evictions, evicted),
            Err(e) => warn!("Disk write failed for {}: {}", short_key(&key), e),
        }
    }

    async fn remove_hashed(&self, hashed: &str) -> bool {
        let _transition = self.begin_transition().await;
        let in_memory = self.memory.write().await.remove(hashed).is_some();

        let on_disk = if self.disk.is_some() {
            let owned = hashed.to_string();
            self.disk_op("delete", move |disk| disk.delete(&owned))
                .await
                .unwrap_or(false)
        } else {
            false
        };

        in_memory || on_disk
    }

    async fn begin_transition(&self) -> Transition<'_> {
        Transition {
            _guard: self.transitions.lock().await,
            epoch: &self.epoch,
        }
    }

    fn unpack(&self, value: CacheValue, compressed: bool) -> Result<CacheValue> {
        if compressed {
            codec::decompress(&value)
        } else {
            Ok(value)
        }
    }

    /// Run a blocking disk operation bounded by `disk_timeout`
    async fn disk_op<T, F>(&self, context: &str, op: F) -> Result<T>
    where
        F: FnOnce(&DiskTier) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let disk = self.disk.clone().ok_or(CacheError::DiskDisabled)?;
        let task = tokio::task::spawn_blocking(move || op(&disk));

        match tokio::time::timeout(self.config.disk_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(CacheError::Task(join_error.to_string())),
            Err(_) => Err(CacheError::Timeout {
                timeout_ms: self.config.disk_timeout.as_millis() as u64,
                context: context.to_string(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) async fn memory_accounting(&self) -> (usize, usize) {
        let memory = self.memory.read().await;
        (memory.size_bytes(), memory.recomputed_size())
    }

    #[cfg(test)]
    pub(crate) fn disk_tier(&self) -> Option<&DiskTier> {
        self.disk.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn hybrid(dir: &tempfile::TempDir) -> CacheConfig {
        CacheConfig::builder()
            .mode(CacheMode::Hybrid)
            .memory_budget_bytes(1024 * 1024)
            .cache_dir(dir.path())
            .disk_timeout(Duration::from_secs(2))
            .build()
    }

    #[tokio::test]
    async fn test_round_trip_and_hit_stats() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(hybrid(&dir)).unwrap();

        cache.set("test_key", "test_value", Some(Duration::from_secs(10))).await;
        let value: Option<String> = cache.get("test_key").await;
        assert_eq!(value.as_deref(), Some("test_value"));

        let stats = cache.statistics().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.memory_entries, 1);
    }

    #[tokio::test]
    async fn test_miss_stats() {
        let cache = CacheManager::new(CacheConfig::memory_only()).unwrap();

        assert!(cache.get::<String>("nonexistent_key").await.is_none());
        let stats = cache.statistics().await;
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_large_entry_goes_to_disk_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(hybrid(&dir)).unwrap();

        let large = "a".repeat(5000);
        cache.set("response:large", &large, None).await;

        let stats = cache.statistics().await;
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.disk_entries, 1);
        // Stored compressed
        assert!(stats.size_bytes < 1000);

        let back: Option<String> = cache.get("response:large").await;
        assert_eq!(back, Some(large));
    }

    #[tokio::test]
    async fn test_lru_demotes_to_disk_in_hybrid_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::builder()
            .memory_budget_bytes(64)
            .cache_dir(dir.path())
            .disk_timeout(Duration::from_secs(2))
            .build();
        let cache = CacheManager::new(config).unwrap();

        // Each payload is 22 bytes of JSON
        for i in 0..5 {
            cache.set(&format!("k{}", i), &"x".repeat(20), None).await;
        }

        let stats = cache.statistics().await;
        assert!(stats.evictions >= 2);
        assert_eq!(stats.entry_count, 5);
        assert!(stats.disk_entries >= 2);

        // Demoted entries are still readable
        let first: Option<String> = cache.get("k0").await;
        assert_eq!(first, Some("x".repeat(20)));
    }

    #[tokio::test]
    async fn test_memory_mode_discards_evicted_entries() {
        let config = CacheConfig::builder()
            .disable_disk()
            .memory_budget_bytes(50)
            .build();
        let cache = CacheManager::new(config).unwrap();

        cache.set("a", &"x".repeat(20), None).await;
        cache.set("b", &"x".repeat(20), None).await;
        // Refresh `a`
        assert!(cache.get::<String>("a").await.is_some());
        cache.set("c", &"x".repeat(20), None).await;

        assert!(cache.get::<String>("b").await.is_none());
        assert!(cache.get::<String>("a").await.is_some());
        assert!(cache.get::<String>("c").await.is_some());
        assert_eq!(cache.statistics().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_oversized_set_is_silently_dropped() {
        let config = CacheConfig::builder()
            .disable_disk()
            .memory_budget_bytes(16)
            .compression_threshold(1 << 20)
            .build();
        let cache = CacheManager::new(config).unwrap();

        cache.set("big", &"y".repeat(100), None).await;
        assert!(cache.get::<String>("big").await.is_none());
        assert_eq!(cache.statistics().await.entry_count, 0);
    }

    #[tokio::test]
    async fn test_promotion_moves_disk_hit_into_memory() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::builder()
            .memory_budget_bytes(64)
            .cache_dir(dir.path())
            .disk_timeout(Duration::from_secs(2))
            .build();
        let cache = CacheManager::new(config).unwrap();

        cache.set("a", &"x".repeat(20), None).await;
        cache.set("b", &"x".repeat(20), None).await;
        cache.set("c", &"x".repeat(20), None).await;
        // `a` was demoted
        let before = cache.statistics().await;
        assert_eq!(before.disk_entries, 1);

        assert!(cache.get::<String>("a").await.is_some());
        let after = cache.statistics().await;
        assert_eq!(after.entry_count, 3);
        // `a` came back into memory, pushing `b` down
        assert_eq!(after.disk_entries, 1);

        let (tracked, actual) = cache.memory_accounting().await;
        assert_eq!(tracked, actual);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let cache = CacheManager::new(CacheConfig::memory_only()).unwrap();
        cache.set("expire_key", "value", Some(Duration::from_millis(100))).await;

        assert_eq!(cache.get::<String>("expire_key").await.as_deref(), Some("value"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get::<String>("expire_key").await.is_none());
        assert_eq!(cache.statistics().await.expirations, 1);
    }

    #[tokio::test]
    async fn test_disk_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::builder()
            .mode(CacheMode::Disk)
            .cache_dir(dir.path())
            .disk_timeout(Duration::from_secs(2))
            .build();
        let cache = CacheManager::new(config).unwrap();

        cache.set("response:x", "v", Some(Duration::from_millis(50))).await;
        assert!(cache.get::<String>("response:x").await.is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.get::<String>("response:x").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern_across_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(hybrid(&dir)).unwrap();

        cache.set("prefix_1", "value1", None).await;
        cache.set("prefix_2", &"z".repeat(4000), None).await; // disk
        cache.set("other_key", "value3", None).await;

        assert_eq!(cache.invalidate(Some("prefix_")).await, 2);
        assert!(cache.get::<String>("prefix_1").await.is_none());
        assert!(cache.get::<String>("prefix_2").await.is_none());
        assert_eq!(cache.get::<String>("other_key").await.as_deref(), Some("value3"));

        assert_eq!(cache.invalidate(None).await, 1);
        assert_eq!(cache.statistics().await.invalidations, 3);
    }

    #[tokio::test]
    async fn test_remove_is_exact() {
        let cache = CacheManager::new(CacheConfig::memory_only()).unwrap();
        cache.set("command:nix-env -q", "installed", None).await;
        cache.set("command:nix-env -qa firefox", "available", None).await;

        assert!(cache.remove("command:nix-env -q").await);
        assert!(!cache.remove("command:nix-env -q").await);
        assert!(cache.get::<String>("command:nix-env -qa firefox").await.is_some());
    }

    #[tokio::test]
    async fn test_type_mismatch_is_a_miss_and_removes_entry() {
        let cache = CacheManager::new(CacheConfig::memory_only()).unwrap();
        cache.set("k", &vec![1, 2, 3], None).await;

        assert!(cache.get::<String>("k").await.is_none());
        assert!(cache.get::<Vec<i32>>("k").await.is_none());

        let stats = cache.statistics().await;
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_corrupt_disk_row_is_a_miss_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::builder()
            .mode(CacheMode::Disk)
            .cache_dir(dir.path())
            .disk_timeout(Duration::from_secs(2))
            .build();
        let cache = CacheManager::new(config).unwrap();

        cache.set("response:broken", &"q".repeat(3000), None).await;
        cache
            .disk_tier()
            .unwrap()
            .raw_execute("UPDATE cache_entries SET value = X'DEADBEEF'")
            .unwrap();

        assert!(cache.get::<String>("response:broken").await.is_none());
        assert_eq!(cache.statistics().await.disk_entries, 0);
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::builder()
            .cache_dir(dir.path())
            .sweep_batch_size(2)
            .disk_timeout(Duration::from_secs(2))
            .build();
        let cache = CacheManager::new(config).unwrap();

        for i in 0..3 {
            cache
                .set(&format!("mem:{}", i), "v", Some(Duration::from_millis(20)))
                .await;
            cache
                .set(&format!("disk:{}", i), &"d".repeat(2000), Some(Duration::from_millis(20)))
                .await;
        }
        cache.set("keep", "v", None).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let report = cache.cleanup().await;
        assert_eq!(report.memory_removed, 3);
        assert_eq!(report.disk_removed, 3);

        let stats = cache.statistics().await;
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.expirations, 6);
    }

    #[tokio::test]
    async fn test_entries_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = CacheManager::new(hybrid(&dir)).unwrap();
            cache.set("command:nix-channel --list", &"c".repeat(3000), None).await;
        }

        let cache = CacheManager::new(hybrid(&dir)).unwrap();
        let value: Option<String> = cache.get("command:nix-channel --list").await;
        assert_eq!(value, Some("c".repeat(3000)));
    }

    #[tokio::test]
    async fn test_unbounded_ttl_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::builder()
            .mode(CacheMode::Disk)
            .cache_dir(dir.path())
            .disk_timeout(Duration::from_secs(2))
            .build();
        let cache = CacheManager::new(config).unwrap();

        cache.set("response:forever", "v", Some(Duration::MAX)).await;
        let value: Option<String> = cache.get("response:forever").await;
        assert_eq!(value.as_deref(), Some("v"));

        // Promotion in hybrid mode carries the same TTL into memory
        let cache = CacheManager::new(hybrid(&dir)).unwrap();
        let value: Option<String> = cache.get("response:forever").await;
        assert_eq!(value.as_deref(), Some("v"));
        assert_eq!(cache.statistics().await.memory_entries, 1);
        let value: Option<String> = cache.get("response:forever").await;
        assert_eq!(value.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_colliding_disk_row_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(hybrid(&dir)).unwrap();
        cache.set("response:big", &"b".repeat(4096), None).await;

        // Same hashed id, different logical key
        cache
            .disk_tier()
            .unwrap()
            .raw_execute("UPDATE cache_entries SET logical_key = 'response:other'")
            .unwrap();

        assert!(cache.get::<String>("response:big").await.is_none());
        let stats = cache.statistics().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.disk_entries, 1);
    }

    #[tokio::test]
    async fn test_size_bytes_ignores_compression() {
        let dir = tempfile::tempdir().unwrap();
        let payload = "z".repeat(4096);
        // JSON string: payload plus two quotes
        let encoded = payload.len() as u64 + 2;

        let memory = CacheManager::new(CacheConfig::memory_only()).unwrap();
        memory.set("response:big", &payload, None).await;

        let hybrid = CacheManager::new(hybrid(&dir)).unwrap();
        hybrid.set("response:big", &payload, None).await;

        let in_memory = memory.statistics().await;
        let on_disk = hybrid.statistics().await;
        assert_eq!(in_memory.memory_entries, 1);
        assert_eq!(on_disk.disk_entries, 1);
        assert_eq!(in_memory.size_bytes, encoded);
        assert_eq!(on_disk.size_bytes, encoded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_keep_accounting_exact() {
        let config = CacheConfig::builder()
            .disable_disk()
            .memory_budget_bytes(2_000)
            .build();
        let cache = Arc::new(CacheManager::new(config).unwrap());

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    let key = format!("k{}", (worker * 7 + i) % 40);
                    cache.set(&key, &"p".repeat(10 + i % 30), None).await;
                    let _: Option<String> = cache.get(&key).await;
                    if i % 13 == 0 {
                        cache.invalidate(Some("k1")).await;
                    }
                }
            }));
        }
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        let (tracked, actual) = cache.memory_accounting().await;
        assert_eq!(tracked, actual);
        assert!(tracked <= 2_000);

        let stats = cache.statistics().await;
        assert_eq!(stats.lookups(), 8 * 50);
    }
}
