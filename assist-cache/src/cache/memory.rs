//! In-memory tier with strict LRU eviction under a byte budget
//!
//! The tier itself is not synchronized; the manager wraps it in a
//! `tokio::sync::RwLock` so that insertion, eviction and the byte
//! accounting always change together under one write guard.

use crate::cache::entry::CacheEntry;
use crate::cache::types::{CacheKey, CacheValue};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Result of a memory lookup
#[derive(Debug)]
pub(crate) enum MemoryLookup {
    /// Live entry; payload plus its `compressed` flag
    Hit(CacheValue, bool),

    /// Entry was present but expired and has been removed
    Expired,

    /// No entry under this key
    Absent,
}

/// Result of an insertion
#[derive(Debug, Default)]
pub(crate) struct InsertOutcome {
    /// Whether the entry is now in memory
    pub stored: bool,

    /// Entries pushed out to make room, oldest first
    pub evicted: Vec<CacheEntry>,
}

/// Memory tier storage
#[derive(Debug)]
pub(crate) struct MemoryTier {
    /// Main storage: hashed key -> entry
    entries: HashMap<CacheKey, CacheEntry>,

    /// LRU tracking: front is least recently accessed
    lru_queue: VecDeque<CacheKey>,

    /// Sum of `size_bytes` over `entries`
    current_size_bytes: usize,

    /// Byte budget
    budget_bytes: usize,
}

impl MemoryTier {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru_queue: VecDeque::new(),
            current_size_bytes: 0,
            budget_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.current_size_bytes
    }

    /// Whether an entry of this size could ever fit
    pub fn fits_budget(&self, size_bytes: usize) -> bool {
        size_bytes <= self.budget_bytes
    }

    /// Look up an entry, touching it on a hit and dropping it if expired
    ///
    /// An entry stored under the same hash for a different logical key is
    /// left alone and reported as absent.
    pub fn get(&mut self, key: &str, logical_key: &str) -> MemoryLookup {
        let now = Utc::now();
        let expired = match self.entries.get(key) {
            None => return MemoryLookup::Absent,
            Some(entry) if entry.logical_key != logical_key => {
                debug!("Hash collision on {}; treating as miss", key);
                return MemoryLookup::Absent;
            }
            Some(entry) => entry.is_expired_at(now),
        };

        if expired {
            self.remove(key);
            return MemoryLookup::Expired;
        }

        let Some(entry) = self.entries.get_mut(key) else {
            return MemoryLookup::Absent;
        };
        entry.touch();
        let hit = MemoryLookup::Hit(entry.value.clone(), entry.metadata.compressed);
        self.mark_recent(key);
        hit
    }

    /// Insert or replace an entry, evicting least recently used entries
    /// until it fits. Entries larger than the whole budget are not stored.
    pub fn insert(&mut self, entry: CacheEntry) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();

        if !self.fits_budget(entry.size_bytes) {
            debug!(
                "Entry of {} bytes exceeds memory budget of {} bytes",
                entry.size_bytes, self.budget_bytes
            );
            return outcome;
        }

        // Replacing an entry frees its bytes first
        self.remove(&entry.key);

        while self.current_size_bytes + entry.size_bytes > self.budget_bytes {
            match self.lru_queue.pop_front() {
                Some(victim) => {
                    if let Some(evicted) = self.take(&victim) {
                        debug!("Evicting LRU entry: {}", evicted.logical_key);
                        outcome.evicted.push(evicted);
                    }
                }
                None => break,
            }
        }

        self.current_size_bytes += entry.size_bytes;
        self.lru_queue.push_back(entry.key.clone());
        self.entries.insert(entry.key.clone(), entry);
        outcome.stored = true;
        outcome
    }

    /// Remove an entry by hashed key
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.take(key)?;
        self.lru_queue.retain(|k| k != key);
        Some(entry)
    }

    /// Remove entries whose logical key contains `pattern`; `None` clears the tier
    pub fn remove_matching(&mut self, pattern: Option<&str>) -> usize {
        match pattern {
            None => {
                let count = self.entries.len();
                self.entries.clear();
                self.lru_queue.clear();
                self.current_size_bytes = 0;
                count
            }
            Some(pattern) => {
                let keys: Vec<CacheKey> = self
                    .entries
                    .values()
                    .filter(|entry| entry.logical_key.contains(pattern))
                    .map(|entry| entry.key.clone())
                    .collect();
                for key in &keys {
                    self.remove(key);
                }
                keys.len()
            }
        }
    }

    /// Hashed keys of expired entries
    pub fn expired_keys(&self) -> Vec<CacheKey> {
        let now = Utc::now();
        self.entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Remove the given keys if they are still expired; returns the count removed
    pub fn remove_expired(&mut self, keys: &[CacheKey]) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for key in keys {
            let still_expired = self
                .entries
                .get(key)
                .map(|entry| entry.is_expired_at(now))
                .unwrap_or(false);
            if still_expired && self.remove(key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Detach an entry from the map and the byte accounting (not the queue)
    fn take(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.current_size_bytes = self.current_size_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn mark_recent(&mut self, key: &str) {
        self.lru_queue.retain(|k| k != key);
        self.lru_queue.push_back(key.to_string());
    }

    #[cfg(test)]
    pub fn recomputed_size(&self) -> usize {
        self.entries.values().map(|e| e.size_bytes).sum()
    }
}
