//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Physical key: fixed-length hash of a logical key
pub type CacheKey = String;

/// Stored payload: serialized (optionally compressed) bytes
pub type CacheValue = Vec<u8>;

/// Hex characters kept from the SHA-256 digest
const HASH_LEN: usize = 16;

/// Hash a logical key into the fixed-length physical identifier
pub fn hash_key(logical_key: &str) -> CacheKey {
    let digest = Sha256::digest(logical_key.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(HASH_LEN);
    id
}

/// Truncate a logical key for log lines
pub(crate) fn short_key(logical_key: &str) -> &str {
    match logical_key.char_indices().nth(50) {
        Some((idx, _)) => &logical_key[..idx],
        None => logical_key,
    }
}

/// Logical key category, inferred from the prefix before the first `:`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCategory {
    Response,
    Command,
    Explanation,
    SystemInfo,
}

impl KeyCategory {
    /// Infer the category of a logical key; unknown prefixes are responses
    pub fn infer(logical_key: &str) -> Self {
        let prefix = logical_key.split(':').next().unwrap_or_default();
        match prefix {
            "command" => KeyCategory::Command,
            "explanation" | "xai" => KeyCategory::Explanation,
            "system_info" | "system" => KeyCategory::SystemInfo,
            _ => KeyCategory::Response,
        }
    }

    /// Canonical key prefix including the separator
    pub fn prefix(&self) -> &'static str {
        match self {
            KeyCategory::Response => "response:",
            KeyCategory::Command => "command:",
            KeyCategory::Explanation => "explanation:",
            KeyCategory::SystemInfo => "system_info:",
        }
    }
}

impl fmt::Display for KeyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyCategory::Response => write!(f, "response"),
            KeyCategory::Command => write!(f, "command"),
            KeyCategory::Explanation => write!(f, "explanation"),
            KeyCategory::SystemInfo => write!(f, "system_info"),
        }
    }
}

/// Snapshot of cache performance counters
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheStatistics {
    /// Total number of cache hits
    pub hits: u64,

    /// Total number of cache misses
    pub misses: u64,

    /// Entries pushed out of a tier by its byte budget
    pub evictions: u64,

    /// Entries removed because their TTL elapsed
    pub expirations: u64,

    /// Entries removed by explicit invalidation
    pub invalidations: u64,

    /// Entries currently stored across both tiers
    pub entry_count: usize,

    /// Serialized payload bytes across both tiers, counted before
    /// compression in either tier
    pub size_bytes: u64,

    /// Entries in the memory tier
    pub memory_entries: usize,

    /// Rows in the disk tier
    pub disk_entries: usize,
}

impl CacheStatistics {
    /// Hit rate in `[0, 1]`; zero when no lookups happened
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Total lookups served
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

impl fmt::Display for CacheStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStatistics {{ hits: {}, misses: {}, hit_rate: {:.2}%, evictions: {}, invalidations: {}, entries: {}, size: {} bytes }}",
            self.hits,
            self.misses,
            self.hit_rate() * 100.0,
            self.evictions,
            self.invalidations,
            self.entry_count,
            self.size_bytes
        )
    }
}

/// Monotonic counters shared by concurrent callers
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
    pub invalidations: AtomicU64,
}

impl StatsCounters {
    pub fn add(counter: &AtomicU64, n: usize) {
        if n > 0 {
            counter.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CacheStatistics {
        CacheStatistics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_is_fixed_length_and_stable() {
        let a = hash_key("response:install firefox");
        let b = hash_key("response:install firefox");
        let c = hash_key("response:install vim");

        assert_eq!(a.len(), 16);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_category_inference() {
        assert_eq!(KeyCategory::infer("command:nix-env -q"), KeyCategory::Command);
        assert_eq!(KeyCategory::infer("explanation:intent:x"), KeyCategory::Explanation);
        assert_eq!(KeyCategory::infer("xai:intent"), KeyCategory::Explanation);
        assert_eq!(KeyCategory::infer("system_info:generation"), KeyCategory::SystemInfo);
        assert_eq!(KeyCategory::infer("response:help"), KeyCategory::Response);
        assert_eq!(KeyCategory::infer("no prefix here"), KeyCategory::Response);
        // Category words elsewhere in the key do not count
        assert_eq!(KeyCategory::infer("response:command help"), KeyCategory::Response);
    }

    #[test]
    fn test_statistics_hit_rate() {
        let stats = CacheStatistics {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < f64::EPSILON);
        assert_eq!(stats.lookups(), 100);
    }

    #[test]
    fn test_statistics_zero_requests() {
        let stats = CacheStatistics::default();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_statistics_display() {
        let stats = CacheStatistics {
            hits: 100,
            misses: 50,
            entry_count: 75,
            size_bytes: 1024,
            ..Default::default()
        };

        let display = format!("{}", stats);
        assert!(display.contains("hits: 100"));
        assert!(display.contains("misses: 50"));
        assert!(display.contains("66.67%"));
    }

    #[test]
    fn test_short_key() {
        let long = "x".repeat(80);
        assert_eq!(short_key(&long).len(), 50);
        assert_eq!(short_key("short"), "short");
    }
}
