//! Cache entry management with TTL support

use crate::cache::types::{hash_key, CacheKey, CacheValue, KeyCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cache entry with TTL and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Hashed physical key
    pub key: CacheKey,

    /// Pre-hash logical key, kept for pattern invalidation
    pub logical_key: String,

    /// Serialized payload (compressed when `metadata.compressed`)
    pub value: CacheValue,

    /// When the entry was written
    pub created_at: DateTime<Utc>,

    /// Last access time (for LRU tracking)
    pub accessed_at: DateTime<Utc>,

    /// Number of successful reads
    pub access_count: u64,

    /// Estimated uncompressed payload size
    pub size_bytes: usize,

    /// Time-to-live measured from `created_at`
    pub ttl: Duration,

    /// Entry flags
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    /// Create a new entry for a logical key
    pub fn new(logical_key: impl Into<String>, value: CacheValue, ttl: Duration) -> Self {
        let logical_key = logical_key.into();
        let now = Utc::now();
        let size_bytes = value.len();

        Self {
            key: hash_key(&logical_key),
            metadata: EntryMetadata {
                category: Some(KeyCategory::infer(&logical_key)),
                ..Default::default()
            },
            logical_key,
            value,
            created_at: now,
            accessed_at: now,
            access_count: 0,
            size_bytes,
            ttl,
        }
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: EntryMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check if the entry has expired: `now - created_at > ttl`
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expiry check against an explicit clock reading
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - self.created_at > ttl,
            // TTL too large to represent never expires
            Err(_) => false,
        }
    }

    /// Mark the entry as accessed (updates access time and count)
    pub fn touch(&mut self) {
        self.accessed_at = Utc::now();
        self.access_count += 1;
    }

    /// Get the age of the entry
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Time left before expiry, `None` once expired
    pub fn time_until_expiration(&self) -> Option<Duration> {
        self.ttl.checked_sub(self.age())
    }
}

/// Flags recorded alongside a stored payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Payload is gzip-compressed
    #[serde(default)]
    pub compressed: bool,

    /// Category the TTL was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<KeyCategory>,

    /// Entry was moved into memory after a disk hit
    #[serde(default)]
    pub promoted: bool,

    /// Entry was moved to disk by memory pressure
    #[serde(default)]
    pub demoted: bool,
}
