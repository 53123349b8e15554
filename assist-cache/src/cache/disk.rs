//! SQLite-backed disk tier
//!
//! One table keyed by the hashed identifier. Rows carry the logical key
//! so pattern invalidation can match pre-hash keys, and an index on
//! `accessed_at` backs LRU eviction and sweeps.
//!
//! All methods are blocking; the manager runs them on the blocking pool
//! under a timeout.

use crate::cache::entry::{CacheEntry, EntryMetadata};
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// DDL for the disk tier
pub const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key           TEXT PRIMARY KEY,
    logical_key   TEXT NOT NULL,
    value         BLOB NOT NULL,
    created_at    REAL NOT NULL,
    accessed_at   REAL NOT NULL,
    access_count  INTEGER NOT NULL DEFAULT 0,
    size_bytes    INTEGER NOT NULL,
    ttl_seconds   REAL NOT NULL,
    metadata      TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_accessed_at
    ON cache_entries(accessed_at);
"#;

/// A raw row as stored on disk
#[derive(Debug, Clone)]
pub(crate) struct DiskRow {
    pub key: String,
    pub logical_key: String,
    pub value: Vec<u8>,
    pub created_at: f64,
    pub accessed_at: f64,
    pub access_count: i64,
    pub size_bytes: i64,
    pub ttl_seconds: f64,
    pub metadata: String,
}

impl DiskRow {
    /// Validate and convert into an entry
    pub fn into_entry(self) -> Result<CacheEntry> {
        let metadata: EntryMetadata = serde_json::from_str(&self.metadata)
            .map_err(|e| CacheError::Corrupt(format!("metadata: {}", e)))?;
        let created_at = from_epoch(self.created_at)
            .ok_or_else(|| CacheError::Corrupt(format!("created_at: {}", self.created_at)))?;
        let accessed_at = from_epoch(self.accessed_at)
            .ok_or_else(|| CacheError::Corrupt(format!("accessed_at: {}", self.accessed_at)))?;
        if !self.ttl_seconds.is_finite() || self.ttl_seconds < 0.0 {
            return Err(CacheError::Corrupt(format!("ttl_seconds: {}", self.ttl_seconds)));
        }
        if self.size_bytes < 0 || self.access_count < 0 {
            return Err(CacheError::Corrupt("negative counters".to_string()));
        }

        Ok(CacheEntry {
            key: self.key,
            logical_key: self.logical_key,
            value: self.value,
            created_at,
            accessed_at,
            access_count: self.access_count as u64,
            size_bytes: self.size_bytes as usize,
            // Beyond `Duration::MAX` the entry simply never expires
            ttl: Duration::try_from_secs_f64(self.ttl_seconds).unwrap_or(Duration::MAX),
            metadata,
        })
    }
}

/// Result of a disk lookup
#[derive(Debug)]
pub(crate) enum DiskLookup {
    /// Live row, already touched
    Found(DiskRow),

    /// Row was expired and has been deleted
    Expired,

    /// No row under this key
    Absent,
}

/// Disk tier handle; cheap to clone, connections are shared
#[derive(Debug, Clone)]
pub(crate) struct DiskTier {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    budget_bytes: u64,
}

impl DiskTier {
    /// Open or create the database at `path`
    ///
    /// A database that cannot be opened or initialized is deleted and
    /// recreated once.
    pub fn open(path: &Path, budget_bytes: u64, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = match Self::connect(path, busy_timeout) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Disk cache at {} unusable: {}; recreating", path.display(), e);
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Self::connect(path, busy_timeout)?
            }
        };

        info!(
            "Disk cache tier opened at {} (budget {} bytes)",
            path.display(),
            budget_bytes
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
            budget_bytes,
        })
    }

    fn connect(path: &Path, busy_timeout: Duration) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(CACHE_SCHEMA)?;
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CacheError::Other("disk tier lock poisoned".to_string()))
    }

    /// Look up a row; expired rows are deleted, live rows are touched
    pub fn fetch(&self, key: &str) -> Result<DiskLookup> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT key, logical_key, value, created_at, accessed_at, access_count,
                        size_bytes, ttl_seconds, metadata
                 FROM cache_entries WHERE key = ?1",
                params![key],
                |row| {
                    Ok(DiskRow {
                        key: row.get(0)?,
                        logical_key: row.get(1)?,
                        value: row.get(2)?,
                        created_at: row.get(3)?,
                        accessed_at: row.get(4)?,
                        access_count: row.get(5)?,
                        size_bytes: row.get(6)?,
                        ttl_seconds: row.get(7)?,
                        metadata: row.get(8)?,
                    })
                },
            )
            .optional();

        let mut row = match row {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(DiskLookup::Absent),
            Err(e) => {
                // Undecodable column types are a corrupt row, not a dead tier
                warn!("Unreadable disk row {}: {}; deleting", key, e);
                conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
                return Err(CacheError::Corrupt(e.to_string()));
            }
        };

        let now = to_epoch(Utc::now());
        if now - row.created_at > row.ttl_seconds {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            return Ok(DiskLookup::Expired);
        }

        conn.execute(
            "UPDATE cache_entries SET accessed_at = ?1, access_count = access_count + 1
             WHERE key = ?2",
            params![now, key],
        )?;
        row.accessed_at = now;
        row.access_count += 1;

        Ok(DiskLookup::Found(row))
    }

    /// Write an entry, then evict least recently accessed rows over budget
    ///
    /// Returns the number of rows evicted. Entries larger than the whole
    /// budget are not written.
    pub fn put(&self, entry: &CacheEntry) -> Result<usize> {
        let stored_len = entry.value.len() as u64;
        if stored_len > self.budget_bytes {
            debug!(
                "Entry of {} bytes exceeds disk budget of {} bytes",
                stored_len, self.budget_bytes
            );
            return Ok(0);
        }

        let metadata = serde_json::to_string(&entry.metadata)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries
                (key, logical_key, value, created_at, accessed_at, access_count,
                 size_bytes, ttl_seconds, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.key,
                entry.logical_key,
                entry.value,
                to_epoch(entry.created_at),
                to_epoch(entry.accessed_at),
                entry.access_count as i64,
                entry.size_bytes as i64,
                entry.ttl.as_secs_f64(),
                metadata,
            ],
        )?;

        Self::evict_over_budget(&conn, self.budget_bytes, &entry.key)
    }

    fn evict_over_budget(conn: &Connection, budget: u64, keep: &str) -> Result<usize> {
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(length(value)), 0) FROM cache_entries",
            [],
            |row| row.get(0),
        )?;
        let mut excess = (total.max(0) as u64).saturating_sub(budget);
        if excess == 0 {
            return Ok(0);
        }

        let mut victims = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT key, length(value) FROM cache_entries
                 WHERE key != ?1 ORDER BY accessed_at ASC",
            )?;
            let mut rows = stmt.query(params![keep])?;
            while let Some(row) = rows.next()? {
                if excess == 0 {
                    break;
                }
                let key: String = row.get(0)?;
                let len: i64 = row.get(1)?;
                excess = excess.saturating_sub(len.max(0) as u64);
                victims.push(key);
            }
        }

        for key in &victims {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        }
        if !victims.is_empty() {
            debug!("Evicted {} disk rows over budget", victims.len());
        }
        Ok(victims.len())
    }

    /// Delete one row
    pub fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    /// Delete rows whose logical key contains `pattern`; `None` deletes all
    pub fn delete_matching(&self, pattern: Option<&str>) -> Result<usize> {
        let conn = self.conn()?;
        let n = match pattern {
            None => conn.execute("DELETE FROM cache_entries", [])?,
            Some(pattern) => conn.execute(
                "DELETE FROM cache_entries WHERE instr(logical_key, ?1) > 0",
                params![pattern],
            )?,
        };
        Ok(n)
    }

    /// Delete at most `batch` expired rows
    pub fn purge_expired(&self, batch: usize) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM cache_entries WHERE key IN (
                SELECT key FROM cache_entries
                WHERE (?1 - created_at) > ttl_seconds
                LIMIT ?2
            )",
            params![to_epoch(Utc::now()), batch as i64],
        )?;
        Ok(n)
    }

    /// Row count and summed payload size
    ///
    /// Uses the uncompressed `size_bytes` column so the figure is in the
    /// same unit as the memory tier's accounting.
    pub fn totals(&self) -> Result<(usize, u64)> {
        let conn = self.conn()?;
        let (count, bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM cache_entries",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count.max(0) as usize, bytes.max(0) as u64))
    }

    #[cfg(test)]
    pub fn raw_execute(&self, sql: &str) -> Result<usize> {
        Ok(self.conn()?.execute(sql, [])?)
    }
}

/// Seconds since the Unix epoch with microsecond precision
pub(crate) fn to_epoch(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_micros() as f64 / 1_000_000.0
}

pub(crate) fn from_epoch(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let micros = (secs * 1_000_000.0).round() as i64;
    DateTime::from_timestamp(
        micros.div_euclid(1_000_000),
        (micros.rem_euclid(1_000_000) * 1_000) as u32,
    )
}
