//! Configuration for the cache system

use crate::cache::types::KeyCategory;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which storage tiers the manager uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Memory tier only; evicted entries are discarded
    Memory,

    /// Disk tier only
    Disk,

    /// Memory for small entries, disk for large ones and for demoted entries
    Hybrid,
}

impl CacheMode {
    /// Whether this mode reads and writes the disk tier
    pub fn uses_disk(&self) -> bool {
        matches!(self, CacheMode::Disk | CacheMode::Hybrid)
    }
}

impl std::str::FromStr for CacheMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(CacheMode::Memory),
            "disk" => Ok(CacheMode::Disk),
            "hybrid" => Ok(CacheMode::Hybrid),
            other => Err(CacheError::Config(format!("unknown cache mode: {}", other))),
        }
    }
}

/// Default time-to-live per key category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTtls {
    pub response: Duration,
    pub command: Duration,
    pub explanation: Duration,
    pub system_info: Duration,
}

impl Default for CategoryTtls {
    fn default() -> Self {
        Self {
            response: Duration::from_secs(300),
            command: Duration::from_secs(3600),
            explanation: Duration::from_secs(1800),
            system_info: Duration::from_secs(60),
        }
    }
}

impl CategoryTtls {
    /// TTL for a key category
    pub fn for_category(&self, category: KeyCategory) -> Duration {
        match category {
            KeyCategory::Response => self.response,
            KeyCategory::Command => self.command,
            KeyCategory::Explanation => self.explanation,
            KeyCategory::SystemInfo => self.system_info,
        }
    }
}

/// Configuration for the cache manager
///
/// Read once at startup and immutable for the lifetime of a manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Storage tiers in use
    pub mode: CacheMode,

    /// Byte budget of the memory tier
    pub memory_budget_bytes: usize,

    /// Byte budget of the disk tier
    pub disk_budget_bytes: u64,

    /// Directory holding the disk tier database
    pub cache_dir: PathBuf,

    /// Default TTLs by key category
    pub ttls: CategoryTtls,

    /// Compress payloads above `compression_threshold`
    pub enable_compression: bool,

    /// Payload size (bytes) above which entries are compressed and, in
    /// hybrid mode, routed to disk
    pub compression_threshold: usize,

    /// Upper bound for a single disk operation; slower operations count as misses
    pub disk_timeout: Duration,

    /// Interval of the periodic cleanup sweep
    pub sweep_interval: Duration,

    /// Maximum entries removed per lock acquisition during a sweep
    pub sweep_batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Hybrid,
            // 50 MB memory tier
            memory_budget_bytes: 50 * 1024 * 1024,
            // 500 MB disk tier
            disk_budget_bytes: 500 * 1024 * 1024,
            cache_dir: default_cache_dir(),
            ttls: CategoryTtls::default(),
            enable_compression: true,
            compression_threshold: 1024,
            disk_timeout: Duration::from_millis(250),
            sweep_interval: Duration::from_secs(300),
            sweep_batch_size: 500,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("assist-cache")
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Path of the SQLite database backing the disk tier
    pub fn database_path(&self) -> PathBuf {
        self.cache_dir.join("cache.db")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.memory_budget_bytes == 0 && self.mode != CacheMode::Disk {
            return Err(CacheError::Config(
                "memory_budget_bytes must be greater than 0".to_string(),
            ));
        }

        if self.mode.uses_disk() {
            if self.disk_budget_bytes == 0 {
                return Err(CacheError::Config(
                    "disk_budget_bytes must be greater than 0".to_string(),
                ));
            }
            if self.cache_dir.as_os_str().is_empty() {
                return Err(CacheError::Config("cache_dir must not be empty".to_string()));
            }
            if self.disk_timeout.is_zero() {
                return Err(CacheError::Config("disk_timeout must be non-zero".to_string()));
            }
        }

        if self.compression_threshold == 0 {
            return Err(CacheError::Config(
                "compression_threshold must be greater than 0".to_string(),
            ));
        }

        for (name, ttl) in [
            ("response", self.ttls.response),
            ("command", self.ttls.command),
            ("explanation", self.ttls.explanation),
            ("system_info", self.ttls.system_info),
        ] {
            if ttl.is_zero() {
                return Err(CacheError::Config(format!("{} TTL must be non-zero", name)));
            }
        }

        if self.sweep_batch_size == 0 {
            return Err(CacheError::Config(
                "sweep_batch_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Build a configuration from `ASSIST_CACHE_*` environment variables
    ///
    /// A `.env` file in the working directory is loaded first. Unset
    /// variables keep their defaults; unparsable ones are configuration
    /// errors.
    ///
    /// | variable | meaning |
    /// |---|---|
    /// | `ASSIST_CACHE_MODE` | `memory`, `disk` or `hybrid` |
    /// | `ASSIST_CACHE_DIR` | cache directory |
    /// | `ASSIST_CACHE_MEMORY_MB` | memory budget in MiB |
    /// | `ASSIST_CACHE_DISK_MB` | disk budget in MiB |
    /// | `ASSIST_CACHE_COMPRESSION` | `true` / `false` |
    /// | `ASSIST_CACHE_COMPRESSION_THRESHOLD` | bytes |
    /// | `ASSIST_CACHE_TTL_RESPONSE` etc. | seconds per category |
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(mode) = lookup("ASSIST_CACHE_MODE") {
            builder = builder.mode(mode.parse()?);
        }
        if let Some(dir) = lookup("ASSIST_CACHE_DIR") {
            builder = builder.cache_dir(dir);
        }
        if let Some(mb) = parse_var::<usize>(&lookup, "ASSIST_CACHE_MEMORY_MB")? {
            let bytes = mb.checked_mul(1024 * 1024).ok_or_else(|| {
                CacheError::Config(format!("ASSIST_CACHE_MEMORY_MB={} is too large", mb))
            })?;
            builder = builder.memory_budget_bytes(bytes);
        }
        if let Some(mb) = parse_var::<u64>(&lookup, "ASSIST_CACHE_DISK_MB")? {
            let bytes = mb.checked_mul(1024 * 1024).ok_or_else(|| {
                CacheError::Config(format!("ASSIST_CACHE_DISK_MB={} is too large", mb))
            })?;
            builder = builder.disk_budget_bytes(bytes);
        }
        if let Some(enabled) = parse_var::<bool>(&lookup, "ASSIST_CACHE_COMPRESSION")? {
            builder = builder.enable_compression(enabled);
        }
        if let Some(bytes) = parse_var::<usize>(&lookup, "ASSIST_CACHE_COMPRESSION_THRESHOLD")? {
            builder = builder.compression_threshold(bytes);
        }

        let mut ttls = CategoryTtls::default();
        for (var, slot) in [
            ("ASSIST_CACHE_TTL_RESPONSE", &mut ttls.response),
            ("ASSIST_CACHE_TTL_COMMAND", &mut ttls.command),
            ("ASSIST_CACHE_TTL_EXPLANATION", &mut ttls.explanation),
            ("ASSIST_CACHE_TTL_SYSTEM_INFO", &mut ttls.system_info),
        ] {
            if let Some(secs) = parse_var::<u64>(&lookup, var)? {
                *slot = Duration::from_secs(secs);
            }
        }

        let config = builder.ttls(ttls).build();
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CacheError::Config(format!("{}={:?}: {}", name, raw, e))),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    mode: Option<CacheMode>,
    memory_budget_bytes: Option<usize>,
    disk_budget_bytes: Option<u64>,
    cache_dir: Option<PathBuf>,
    ttls: Option<CategoryTtls>,
    enable_compression: Option<bool>,
    compression_threshold: Option<usize>,
    disk_timeout: Option<Duration>,
    sweep_interval: Option<Duration>,
    sweep_batch_size: Option<usize>,
}

impl CacheConfigBuilder {
    /// Set the storage mode
    pub fn mode(mut self, mode: CacheMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Use the memory tier only
    pub fn disable_disk(self) -> Self {
        self.mode(CacheMode::Memory)
    }

    /// Set the memory tier budget in bytes
    pub fn memory_budget_bytes(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = Some(bytes);
        self
    }

    /// Set the disk tier budget in bytes
    pub fn disk_budget_bytes(mut self, bytes: u64) -> Self {
        self.disk_budget_bytes = Some(bytes);
        self
    }

    /// Set the cache directory
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Set all category TTLs
    pub fn ttls(mut self, ttls: CategoryTtls) -> Self {
        self.ttls = Some(ttls);
        self
    }

    /// Set the default TTL of response entries
    pub fn response_ttl(mut self, ttl: Duration) -> Self {
        self.ttls.get_or_insert_with(CategoryTtls::default).response = ttl;
        self
    }

    /// Set the default TTL of command entries
    pub fn command_ttl(mut self, ttl: Duration) -> Self {
        self.ttls.get_or_insert_with(CategoryTtls::default).command = ttl;
        self
    }

    /// Enable or disable compression
    pub fn enable_compression(mut self, enable: bool) -> Self {
        self.enable_compression = Some(enable);
        self
    }

    /// Set the compression / disk routing threshold in bytes
    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = Some(bytes);
        self
    }

    /// Set the per-operation disk timeout
    pub fn disk_timeout(mut self, timeout: Duration) -> Self {
        self.disk_timeout = Some(timeout);
        self
    }

    /// Set the sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Set the sweep batch size
    pub fn sweep_batch_size(mut self, size: usize) -> Self {
        self.sweep_batch_size = Some(size);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            mode: self.mode.unwrap_or(defaults.mode),
            memory_budget_bytes: self
                .memory_budget_bytes
                .unwrap_or(defaults.memory_budget_bytes),
            disk_budget_bytes: self.disk_budget_bytes.unwrap_or(defaults.disk_budget_bytes),
            cache_dir: self.cache_dir.unwrap_or(defaults.cache_dir),
            ttls: self.ttls.unwrap_or(defaults.ttls),
            enable_compression: self
                .enable_compression
                .unwrap_or(defaults.enable_compression),
            compression_threshold: self
                .compression_threshold
                .unwrap_or(defaults.compression_threshold),
            disk_timeout: self.disk_timeout.unwrap_or(defaults.disk_timeout),
            sweep_interval: self.sweep_interval.unwrap_or(defaults.sweep_interval),
            sweep_batch_size: self.sweep_batch_size.unwrap_or(defaults.sweep_batch_size),
        }
    }
}

/// Preset configurations
impl CacheConfig {
    /// Memory tier only, nothing touches the filesystem
    pub fn memory_only() -> Self {
        Self {
            mode: CacheMode::Memory,
            ..Default::default()
        }
    }

    /// Configuration for memory-constrained environments
    pub fn small() -> Self {
        Self {
            memory_budget_bytes: 5 * 1024 * 1024,
            disk_budget_bytes: 50 * 1024 * 1024,
            ..Default::default()
        }
    }
}
