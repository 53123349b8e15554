//! # Tiered Cache Core
//!
//! Storage and invalidation machinery shared by the specialized caches.
//!
//! ## Features
//!
//! - **TTL-Based Expiration**: per-category defaults, checked on every read
//! - **Tiered Storage**: memory LRU tier backed by an SQLite disk tier
//! - **Promotion and Demotion**: small disk hits move to memory, LRU victims move to disk
//! - **Compression**: gzip for payloads above a size threshold
//! - **Rule-Based Invalidation**: event, time and pattern rules with one-level cascades
//! - **Bounded Latency**: disk access runs on the blocking pool under a timeout
//!
//! ## Example
//!
//! ```no_run
//! use assist_cache::cache::{CacheConfig, CacheManager};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CacheConfig::builder()
//!     .memory_budget_bytes(10 * 1024 * 1024) // 10 MB
//!     .response_ttl(Duration::from_secs(300))
//!     .build();
//!
//! let cache = CacheManager::new(config)?;
//!
//! cache.set("response:install firefox", "Installing firefox...", None).await;
//!
//! if let Some(value) = cache.get::<String>("response:install firefox").await {
//!     println!("Cache hit: {}", value);
//! }
//!
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod disk;
pub mod entry;
pub mod invalidation;
pub mod maintenance;
pub mod manager;
pub(crate) mod memory;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder, CacheMode, CategoryTtls};
pub use entry::{CacheEntry, EntryMetadata};
pub use invalidation::{
    default_rules, CacheEvent, CacheInvalidator, EventHandler, InvalidationRecord,
    InvalidationRule, InvalidationStrategy, RuleCondition, RuleSummary,
};
pub use maintenance::MaintenanceTask;
pub use manager::{CacheManager, CleanupReport};
pub use types::{hash_key, CacheKey, CacheStatistics, CacheValue, KeyCategory};
