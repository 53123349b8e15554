//! # assist-cache
//!
//! Caching and invalidation layer for a natural-language NixOS assistant.
//!
//! ## Features
//!
//! - Tiered store: memory LRU tier under a byte budget, SQLite disk tier
//! - Per-category TTLs inferred from logical key prefixes
//! - Response cache with query normalization and exact context matching
//! - Command-result cache restricted to read-only Nix queries and
//!   invalidated by system generation changes
//! - Explanation cache with independent detail levels
//! - Rule-based invalidator driven by system events and timers
//!
//! Cache failures never reach callers; the worst case is a miss.
//!
//! ## Quick Start
//!
//! ```no_run
//! use assist_cache::{
//!     CacheConfig, CacheEvent, CacheInvalidator, CacheManager, CommandCache, CommandRequest,
//!     CommandValue, GenerationTracker, MaintenanceTask,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = Arc::new(CacheManager::new(CacheConfig::from_env()?)?);
//!     let invalidator = Arc::new(CacheInvalidator::new(manager.clone()));
//!     let _sweep = MaintenanceTask::spawn_default(manager.clone(), Some(invalidator.clone()));
//!
//!     let commands = CommandCache::new(manager.clone(), GenerationTracker::new(42));
//!     let request = CommandRequest::new("nix-env", &["-q"]);
//!     let listing = CommandValue {
//!         success: true,
//!         output: "firefox-120.0".to_string(),
//!         ..Default::default()
//!     };
//!     commands.set(&request, &listing).await;
//!
//!     // A rebuild bumps the generation; the cached listing is now stale
//!     commands.invalidate_by_command("nixos-rebuild switch").await;
//!     assert!(commands.get(&request).await.is_none());
//!
//!     invalidator.trigger_event(&CacheEvent::new("package_install")).await;
//!     println!("{}", manager.statistics().await);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod caches;
pub mod error;

// Re-export main types for convenience
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheEntry, CacheEvent, CacheInvalidator, CacheKey,
    CacheManager, CacheMode, CacheStatistics, CacheValue, CategoryTtls, CleanupReport,
    EntryMetadata, InvalidationRecord, InvalidationRule, InvalidationStrategy, KeyCategory,
    MaintenanceTask, RuleSummary,
};
pub use caches::{
    CommandCache, CommandRequest, CommandValue, ExplanationCache, ExplanationLevel,
    ExplanationRequest, ExplanationValue, GenerationTracker, MutatingCommand, ResponseCache,
    ResponseContext, ResponseRequest, ResponseValue, SafeCommand,
};
pub use error::{CacheError, Result};
