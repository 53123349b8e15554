//! Specialized caches built on [`CacheManager`](crate::cache::CacheManager)
//!
//! Each one owns its key derivation and the invariants of its value
//! type; none of them touch storage directly.

pub mod command;
pub mod explanation;
pub mod response;

pub use command::{
    CachedCommand, CommandCache, CommandCacheStats, CommandRequest, CommandValue,
    GenerationTracker, MutatingCommand, SafeCommand,
};
pub use explanation::{
    ExplanationCache, ExplanationCacheStats, ExplanationLevel, ExplanationRequest,
    ExplanationValue,
};
pub use response::{
    CachedResponse, ResponseCache, ResponseCacheStats, ResponseContext, ResponseRequest,
    ResponseValue,
};
