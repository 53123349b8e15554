//! Response cache
//!
//! Caches assistant responses keyed on the query text, the execution
//! mode flags and a fingerprint of the caller context (persona and
//! session only). Every response is stored under the raw query and,
//! when it differs, under a normalized form with politeness phrases and
//! punctuation stripped, so rephrasings of a known query hit.

use crate::cache::manager::CacheManager;
use crate::cache::types::{hash_key, KeyCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// TTL for failed responses
pub const ERROR_RESPONSE_TTL: Duration = Duration::from_secs(60);

/// Phrases dropped during normalization, longest first
const POLITENESS_PHRASES: &[&str] = &[
    "i would like to",
    "i'd like to",
    "i want to",
    "could you",
    "can you",
    "would you",
    "will you",
    "thank you",
    "help me",
    "for me",
    "please",
    "kindly",
    "thanks",
];

/// Caller context fields that affect response correctness
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseContext {
    pub persona: Option<String>,
    pub session_id: Option<String>,
}

impl ResponseContext {
    pub fn new(persona: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            persona: Some(persona.into()),
            session_id: Some(session_id.into()),
        }
    }

    /// Pick the relevant fields out of a loose context map; everything else is ignored
    pub fn from_map(map: &serde_json::Map<String, serde_json::Value>) -> Self {
        let field = |name: &str| {
            map.get(name).and_then(|value| match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
        };

        Self {
            persona: field("persona"),
            session_id: field("session_id"),
        }
    }

    /// Stable hash of the context; equal contexts always agree
    pub fn fingerprint(&self) -> String {
        hash_key(&format!(
            "persona={}|session={}",
            self.persona.as_deref().unwrap_or(""),
            self.session_id.as_deref().unwrap_or("")
        ))
    }
}

/// A query as seen by the response pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRequest {
    pub query: String,
    pub dry_run: bool,
    pub execute: bool,
    pub context: ResponseContext,
}

impl ResponseRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn execute(mut self, execute: bool) -> Self {
        self.execute = execute;
        self
    }

    pub fn with_context(mut self, context: ResponseContext) -> Self {
        self.context = context;
        self
    }

    fn mode_tag(&self) -> &'static str {
        match (self.dry_run, self.execute) {
            (true, true) => "dry-exec",
            (true, false) => "dry",
            (false, true) => "exec",
            (false, false) => "plan",
        }
    }
}

/// A response produced by the assistant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseValue {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ResponseValue {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.success || self.error.is_some()
    }
}

/// Stored form of a response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub response: ResponseValue,
    pub context_hash: String,
    pub normalized_query: String,
    pub cached_at: DateTime<Utc>,
}

/// Response cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseCacheStats {
    pub raw_hits: u64,
    pub normalized_hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub variations_learned: usize,
}

impl ResponseCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.raw_hits + self.normalized_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    raw_hits: AtomicU64,
    normalized_hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

/// Lower-case and collapse whitespace
pub fn raw_form(query: &str) -> String {
    query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Raw form with punctuation and politeness phrases removed
///
/// Falls back to the raw form when nothing would be left.
pub fn normalize_query(query: &str) -> String {
    let raw = raw_form(query);
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || "-_./+'@".contains(c) {
                c
            } else {
                ' '
            }
        })
        .collect();

    let tokens: Vec<&str> = cleaned
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| c == '\'' || c == '.'))
        .filter(|t| !t.is_empty())
        .collect();

    let phrases: Vec<Vec<&str>> = POLITENESS_PHRASES
        .iter()
        .map(|p| p.split(' ').collect())
        .collect();

    let mut kept = Vec::with_capacity(tokens.len());
    let mut i = 0;
    'outer: while i < tokens.len() {
        for phrase in &phrases {
            if tokens[i..].starts_with(phrase) {
                i += phrase.len();
                continue 'outer;
            }
        }
        kept.push(tokens[i]);
        i += 1;
    }

    if kept.is_empty() {
        raw
    } else {
        kept.join(" ")
    }
}

fn ttl_for(response: &ResponseValue) -> Option<Duration> {
    if response.is_error() {
        Some(ERROR_RESPONSE_TTL)
    } else {
        None
    }
}

/// Cache for assistant responses
pub struct ResponseCache {
    manager: Arc<CacheManager>,
    counters: Counters,
    variations: Mutex<HashSet<String>>,
}

impl ResponseCache {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self {
            manager,
            counters: Counters::default(),
            variations: Mutex::new(HashSet::new()),
        }
    }

    fn key(text: &str, request: &ResponseRequest, context_hash: &str) -> String {
        format!(
            "{}{}#{}#{}",
            KeyCategory::Response.prefix(),
            text,
            request.mode_tag(),
            context_hash
        )
    }

    /// Look up a response, trying the raw query before its normalized form
    pub async fn get(&self, request: &ResponseRequest) -> Option<ResponseValue> {
        let context_hash = request.context.fingerprint();
        let raw = raw_form(&request.query);

        if let Some(response) = self.lookup(&raw, request, &context_hash).await {
            self.counters.raw_hits.fetch_add(1, Ordering::Relaxed);
            return Some(response);
        }

        let normalized = normalize_query(&request.query);
        if normalized != raw {
            if let Some(response) = self.lookup(&normalized, request, &context_hash).await {
                self.counters.normalized_hits.fetch_add(1, Ordering::Relaxed);
                self.learn_variation(&raw);
                debug!("Response hit via normalized query: {}", normalized);
                return Some(response);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a response under the raw and normalized query forms
    pub async fn set(&self, request: &ResponseRequest, response: &ResponseValue) {
        let context_hash = request.context.fingerprint();
        let raw = raw_form(&request.query);
        let normalized = normalize_query(&request.query);
        let ttl = ttl_for(response);

        let cached = CachedResponse {
            response: response.clone(),
            context_hash: context_hash.clone(),
            normalized_query: normalized.clone(),
            cached_at: Utc::now(),
        };

        self.manager
            .set(&Self::key(&raw, request, &context_hash), &cached, ttl)
            .await;
        if normalized != raw {
            self.manager
                .set(&Self::key(&normalized, request, &context_hash), &cached, ttl)
                .await;
            self.learn_variation(&raw);
        }

        self.counters.stores.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop every cached response
    pub async fn clear(&self) -> usize {
        self.manager
            .invalidate(Some(KeyCategory::Response.prefix()))
            .await
    }

    pub fn stats(&self) -> ResponseCacheStats {
        ResponseCacheStats {
            raw_hits: self.counters.raw_hits.load(Ordering::Relaxed),
            normalized_hits: self.counters.normalized_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            variations_learned: self
                .variations
                .lock()
                .map(|set| set.len())
                .unwrap_or_default(),
        }
    }

    async fn lookup(
        &self,
        text: &str,
        request: &ResponseRequest,
        context_hash: &str,
    ) -> Option<ResponseValue> {
        let cached: CachedResponse = self
            .manager
            .get(&Self::key(text, request, context_hash))
            .await?;

        // Context compatibility is exact
        if cached.context_hash != context_hash {
            return None;
        }
        Some(cached.response)
    }

    fn learn_variation(&self, raw: &str) {
        if let Ok(mut set) = self.variations.lock() {
            set.insert(raw.to_string());
        }
    }
}
