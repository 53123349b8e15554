//! Explanation cache
//!
//! The same decision can be explained at several levels of detail, and
//! each level is cached independently. Detailed levels are costlier to
//! produce and live longer.

use crate::cache::manager::CacheManager;
use crate::cache::types::{hash_key, KeyCategory};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Computation times kept per (decision type, level)
const TIMING_WINDOW: usize = 100;

/// Detail level of an explanation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplanationLevel {
    Simple,
    Detailed,
    Technical,
}

impl ExplanationLevel {
    pub const ALL: [ExplanationLevel; 3] = [
        ExplanationLevel::Simple,
        ExplanationLevel::Detailed,
        ExplanationLevel::Technical,
    ];

    pub fn ttl(&self) -> Duration {
        match self {
            ExplanationLevel::Simple => Duration::from_secs(600),
            ExplanationLevel::Detailed | ExplanationLevel::Technical => Duration::from_secs(3600),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExplanationLevel::Simple => "simple",
            ExplanationLevel::Detailed => "detailed",
            ExplanationLevel::Technical => "technical",
        }
    }
}

impl fmt::Display for ExplanationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The decision being explained plus the context that shaped it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplanationRequest {
    pub decision_type: String,
    pub decision_value: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ExplanationRequest {
    pub fn new(decision_type: impl Into<String>, decision_value: impl Into<String>) -> Self {
        Self {
            decision_type: decision_type.into(),
            decision_value: decision_value.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(name.into(), value.into());
        self
    }

    fn context_hash(&self) -> String {
        let joined = self
            .context
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";");
        hash_key(&joined)
    }

    fn key(&self, level: ExplanationLevel) -> String {
        format!(
            "{}{}:{}:{}:{}",
            KeyCategory::Explanation.prefix(),
            self.decision_type,
            self.decision_value,
            level,
            self.context_hash()
        )
    }
}

/// A generated explanation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationValue {
    pub decision_type: String,
    pub decision_value: String,
    pub explanation: String,
    pub confidence: f64,
    pub level: ExplanationLevel,
    #[serde(default)]
    pub factors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExplanationCacheStats {
    pub hits: u64,
    pub misses: u64,

    /// Mean computation time in milliseconds, keyed `type:level`
    pub avg_computation_times: BTreeMap<String, f64>,

    /// Sum of mean computation times over all hits
    pub estimated_time_saved: Duration,
}

/// Cache for decision explanations
pub struct ExplanationCache {
    manager: Arc<CacheManager>,
    hits: AtomicU64,
    misses: AtomicU64,
    saved_micros: AtomicU64,
    timings: Mutex<HashMap<(String, ExplanationLevel), VecDeque<Duration>>>,
}

impl ExplanationCache {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self {
            manager,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            saved_micros: AtomicU64::new(0),
            timings: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        request: &ExplanationRequest,
        level: ExplanationLevel,
    ) -> Option<ExplanationValue> {
        match self.manager.get::<ExplanationValue>(&request.key(level)).await {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(avg) = self.average(&request.decision_type, level) {
                    self.saved_micros
                        .fetch_add(avg.as_micros() as u64, Ordering::Relaxed);
                }
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store an explanation at its own level
    ///
    /// `computation_time` only feeds the efficiency statistics.
    pub async fn set(
        &self,
        request: &ExplanationRequest,
        value: &ExplanationValue,
        computation_time: Option<Duration>,
    ) {
        let level = value.level;
        self.manager
            .set(&request.key(level), value, Some(level.ttl()))
            .await;

        if let Some(elapsed) = computation_time {
            self.record_timing(&request.decision_type, level, elapsed);
        }
        debug!(
            "Cached {} explanation for {}:{}",
            level, request.decision_type, request.decision_value
        );
    }

    pub async fn set_multi_level(
        &self,
        request: &ExplanationRequest,
        values: &[ExplanationValue],
        computation_time: Option<Duration>,
    ) {
        for value in values {
            self.set(request, value, computation_time).await;
        }
    }

    /// Cached explanations for the requested levels; missing levels are absent
    pub async fn get_multi_level(
        &self,
        request: &ExplanationRequest,
        levels: &[ExplanationLevel],
    ) -> BTreeMap<ExplanationLevel, ExplanationValue> {
        let mut found = BTreeMap::new();
        for &level in levels {
            if let Some(value) = self.get(request, level).await {
                found.insert(level, value);
            }
        }
        found
    }

    /// Drop every explanation for one decision type
    pub async fn invalidate_decision_type(&self, decision_type: &str) -> usize {
        let pattern = format!("{}{}:", KeyCategory::Explanation.prefix(), decision_type);
        self.manager.invalidate(Some(&pattern)).await
    }

    pub fn stats(&self) -> ExplanationCacheStats {
        let avg_computation_times = match self.timings.lock() {
            Ok(timings) => timings
                .iter()
                .filter_map(|((kind, level), samples)| {
                    mean(samples).map(|avg| (format!("{}:{}", kind, level), avg.as_secs_f64() * 1000.0))
                })
                .collect(),
            Err(_) => BTreeMap::new(),
        };

        ExplanationCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            avg_computation_times,
            estimated_time_saved: Duration::from_micros(self.saved_micros.load(Ordering::Relaxed)),
        }
    }

    fn record_timing(&self, decision_type: &str, level: ExplanationLevel, elapsed: Duration) {
        let Ok(mut timings) = self.timings.lock() else {
            return;
        };
        let samples = timings
            .entry((decision_type.to_string(), level))
            .or_default();
        samples.push_back(elapsed);
        while samples.len() > TIMING_WINDOW {
            samples.pop_front();
        }
    }

    fn average(&self, decision_type: &str, level: ExplanationLevel) -> Option<Duration> {
        let timings = self.timings.lock().ok()?;
        mean(timings.get(&(decision_type.to_string(), level))?)
    }
}

fn mean(samples: &VecDeque<Duration>) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    let total: Duration = samples.iter().sum();
    Some(total / samples.len() as u32)
}
