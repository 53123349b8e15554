//! Rule-based cache invalidation
//!
//! Rules react to system events (package installs, rebuilds, config
//! edits) or to elapsed time, and purge the logical-key patterns they
//! name through the [`CacheManager`]. Each pattern may declare dependent
//! patterns that are purged with it; cascades are one level deep.

use crate::cache::manager::CacheManager;
use crate::cache::types::short_key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Records kept in the invalidation history
const HISTORY_CAPACITY: usize = 1000;

/// Pattern meaning "every entry"
const ALL_ENTRIES: &str = "*";

/// Something that happened to the system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEvent {
    /// Event type, e.g. `package_install`
    #[serde(rename = "type")]
    pub kind: String,

    /// Free-form event fields
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl CacheEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

/// How a rule is triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidationStrategy {
    /// Fires from `check_time_based_rules` once `interval` has elapsed
    TimeBased { interval: Duration },

    /// Fires from `trigger_event` when its condition holds
    EventBased,

    /// Bookkeeping for direct pattern invalidations
    PatternBased,

    /// Bookkeeping for cascaded invalidations
    DependencyBased,
}

impl fmt::Display for InvalidationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationStrategy::TimeBased { interval } => {
                write!(f, "time-based ({}s)", interval.as_secs())
            }
            InvalidationStrategy::EventBased => write!(f, "event-based"),
            InvalidationStrategy::PatternBased => write!(f, "pattern-based"),
            InvalidationStrategy::DependencyBased => write!(f, "dependency-based"),
        }
    }
}

/// Predicate deciding whether an event triggers a rule
pub type RuleCondition = Arc<dyn Fn(&CacheEvent) -> bool + Send + Sync>;

/// Observer notified after an event has been processed
pub type EventHandler = Arc<dyn Fn(&CacheEvent) -> anyhow::Result<()> + Send + Sync>;

/// A named invalidation rule
#[derive(Clone)]
pub struct InvalidationRule {
    pub name: String,
    pub strategy: InvalidationStrategy,
    pub condition: RuleCondition,

    /// Logical-key substrings purged when the rule fires
    pub patterns: Vec<String>,

    /// Patterns purged along with any of `patterns`
    pub dependencies: Vec<String>,

    pub registered_at: DateTime<Utc>,
    pub last_triggered: Option<DateTime<Utc>>,
    pub trigger_count: u64,
}

impl InvalidationRule {
    pub fn new(
        name: impl Into<String>,
        strategy: InvalidationStrategy,
        condition: impl Fn(&CacheEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            strategy,
            condition: Arc::new(condition),
            patterns: Vec::new(),
            dependencies: Vec::new(),
            registered_at: Utc::now(),
            last_triggered: None,
            trigger_count: 0,
        }
    }

    /// Event-based rule matching any of the given event types
    pub fn on_events(name: impl Into<String>, event_types: &[&str]) -> Self {
        let types: Vec<String> = event_types.iter().map(|t| t.to_string()).collect();
        Self::new(name, InvalidationStrategy::EventBased, move |event| {
            types.iter().any(|t| *t == event.kind)
        })
    }

    /// Rule fired purely by elapsed time
    pub fn every(name: impl Into<String>, interval: Duration) -> Self {
        Self::new(name, InvalidationStrategy::TimeBased { interval }, |_| false)
    }

    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn matches(&self, event: &CacheEvent) -> bool {
        self.strategy == InvalidationStrategy::EventBased && (self.condition)(event)
    }

    /// Whether a time-based rule is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let InvalidationStrategy::TimeBased { interval } = self.strategy else {
            return false;
        };
        let Ok(interval) = chrono::Duration::from_std(interval) else {
            return false;
        };
        now - self.last_triggered.unwrap_or(self.registered_at) >= interval
    }

    fn mark_triggered(&mut self, now: DateTime<Utc>) {
        self.trigger_count += 1;
        self.last_triggered = Some(now);
    }

    fn summary(&self) -> RuleSummary {
        RuleSummary {
            name: self.name.clone(),
            strategy: self.strategy.to_string(),
            patterns: self.patterns.clone(),
            dependencies: self.dependencies.clone(),
            trigger_count: self.trigger_count,
            last_triggered: self.last_triggered,
        }
    }
}

impl fmt::Debug for InvalidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationRule")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("patterns", &self.patterns)
            .field("dependencies", &self.dependencies)
            .field("trigger_count", &self.trigger_count)
            .field("last_triggered", &self.last_triggered)
            .finish()
    }
}

/// Read-only view of a registered rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSummary {
    pub name: String,
    pub strategy: String,
    pub patterns: Vec<String>,
    pub dependencies: Vec<String>,
    pub trigger_count: u64,
    pub last_triggered: Option<DateTime<Utc>>,
}

/// One processed event
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationRecord {
    pub id: Uuid,
    pub event: CacheEvent,
    pub rules_triggered: Vec<String>,
    pub removed: usize,
    pub timestamp: DateTime<Utc>,
}

/// Rule set that ships with every invalidator
pub fn default_rules() -> Vec<InvalidationRule> {
    vec![
        InvalidationRule::on_events("system_update", &["system_update"]).with_patterns([ALL_ENTRIES]),
        InvalidationRule::on_events("package_change", &["package_install", "package_remove"])
            .with_patterns(["list", "installed", "search", "nix-env -q", "nix profile list"]),
        InvalidationRule::on_events("config_change", &["config_change"])
            .with_patterns(["option", "config"]),
        InvalidationRule::on_events("error_patterns", &["error_pattern_update"])
            .with_patterns(["explanation:error_"]),
        InvalidationRule::every("system_info_refresh", Duration::from_secs(300))
            .with_patterns(["system_info:"]),
    ]
}

/// Pattern -> dependent patterns, deduplicated
fn build_dependency_graph(rules: &[InvalidationRule]) -> HashMap<String, Vec<String>> {
    let mut graph: HashMap<String, Vec<String>> = HashMap::new();
    for rule in rules {
        for pattern in &rule.patterns {
            let deps = graph.entry(pattern.clone()).or_default();
            for dep in &rule.dependencies {
                if dep != pattern && !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
        }
    }
    graph.retain(|_, deps| !deps.is_empty());
    graph
}

/// Event- and time-driven invalidation engine
pub struct CacheInvalidator {
    manager: Arc<CacheManager>,
    rules: RwLock<Vec<InvalidationRule>>,
    dependency_graph: RwLock<HashMap<String, Vec<String>>>,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    history: RwLock<VecDeque<InvalidationRecord>>,
}

impl CacheInvalidator {
    /// Invalidator with the default rule set
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self::with_rules(manager, default_rules())
    }

    pub fn with_rules(manager: Arc<CacheManager>, rules: Vec<InvalidationRule>) -> Self {
        let graph = build_dependency_graph(&rules);
        Self {
            manager,
            rules: RwLock::new(rules),
            dependency_graph: RwLock::new(graph),
            handlers: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// Add a rule, replacing any existing rule with the same name
    pub async fn register_rule(&self, rule: InvalidationRule) {
        let mut rules = self.rules.write().await;
        rules.retain(|r| r.name != rule.name);
        info!("Registered invalidation rule: {} ({})", rule.name, rule.strategy);
        rules.push(rule);
        *self.dependency_graph.write().await = build_dependency_graph(&rules);
    }

    /// Drop a rule; entries it already removed stay removed
    pub async fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.name != name);
        let removed = rules.len() != before;
        if removed {
            *self.dependency_graph.write().await = build_dependency_graph(&rules);
            info!("Removed invalidation rule: {}", name);
        }
        removed
    }

    pub async fn rules(&self) -> Vec<RuleSummary> {
        self.rules.read().await.iter().map(InvalidationRule::summary).collect()
    }

    /// Observe events of one type; handler errors are logged and ignored
    pub async fn register_handler<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&CacheEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .await
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Run every matching event-based rule; returns entries removed
    pub async fn trigger_event(&self, event: &CacheEvent) -> usize {
        let matched: Vec<(String, Vec<String>)> = self
            .rules
            .read()
            .await
            .iter()
            .filter(|rule| rule.matches(event))
            .map(|rule| (rule.name.clone(), rule.patterns.clone()))
            .collect();

        let mut removed = 0;
        for (_, patterns) in &matched {
            for pattern in patterns {
                removed += self.invalidate_pattern(pattern, true).await;
            }
        }

        let now = Utc::now();
        let rules_triggered: Vec<String> = matched.into_iter().map(|(name, _)| name).collect();
        {
            let mut rules = self.rules.write().await;
            for rule in rules.iter_mut() {
                if rules_triggered.contains(&rule.name) {
                    rule.mark_triggered(now);
                }
            }
        }

        if !rules_triggered.is_empty() {
            info!(
                "Event '{}' triggered {:?}, removed {} entries",
                event.kind, rules_triggered, removed
            );
        }

        self.record(event.clone(), rules_triggered, removed, now).await;
        self.notify(event).await;
        removed
    }

    /// Purge one pattern and, when `cascade`, its declared dependents
    pub async fn invalidate_pattern(&self, pattern: &str, cascade: bool) -> usize {
        let mut removed = self.purge(pattern).await;

        if cascade {
            let dependents = self
                .dependency_graph
                .read()
                .await
                .get(pattern)
                .cloned()
                .unwrap_or_default();
            for dependent in dependents {
                debug!("Cascading invalidation {} -> {}", short_key(pattern), dependent);
                removed += self.purge(&dependent).await;
            }
        }

        let now = Utc::now();
        for rule in self.rules.write().await.iter_mut() {
            let tracks_patterns = matches!(
                rule.strategy,
                InvalidationStrategy::PatternBased | InvalidationStrategy::DependencyBased
            );
            if tracks_patterns && rule.patterns.iter().any(|p| p == pattern) {
                rule.mark_triggered(now);
            }
        }

        removed
    }

    /// Fire time-based rules whose interval has elapsed
    pub async fn check_time_based_rules(&self) -> usize {
        let now = Utc::now();
        let due: Vec<(String, Vec<String>)> = self
            .rules
            .read()
            .await
            .iter()
            .filter(|rule| rule.is_due(now))
            .map(|rule| (rule.name.clone(), rule.patterns.clone()))
            .collect();

        if due.is_empty() {
            return 0;
        }

        let mut removed = 0;
        for (_, patterns) in &due {
            for pattern in patterns {
                removed += self.invalidate_pattern(pattern, true).await;
            }
        }

        let names: Vec<String> = due.into_iter().map(|(name, _)| name).collect();
        for rule in self.rules.write().await.iter_mut() {
            if names.contains(&rule.name) {
                rule.mark_triggered(now);
            }
        }

        debug!("Time-based rules {:?} removed {} entries", names, removed);
        let event = CacheEvent::new("time_based").with_field("rules", names.clone());
        self.record(event, names, removed, now).await;
        removed
    }

    /// Processed events, oldest first
    pub async fn history(&self) -> Vec<InvalidationRecord> {
        self.history.read().await.iter().cloned().collect()
    }

    async fn purge(&self, pattern: &str) -> usize {
        if pattern == ALL_ENTRIES {
            self.manager.invalidate(None).await
        } else {
            self.manager.invalidate(Some(pattern)).await
        }
    }

    async fn record(
        &self,
        event: CacheEvent,
        rules_triggered: Vec<String>,
        removed: usize,
        timestamp: DateTime<Utc>,
    ) {
        let mut history = self.history.write().await;
        history.push_back(InvalidationRecord {
            id: Uuid::new_v4(),
            event,
            rules_triggered,
            removed,
            timestamp,
        });
        while history.len() > HISTORY_CAPACITY {
            history.pop_front();
        }
    }

    async fn notify(&self, event: &CacheEvent) {
        let handlers = self
            .handlers
            .read()
            .await
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            if let Err(e) = handler(event) {
                warn!("Invalidation handler for '{}' failed: {}", event.kind, e);
            }
        }
    }
}
