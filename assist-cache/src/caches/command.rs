//! Command-result cache
//!
//! Only read-only Nix queries from a fixed allow-list are cached, and
//! only when they succeeded. Every cached result carries the system
//! generation it was produced under; a result from another generation
//! is discarded on read regardless of its TTL. Mutating commands purge
//! the patterns they affect and advance the tracked generation.

use crate::cache::manager::CacheManager;
use crate::cache::types::KeyCategory;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default NixOS system profile
pub const SYSTEM_PROFILE: &str = "/nix/var/nix/profiles/system";

fn tokens(command_line: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = command_line.split_whitespace().collect();
    if tokens.first() == Some(&"sudo") {
        tokens.remove(0);
    }
    tokens
}

fn starts_with_any(tokens: &[&str], forms: &[&str]) -> bool {
    forms.iter().any(|form| {
        let form: Vec<&str> = form.split(' ').collect();
        tokens.starts_with(&form)
    })
}

/// Read-only command forms whose results may be cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SafeCommand {
    ListInstalled,
    Search,
    ChannelList,
    OptionQuery,
    Evaluate,
}

impl SafeCommand {
    const ALL: [SafeCommand; 5] = [
        // Search before ListInstalled: `nix-env -qa` is not a listing
        SafeCommand::Search,
        SafeCommand::ListInstalled,
        SafeCommand::ChannelList,
        SafeCommand::OptionQuery,
        SafeCommand::Evaluate,
    ];

    fn forms(&self) -> &'static [&'static str] {
        match self {
            SafeCommand::ListInstalled => &[
                "nix-env -q",
                "nix-env --query",
                "nix profile list",
                "nix-store -q",
                "nix-store --query",
            ],
            SafeCommand::Search => &["nix search", "nix-env -qa", "nix-env -qaP"],
            SafeCommand::ChannelList => &["nix-channel --list"],
            SafeCommand::OptionQuery => &["nixos-option", "nix config show", "nix show-config"],
            SafeCommand::Evaluate => &["nix eval", "nix-instantiate --eval"],
        }
    }

    /// Classify a command line; `None` means it must never be cached
    pub fn classify(command_line: &str) -> Option<Self> {
        let tokens = tokens(command_line);
        Self::ALL
            .into_iter()
            .find(|kind| starts_with_any(&tokens, kind.forms()))
    }
}

/// Commands that change system state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutatingCommand {
    Install,
    Remove,
    Rebuild,
    ChannelUpdate,
    GarbageCollect,
}

const PACKAGE_LISTINGS: &[&str] = &[
    "command:nix-env -q",
    "command:nix-env --query",
    "command:nix profile list",
    "command:nix-store -q",
    "command:nix-store --query",
];

const REBUILD_TARGETS: &[&str] = &[
    "command:nix-env -q",
    "command:nix-env --query",
    "command:nix profile list",
    "command:nix-store -q",
    "command:nix-store --query",
    "command:nixos-option",
    "command:nix config show",
    "command:nix show-config",
    "command:nix eval",
    "command:nix-instantiate",
];

const CHANNEL_TARGETS: &[&str] = &[
    "command:nix-channel",
    "command:nix search",
    "command:nix-env -qa",
    "command:nixos-option",
    "command:nix eval",
    "command:nix-instantiate",
];

const GC_TARGETS: &[&str] = &[
    "command:nix-store -q",
    "command:nix-store --query",
    "command:nix-env -q",
    "command:nix profile list",
];

impl MutatingCommand {
    const ALL: [MutatingCommand; 5] = [
        MutatingCommand::Install,
        MutatingCommand::Remove,
        MutatingCommand::Rebuild,
        MutatingCommand::ChannelUpdate,
        MutatingCommand::GarbageCollect,
    ];

    fn forms(&self) -> &'static [&'static str] {
        match self {
            MutatingCommand::Install => &[
                "nix-env -i",
                "nix-env -iA",
                "nix-env --install",
                "nix-env -u",
                "nix-env --upgrade",
                "nix profile install",
                "nix profile upgrade",
            ],
            MutatingCommand::Remove => &["nix-env -e", "nix-env --uninstall", "nix profile remove"],
            MutatingCommand::Rebuild => &[
                "nixos-rebuild switch",
                "nixos-rebuild boot",
                "nixos-rebuild test",
                "home-manager switch",
            ],
            MutatingCommand::ChannelUpdate => &[
                "nix-channel --update",
                "nix-channel --add",
                "nix-channel --remove",
                "nix flake update",
            ],
            MutatingCommand::GarbageCollect => &["nix-collect-garbage", "nix-store --gc"],
        }
    }

    pub fn classify(command_line: &str) -> Option<Self> {
        let tokens = tokens(command_line);
        Self::ALL
            .into_iter()
            .find(|kind| starts_with_any(&tokens, kind.forms()))
    }

    /// Logical-key patterns purged when this command runs
    pub fn invalidation_patterns(&self) -> &'static [&'static str] {
        match self {
            MutatingCommand::Install | MutatingCommand::Remove => PACKAGE_LISTINGS,
            MutatingCommand::Rebuild => REBUILD_TARGETS,
            MutatingCommand::ChannelUpdate => CHANNEL_TARGETS,
            MutatingCommand::GarbageCollect => GC_TARGETS,
        }
    }
}

/// Parse `system-<N>-link` into `N`
pub fn parse_generation(link_name: &str) -> Option<u64> {
    link_name
        .strip_prefix("system-")?
        .strip_suffix("-link")?
        .parse()
        .ok()
}

/// Shared view of the current system generation
#[derive(Debug, Clone, Default)]
pub struct GenerationTracker {
    current: Arc<AtomicU64>,
}

impl GenerationTracker {
    pub fn new(generation: u64) -> Self {
        Self {
            current: Arc::new(AtomicU64::new(generation)),
        }
    }

    /// Read the generation a system profile symlink points at
    pub fn detect_from_profile(profile: &Path) -> Result<u64> {
        let target = std::fs::read_link(profile)?;
        target
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_generation)
            .ok_or_else(|| {
                CacheError::Other(format!(
                    "{} does not point at a system-N-link",
                    profile.display()
                ))
            })
    }

    /// Tracker seeded from a profile, starting at 0 if it cannot be read
    pub fn from_profile(profile: &Path) -> Self {
        match Self::detect_from_profile(profile) {
            Ok(generation) => Self::new(generation),
            Err(e) => {
                warn!("Could not detect system generation: {}", e);
                Self::new(0)
            }
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn set(&self, generation: u64) {
        let previous = self.current.swap(generation, Ordering::SeqCst);
        if previous != generation {
            info!("System generation changed: {} -> {}", previous, generation);
        }
    }

    /// Bump the generation; returns the new value
    pub fn advance(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Whole command line with whitespace collapsed
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .flat_map(str::split_whitespace)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Outcome of running a command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandValue {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    pub exit_code: i32,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Stored form of a command result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedCommand {
    pub result: CommandValue,
    pub generation: u64,
    pub command_line: String,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_generation: u64,
    pub rejected_unsafe: u64,
    pub current_generation: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_generation: AtomicU64,
    rejected_unsafe: AtomicU64,
}

/// Cache for read-only command results
pub struct CommandCache {
    manager: Arc<CacheManager>,
    generation: GenerationTracker,
    counters: Counters,
}

impl CommandCache {
    pub fn new(manager: Arc<CacheManager>, generation: GenerationTracker) -> Self {
        Self {
            manager,
            generation,
            counters: Counters::default(),
        }
    }

    pub fn generation(&self) -> &GenerationTracker {
        &self.generation
    }

    fn key(command_line: &str) -> String {
        format!("{}{}", KeyCategory::Command.prefix(), command_line)
    }

    pub fn is_cacheable(request: &CommandRequest) -> bool {
        SafeCommand::classify(&request.command_line()).is_some()
    }

    /// Cached result for a safe command produced under the current generation
    pub async fn get(&self, request: &CommandRequest) -> Option<CommandValue> {
        let line = request.command_line();
        if SafeCommand::classify(&line).is_none() {
            return None;
        }

        let key = Self::key(&line);
        let Some(cached) = self.manager.get::<CachedCommand>(&key).await else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let current = self.generation.current();
        if cached.generation != current {
            debug!(
                "Discarding result of '{}' from generation {} (now {})",
                line, cached.generation, current
            );
            self.manager.remove(&key).await;
            self.counters.stale_generation.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(cached.result)
    }

    /// Cache a result; returns whether it was accepted
    pub async fn set(&self, request: &CommandRequest, result: &CommandValue) -> bool {
        let line = request.command_line();
        if SafeCommand::classify(&line).is_none() {
            debug!("Refusing to cache non-allow-listed command: {}", line);
            self.counters.rejected_unsafe.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if !result.success {
            return false;
        }

        let cached = CachedCommand {
            result: result.clone(),
            generation: self.generation.current(),
            command_line: line.clone(),
            cached_at: Utc::now(),
        };
        self.manager.set(&Self::key(&line), &cached, None).await;
        true
    }

    /// React to a state-changing command
    ///
    /// Purges the patterns it affects and advances the generation.
    /// Returns the number of entries removed; non-mutating commands do nothing.
    pub async fn invalidate_by_command(&self, command_line: &str) -> usize {
        let Some(kind) = MutatingCommand::classify(command_line) else {
            return 0;
        };

        let mut removed = 0;
        for pattern in kind.invalidation_patterns() {
            removed += self.manager.invalidate(Some(pattern)).await;
        }
        let generation = self.generation.advance();

        info!(
            "{:?} command invalidated {} cached results (generation {})",
            kind, removed, generation
        );
        removed
    }

    pub fn stats(&self) -> CommandCacheStats {
        CommandCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_generation: self.counters.stale_generation.load(Ordering::Relaxed),
            rejected_unsafe: self.counters.rejected_unsafe.load(Ordering::Relaxed),
            current_generation: self.generation.current(),
        }
    }
}
