//! Demonstrates the cache layer end to end
//!
//! This example shows how to:
//! - Build a manager from `ASSIST_CACHE_*` settings
//! - Cache responses, command results and explanations
//! - Invalidate through system events and mutating commands
//! - Run the periodic maintenance sweep

use assist_cache::{
    CacheConfig, CacheEvent, CacheInvalidator, CacheManager, CommandCache, CommandRequest,
    CommandValue, ExplanationCache, ExplanationLevel, ExplanationRequest, ExplanationValue,
    GenerationTracker, MaintenanceTask, ResponseCache, ResponseContext, ResponseRequest,
    ResponseValue,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Keep the demo out of the user's real cache directory
    let scratch = std::env::temp_dir().join("assist-cache-demo");
    let config = CacheConfig {
        cache_dir: scratch.clone(),
        ..CacheConfig::from_env()?
    };

    println!("Cache directory: {}", scratch.display());
    let manager = Arc::new(CacheManager::new(config)?);
    let invalidator = Arc::new(CacheInvalidator::new(manager.clone()));
    let _sweep = MaintenanceTask::spawn(
        manager.clone(),
        Some(invalidator.clone()),
        Duration::from_secs(30),
    );

    // 1. Responses
    println!("\n1. Response cache");
    let responses = ResponseCache::new(manager.clone());
    let request = ResponseRequest::new("install firefox")
        .dry_run(true)
        .with_context(ResponseContext::new("maya", "demo-session"));
    responses
        .set(&request, &ResponseValue::ok("I'll install Firefox for you"))
        .await;

    let polite = ResponseRequest::new("Could you please install Firefox?")
        .dry_run(true)
        .with_context(ResponseContext::new("maya", "demo-session"));
    match responses.get(&polite).await {
        Some(response) => println!("   ✓ Rephrased query hit: {}", response.message),
        None => println!("   ✗ Rephrased query missed"),
    }

    // 2. Command results
    println!("\n2. Command cache");
    let generation = GenerationTracker::from_profile(Path::new(
        assist_cache::caches::command::SYSTEM_PROFILE,
    ));
    let commands = CommandCache::new(manager.clone(), generation);
    let list = CommandRequest::new("nix-env", &["-q"]);
    commands
        .set(
            &list,
            &CommandValue {
                success: true,
                output: "firefox-120.0\nvim-9.0".to_string(),
                exit_code: 0,
                duration_ms: 850,
                ..Default::default()
            },
        )
        .await;
    println!(
        "   Cached `nix-env -q` at generation {}",
        commands.generation().current()
    );

    let removed = commands.invalidate_by_command("nix-env -iA nixos.htop").await;
    println!(
        "   Install invalidated {} result(s); generation is now {}",
        removed,
        commands.generation().current()
    );
    println!("   Listing still cached: {}", commands.get(&list).await.is_some());

    // 3. Explanations
    println!("\n3. Explanation cache");
    let explanations = ExplanationCache::new(manager.clone());
    let decision = ExplanationRequest::new("package_selection", "firefox")
        .with_context("persona", "maya");
    for level in ExplanationLevel::ALL {
        let started = Instant::now();
        let value = ExplanationValue {
            decision_type: decision.decision_type.clone(),
            decision_value: decision.decision_value.clone(),
            explanation: format!("Firefox was chosen ({} view)", level),
            confidence: 0.85,
            level,
            factors: vec!["popularity".to_string(), "privacy".to_string()],
        };
        explanations
            .set(&decision, &value, Some(started.elapsed()))
            .await;
    }
    let levels = explanations
        .get_multi_level(&decision, &ExplanationLevel::ALL)
        .await;
    println!("   Cached levels: {:?}", levels.keys().collect::<Vec<_>>());

    // 4. Events
    println!("\n4. Invalidation events");
    let removed = invalidator
        .trigger_event(&CacheEvent::new("system_update").with_field("source", "demo"))
        .await;
    println!("   system_update removed {} entries", removed);
    for rule in invalidator.rules().await {
        println!(
            "   - {} [{}] triggered {} time(s)",
            rule.name, rule.strategy, rule.trigger_count
        );
    }

    println!("\n{}", manager.statistics().await);
    Ok(())
}
