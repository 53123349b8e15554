//! Integration tests for the cache layer
//!
//! These tests drive the public API end to end:
//! - Round trips and TTL expiry
//! - LRU eviction and hybrid demotion
//! - Generation-based command invalidation
//! - Event-driven invalidation and cascades
//! - Persistence across restarts and corrupt-row recovery
//! - Invalidation racing tier moves
//! - Statistics under concurrent callers

use assist_cache::{
    CacheConfig, CacheEvent, CacheInvalidator, CacheManager, CacheMode, CommandCache,
    CommandRequest, CommandValue, ExplanationCache, ExplanationLevel, ExplanationRequest,
    ExplanationValue, GenerationTracker, InvalidationRule, InvalidationStrategy, ResponseCache,
    ResponseRequest, ResponseValue,
};
use std::sync::Arc;
use std::time::Duration;

fn disk_config(dir: &tempfile::TempDir) -> CacheConfig {
    CacheConfig::builder()
        .mode(CacheMode::Hybrid)
        .cache_dir(dir.path())
        .disk_timeout(Duration::from_secs(2))
        .build()
}

fn listing(output: &str) -> CommandValue {
    CommandValue {
        success: true,
        output: output.to_string(),
        exit_code: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_basic_round_trip() {
    let cache = CacheManager::new(CacheConfig::memory_only()).unwrap();

    cache
        .set("response:install firefox", "Installing firefox", Some(Duration::from_secs(300)))
        .await;

    let value: Option<String> = cache.get("response:install firefox").await;
    assert_eq!(value.as_deref(), Some("Installing firefox"));

    let stats = cache.statistics().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.entry_count, 1);
}

#[tokio::test]
async fn test_expiry_after_ttl() {
    let cache = CacheManager::new(CacheConfig::memory_only()).unwrap();

    cache.set("k", "v", Some(Duration::from_secs(1))).await;
    assert!(cache.get::<String>("k").await.is_some());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(cache.get::<String>("k").await.is_none());
}

#[tokio::test]
async fn test_lru_eviction_respects_recency() {
    // 3 entries of 22 bytes fit, a fourth does not
    let config = CacheConfig::builder()
        .disable_disk()
        .memory_budget_bytes(70)
        .build();
    let cache = CacheManager::new(config).unwrap();
    let payload = "x".repeat(20);

    cache.set("key_0", &payload, None).await;
    cache.set("key_1", &payload, None).await;
    cache.set("key_2", &payload, None).await;

    // key_0 becomes most recent; key_1 is now the LRU entry
    assert!(cache.get::<String>("key_0").await.is_some());

    cache.set("key_3", &payload, None).await;

    assert!(cache.get::<String>("key_1").await.is_none());
    assert!(cache.get::<String>("key_0").await.is_some());
    assert!(cache.get::<String>("key_2").await.is_some());
    assert!(cache.get::<String>("key_3").await.is_some());

    let stats = cache.statistics().await;
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.entry_count, 3);
}

#[tokio::test]
async fn test_hybrid_demotion_is_lossless() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig::builder()
        .cache_dir(dir.path())
        .memory_budget_bytes(100)
        .disk_timeout(Duration::from_secs(2))
        .build();
    let cache = CacheManager::new(config).unwrap();

    for i in 0..10 {
        cache.set(&format!("response:q{}", i), &format!("answer {:02}", i), None).await;
    }

    for i in 0..10 {
        let value: Option<String> = cache.get(&format!("response:q{}", i)).await;
        assert_eq!(value, Some(format!("answer {:02}", i)));
    }

    let stats = cache.statistics().await;
    assert_eq!(stats.entry_count, 10);
    assert!(stats.evictions > 0);
    assert_eq!(stats.hits, 10);
}

#[tokio::test]
async fn test_generation_change_hides_command_results() {
    let manager = Arc::new(CacheManager::new(CacheConfig::memory_only()).unwrap());
    let commands = CommandCache::new(manager.clone(), GenerationTracker::new(42));
    let request = CommandRequest::new("nix-env", &["-q"]);

    commands.set(&request, &listing("firefox-120.0")).await;
    assert!(commands.get(&request).await.is_some());

    // Rebuild moves the system from generation 42 to 43
    commands.invalidate_by_command("sudo nixos-rebuild switch").await;
    assert_eq!(commands.generation().current(), 43);
    assert!(commands.get(&request).await.is_none());
}

#[tokio::test]
async fn test_generation_change_without_purge() {
    let manager = Arc::new(CacheManager::new(CacheConfig::memory_only()).unwrap());
    let tracker = GenerationTracker::new(42);
    let commands = CommandCache::new(manager.clone(), tracker.clone());
    let request = CommandRequest::new("nix-channel", &["--list"]);

    commands.set(&request, &listing("nixos https://nixos.org/channels/nixos-24.05")).await;

    // Generation observed from outside, TTL still far away
    tracker.set(43);
    assert!(commands.get(&request).await.is_none());
}

#[tokio::test]
async fn test_unsafe_commands_bypass_cache() {
    let manager = Arc::new(CacheManager::new(CacheConfig::memory_only()).unwrap());
    let commands = CommandCache::new(manager.clone(), GenerationTracker::new(1));

    let rm = CommandRequest::new("rm", &["-rf", "/tmp/test"]);
    assert!(!commands.set(&rm, &listing("")).await);
    assert!(commands.get(&rm).await.is_none());

    let install = CommandRequest::new("nix-env", &["-iA", "nixos.firefox"]);
    assert!(!commands.set(&install, &listing("installing")).await);
    assert_eq!(manager.statistics().await.entry_count, 0);
}

#[tokio::test]
async fn test_package_install_event_scenario() {
    let manager = Arc::new(CacheManager::new(CacheConfig::memory_only()).unwrap());
    let invalidator = CacheInvalidator::new(manager.clone());
    let responses = ResponseCache::new(manager.clone());

    responses
        .set(&ResponseRequest::new("list installed packages"), &ResponseValue::ok("firefox"))
        .await;
    responses
        .set(&ResponseRequest::new("what is a flake"), &ResponseValue::ok("A flake is..."))
        .await;

    let removed = invalidator
        .trigger_event(&CacheEvent::new("package_install").with_field("package", "firefox"))
        .await;
    assert_eq!(removed, 1);

    assert!(responses
        .get(&ResponseRequest::new("list installed packages"))
        .await
        .is_none());
    assert!(responses
        .get(&ResponseRequest::new("what is a flake"))
        .await
        .is_some());

    let history = invalidator.history().await;
    assert_eq!(history.last().unwrap().event.kind, "package_install");
    assert_eq!(history.last().unwrap().removed, 1);
}

#[tokio::test]
async fn test_config_change_event() {
    let manager = Arc::new(CacheManager::new(CacheConfig::memory_only()).unwrap());
    let invalidator = CacheInvalidator::new(manager.clone());
    let commands = CommandCache::new(manager.clone(), GenerationTracker::new(3));

    let option = CommandRequest::new("nixos-option", &["services.openssh.enable"]);
    let channels = CommandRequest::new("nix-channel", &["--list"]);
    commands.set(&option, &listing("true")).await;
    commands.set(&channels, &listing("nixos")).await;

    invalidator.trigger_event(&CacheEvent::new("config_change")).await;

    assert!(commands.get(&option).await.is_none());
    assert!(commands.get(&channels).await.is_some());
}

#[tokio::test]
async fn test_invalidation_cascade() {
    let manager = Arc::new(CacheManager::new(CacheConfig::memory_only()).unwrap());
    let invalidator = CacheInvalidator::new(manager.clone());
    invalidator
        .register_rule(
            InvalidationRule::new("explanations_follow_search", InvalidationStrategy::DependencyBased, |_| false)
                .with_patterns(["command:nix search"])
                .with_dependencies(["explanation:package_selection"]),
        )
        .await;

    let explanations = ExplanationCache::new(manager.clone());
    let request = ExplanationRequest::new("package_selection", "firefox");
    explanations
        .set(
            &request,
            &ExplanationValue {
                decision_type: "package_selection".to_string(),
                decision_value: "firefox".to_string(),
                explanation: "Most popular browser in nixpkgs".to_string(),
                confidence: 0.8,
                level: ExplanationLevel::Simple,
                factors: vec![],
            },
            None,
        )
        .await;
    manager.set("command:nix search nixpkgs firefox", "firefox-120.0", None).await;

    let removed = invalidator
        .invalidate_pattern("command:nix search", true)
        .await;
    assert_eq!(removed, 2);
    assert!(explanations.get(&request, ExplanationLevel::Simple).await.is_none());

    // Removing the rule does not bring anything back
    assert!(invalidator.remove_rule("explanations_follow_search").await);
    assert!(manager
        .get::<String>("command:nix search nixpkgs firefox")
        .await
        .is_none());
}

#[tokio::test]
async fn test_entries_persist_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let large = "p".repeat(4096);

    {
        let manager = Arc::new(CacheManager::new(disk_config(&dir)).unwrap());
        manager.set("response:explain flakes", &large, None).await;
        let commands = CommandCache::new(manager.clone(), GenerationTracker::new(42));
        commands
            .set(&CommandRequest::new("nix-channel", &["--list"]), &listing(&large))
            .await;
    }

    let manager = Arc::new(CacheManager::new(disk_config(&dir)).unwrap());
    let value: Option<String> = manager.get("response:explain flakes").await;
    assert_eq!(value, Some(large));

    // Restored rows still go through the generation check
    let commands = CommandCache::new(manager.clone(), GenerationTracker::new(43));
    assert!(commands
        .get(&CommandRequest::new("nix-channel", &["--list"]))
        .await
        .is_none());
}

#[tokio::test]
async fn test_unbounded_ttl_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let large = "t".repeat(4096);

    {
        let manager = CacheManager::new(disk_config(&dir)).unwrap();
        manager.set("response:forever", &large, Some(Duration::MAX)).await;
        manager.set("response:small", "s", Some(Duration::MAX)).await;
    }

    let manager = CacheManager::new(disk_config(&dir)).unwrap();
    let value: Option<String> = manager.get("response:forever").await;
    assert_eq!(value, Some(large));
    // Small entries only reach disk through demotion; this one never did
    assert!(manager.get::<String>("response:small").await.is_none());
}

#[tokio::test]
async fn test_corrupt_row_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir);
    let db_path = config.database_path();

    {
        let manager = CacheManager::new(config.clone()).unwrap();
        manager.set("response:big", &"b".repeat(4096), None).await;
    }

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute("UPDATE cache_entries SET metadata = 'not json'", [])
        .unwrap();
    drop(conn);

    let manager = CacheManager::new(config).unwrap();
    assert!(manager.get::<String>("response:big").await.is_none());
    assert_eq!(manager.statistics().await.disk_entries, 0);
}

#[tokio::test]
async fn test_cleanup_then_statistics() {
    let cache = CacheManager::new(CacheConfig::memory_only()).unwrap();

    for i in 0..5 {
        cache
            .set(&format!("system_info:{}", i), &i, Some(Duration::from_millis(50)))
            .await;
    }
    cache.set("response:keep", "v", None).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = cache.cleanup().await;
    assert_eq!(report.memory_removed, 5);
    assert_eq!(cache.statistics().await.entry_count, 1);
}

#[tokio::test]
async fn test_statistics_integrity() {
    let cache = Arc::new(CacheManager::new(CacheConfig::memory_only()).unwrap());
    assert_eq!(cache.statistics().await.hit_rate(), 0.0);

    cache.set("present", "v", None).await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            let key = if i % 2 == 0 { "present" } else { "absent" };
            cache.get::<String>(key).await.is_some()
        }));
    }
    let results = futures::future::join_all(tasks).await;
    let hits = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

    let stats = cache.statistics().await;
    assert_eq!(stats.hits + stats.misses, 20);
    assert_eq!(stats.hits as usize, hits);
    assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
}

fn small_hybrid(dir: &tempfile::TempDir, entries: usize) -> CacheConfig {
    // Each value below encodes to 42 bytes
    CacheConfig::builder()
        .mode(CacheMode::Hybrid)
        .cache_dir(dir.path())
        .memory_budget_bytes(entries * 42)
        .disk_timeout(Duration::from_secs(5))
        .build()
}

async fn assert_none_readable(cache: &CacheManager, prefix: &str, round: usize) {
    for i in 0..20 {
        let key = format!("{}:{:02}", prefix, i);
        assert!(
            cache.get::<String>(&key).await.is_none(),
            "round {}: {} readable after invalidation",
            round,
            key
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalidation_racing_demotion_is_final() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(CacheManager::new(small_hybrid(&dir, 20)).unwrap());
    let payload = "s".repeat(40);

    for round in 0..30 {
        cache.invalidate(None).await;
        for i in 0..20 {
            cache.set(&format!("stale:{:02}", i), &payload, None).await;
        }

        // Every fresh insert demotes one stale entry to disk
        let writer = {
            let cache = cache.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    cache.set(&format!("fresh:{:02}", i), &payload, None).await;
                }
            })
        };
        let invalidation = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.invalidate(Some("stale")).await })
        };
        writer.await.unwrap();
        invalidation.await.unwrap();

        assert_none_readable(&cache, "stale", round).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalidation_racing_promotion_is_final() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(CacheManager::new(small_hybrid(&dir, 5)).unwrap());
    let payload = "s".repeat(40);

    for round in 0..30 {
        cache.invalidate(None).await;
        // 15 of these end up on disk
        for i in 0..20 {
            cache.set(&format!("stale:{:02}", i), &payload, None).await;
        }

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    let _: Option<String> = cache.get(&format!("stale:{:02}", i)).await;
                }
            })
        };
        let invalidation = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.invalidate(Some("stale")).await })
        };
        reader.await.unwrap();
        invalidation.await.unwrap();

        assert_none_readable(&cache, "stale", round).await;
    }
}
