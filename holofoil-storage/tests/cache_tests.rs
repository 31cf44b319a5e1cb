use chrono::Duration;
use holofoil_storage::{
    CacheQuota, KvStore, MemoryKvStore, PluginCache, PluginStorage, SqliteKvStore,
};
use holofoil_types::{ManualClock, PluginId, PluginManifest};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;

fn pid(s: &str) -> PluginId {
    PluginId::parse(s).unwrap()
}

fn manifest(id: &str) -> PluginManifest {
    serde_json::from_value(json!({
        "id": id,
        "name": "Binder View",
        "version": "0.3.1",
        "capabilities": ["storage"]
    }))
    .unwrap()
}

fn sqlite_cache() -> (PluginCache, Arc<ManualClock>, Arc<SqliteKvStore>) {
    let store = Arc::new(SqliteKvStore::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::starting_now());
    (PluginCache::with_clock(store.clone(), clock.clone()), clock, store)
}

// ── Manifests ────────────────────────────────────────────────────

#[tokio::test]
async fn manifest_round_trips_until_ttl() {
    let (cache, clock, _) = sqlite_cache();
    let m = manifest("curated.binder-view");
    cache.cache_manifest(&m, Duration::hours(1)).await.unwrap();

    clock.advance(Duration::minutes(59));
    let hit = cache.get_cached_manifest(&m.id).await.unwrap().unwrap();
    assert_eq!(hit.manifest, m);
    assert_eq!(hit.expires_at - hit.stored_at, Duration::hours(1));

    clock.advance(Duration::minutes(2));
    assert!(cache.get_cached_manifest(&m.id).await.unwrap().is_none());
    assert_eq!(cache.clear_expired_manifests().await.unwrap(), 1);
    assert_eq!(cache.clear_expired_manifests().await.unwrap(), 0);
}

#[tokio::test]
async fn rewrite_refreshes_ttl() {
    let (cache, clock, _) = sqlite_cache();
    let m = manifest("curated.binder-view");
    cache.cache_manifest(&m, Duration::minutes(10)).await.unwrap();
    clock.advance(Duration::minutes(8));
    cache.cache_manifest(&m, Duration::minutes(10)).await.unwrap();
    clock.advance(Duration::minutes(8));

    assert!(cache.get_cached_manifest(&m.id).await.unwrap().is_some());
    assert_eq!(cache.clear_expired_manifests().await.unwrap(), 0);
}

#[tokio::test]
async fn delete_manifest_reports_existence() {
    let (cache, _, _) = sqlite_cache();
    let m = manifest("community.x");
    cache.cache_manifest(&m, Duration::days(1)).await.unwrap();
    assert!(cache.delete_cached_manifest(&m.id).await.unwrap());
    assert!(!cache.delete_cached_manifest(&m.id).await.unwrap());
}

// ── Assets ───────────────────────────────────────────────────────

#[tokio::test]
async fn asset_digest_mismatch_is_a_miss_and_deletes() {
    let (cache, _, store) = sqlite_cache();
    let id = pid("community.shimmer");
    let css = b".card { filter: hue-rotate(20deg); }";
    let good = hex::encode(Sha256::digest(css));
    cache
        .cache_asset(&id, "shimmer.css", css, Duration::days(1))
        .await
        .unwrap();

    let hit = cache
        .get_cached_asset(&id, "shimmer.css", Some(&good))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hit.bytes, css);
    assert_eq!(hit.sha256, good);

    let bad = "0".repeat(64);
    assert!(cache
        .get_cached_asset(&id, "shimmer.css", Some(&bad))
        .await
        .unwrap()
        .is_none());
    assert!(store.scan("plugin:").await.unwrap().is_empty());
}

// ── Stats and clears ─────────────────────────────────────────────

#[tokio::test]
async fn stats_group_by_plugin() {
    let (cache, clock, _) = sqlite_cache();
    let a = pid("community.a");
    let b = pid("community.b");
    cache.cache_manifest(&manifest("community.a"), Duration::days(1)).await.unwrap();
    cache.cache_asset(&a, "x.png", &[0; 100], Duration::days(1)).await.unwrap();
    cache.cache_config(&b, &json!({"k": 1}), Duration::seconds(1)).await.unwrap();
    clock.advance(Duration::seconds(5));

    let stats = cache.get_cache_stats().await.unwrap();
    assert_eq!(stats.total_records, 3);
    assert_eq!(stats.expired_records, 1);
    assert_eq!(stats.plugins["community.a"].manifests, 1);
    assert_eq!(stats.plugins["community.a"].assets, 1);
    assert!(stats.plugins["community.a"].bytes >= 100);
    assert_eq!(stats.plugins["community.b"].configs, 1);
    assert_eq!(stats.plugins["community.b"].expired, 1);
}

#[tokio::test]
async fn clear_plugin_cache_leaves_other_plugins_and_storage() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let cache = PluginCache::new(store.clone());
    let storage = PluginStorage::new(store.clone());
    let a = pid("community.a");
    let b = pid("community.b");

    cache.cache_config(&a, &json!(1), Duration::days(1)).await.unwrap();
    cache.cache_config(&b, &json!(2), Duration::days(1)).await.unwrap();
    storage.set(&a, "high-score", &json!(42), None).await.unwrap();

    assert_eq!(cache.clear_plugin_cache(&a).await.unwrap(), 1);
    assert!(cache.get_cached_config(&b).await.unwrap().is_some());
    assert_eq!(storage.get(&a, "high-score").await.unwrap(), Some(json!(42)));

    assert_eq!(cache.clear_all_plugin_cache().await.unwrap(), 1);
    assert_eq!(storage.get(&a, "high-score").await.unwrap(), Some(json!(42)));
}

// ── Maintenance ──────────────────────────────────────────────────

#[tokio::test]
async fn maintenance_evicts_oldest_first_per_plugin() {
    let (cache, clock, _) = sqlite_cache();
    let id = pid("community.art");
    for name in ["1.png", "2.png", "3.png"] {
        cache.cache_asset(&id, name, &[7; 400], Duration::days(1)).await.unwrap();
        clock.advance(Duration::seconds(1));
    }
    cache.cache_asset(&id, "old.png", &[1; 10], Duration::seconds(1)).await.unwrap();
    clock.advance(Duration::seconds(2));

    let quota = CacheQuota {
        default_per_plugin: Some(900),
        ..Default::default()
    };
    let report = cache.perform_cache_maintenance(&quota).await.unwrap();
    assert_eq!(report.expired_removed, 1);
    assert_eq!(report.evicted, 1);
    assert_eq!(report.bytes_freed, 410);

    assert!(cache.get_cached_asset(&id, "1.png", None).await.unwrap().is_none());
    assert!(cache.get_cached_asset(&id, "2.png", None).await.unwrap().is_some());
    assert!(cache.get_cached_asset(&id, "3.png", None).await.unwrap().is_some());
}

#[tokio::test]
async fn maintenance_applies_global_quota_across_plugins() {
    let (cache, clock, _) = sqlite_cache();
    let a = pid("community.a");
    let b = pid("community.b");
    cache.cache_asset(&a, "a.bin", &[0; 500], Duration::days(1)).await.unwrap();
    clock.advance(Duration::seconds(1));
    cache.cache_asset(&b, "b.bin", &[0; 500], Duration::days(1)).await.unwrap();

    let mut quota = CacheQuota {
        global: Some(600),
        ..Default::default()
    };
    quota.per_plugin.insert("community.b".into(), 10_000);
    let report = cache.perform_cache_maintenance(&quota).await.unwrap();

    assert_eq!(report.evicted, 1);
    assert!(cache.get_cached_asset(&a, "a.bin", None).await.unwrap().is_none());
    assert!(cache.get_cached_asset(&b, "b.bin", None).await.unwrap().is_some());
}

#[tokio::test]
async fn concurrent_writes_to_one_key_leave_one_record() {
    let store = Arc::new(MemoryKvStore::new());
    let cache = Arc::new(PluginCache::new(store.clone()));
    let id = pid("community.race");

    let mut handles = Vec::new();
    for i in 0..16 {
        let cache = Arc::clone(&cache);
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            cache.cache_config(&id, &json!({ "n": i }), Duration::days(1)).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(store.len().await, 1);
    let config = cache.get_cached_config(&id).await.unwrap().unwrap().config;
    assert!(config["n"].as_i64().unwrap() < 16);
}
