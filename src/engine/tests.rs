use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::control::CacheControl;
use crate::dump::{truncate_to_micros, DumpError, DumpManager, DumpReader, DumpWriter};

use super::*;

/// A small key-less domain cache: its whole state is one payload string.
#[derive(Default)]
struct TestCache {
    payload: Mutex<String>,
    calls: Mutex<Vec<(UpdateType, Option<DateTime<Utc>>)>>,
    fail_updates: AtomicBool,
    modify_updates: AtomicBool,
}

impl TestCache {
    fn new() -> Arc<Self> {
        let cache = TestCache::default();
        cache.modify_updates.store(true, Ordering::Relaxed);
        Arc::new(cache)
    }

    fn calls(&self) -> Vec<(UpdateType, Option<DateTime<Utc>>)> {
        self.calls.lock().clone()
    }
}

impl CacheOperations for TestCache {
    fn update<'a>(
        &'a self,
        update_type: UpdateType,
        last_update: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        context: &'a UpdateContext<'a>,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.calls.lock().push((update_type, last_update));
            if self.fail_updates.load(Ordering::Relaxed) {
                anyhow::bail!("upstream is unavailable");
            }
            if self.modify_updates.load(Ordering::Relaxed) {
                *self.payload.lock() = format!("payload@{}", now.timestamp_micros());
                context.on_cache_modified();
            }
            context.add_documents_read(1);
            context.set_documents_count(1);
            Ok(())
        })
    }

    fn write_dump<'a>(
        &'a self,
        writer: &'a mut DumpWriter,
    ) -> BoxFuture<'a, Result<(), DumpError>> {
        Box::pin(async move {
            let payload = self.payload.lock().clone();
            if payload.is_empty() {
                return Err(DumpError::EmptyCache);
            }
            writer.write_all(payload.as_bytes()).await
        })
    }

    fn read_dump<'a>(&'a self, reader: &'a mut DumpReader) -> BoxFuture<'a, Result<(), DumpError>> {
        Box::pin(async move {
            let mut contents = Vec::new();
            reader.read_to_end(&mut contents).await?;
            let payload = String::from_utf8(contents)
                .map_err(|err| DumpError::Malformed(err.to_string()))?;
            *self.payload.lock() = payload;
            Ok(())
        })
    }
}

fn test_config(root: &Path) -> CacheConfig {
    let mut config = CacheConfig::from_yaml("{update-interval: 1h}").unwrap();
    config.dump_root = root.join("dumps");
    config
}

async fn start_engine(
    cache: &Arc<TestCache>,
    config: CacheConfig,
    control: &Arc<CacheControl>,
) -> anyhow::Result<CacheEngine> {
    CacheEngine::start(
        Arc::clone(cache) as Arc<dyn CacheOperations>,
        config,
        Arc::clone(control),
        "test-cache",
        tokio::runtime::Handle::current(),
        StartFlags::default(),
    )
    .await
}

async fn seed_dump(config: &CacheConfig, time: DateTime<Utc>, contents: &[u8]) {
    let manager = DumpManager::new(config, "test-cache");
    let stats = manager.register_new_dump(time).unwrap();
    let mut writer = DumpWriter::create(stats.full_path).await.unwrap();
    writer.write_all(contents).await.unwrap();
    writer.finish().await.unwrap();
}

/// Runs one periodic tick by hand, without waiting for the schedule.
async fn tick(engine: &CacheEngine) -> anyhow::Result<()> {
    driver::do_periodic_update(&engine.inner).await
}

/// Waits for the in-flight dump task, if any.
async fn join_dump_task(engine: &CacheEngine) {
    let task = engine.inner.update_state.lock().await.dump_task.take();
    if let Some(task) = task {
        task.await.unwrap();
    }
}

fn dump_file_count(config: &CacheConfig) -> usize {
    match std::fs::read_dir(config.dump_root.join("test-cache")) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

fn latest_dump(config: &CacheConfig) -> Option<(PathBuf, DateTime<Utc>)> {
    DumpManager::new(config, "test-cache")
        .get_latest_dump()
        .map(|stats| (stats.full_path, stats.update_time))
}

fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    truncate_to_micros(Utc::now() - chrono::Duration::minutes(minutes))
}

#[tokio::test]
async fn cold_start_runs_one_full_update_and_no_dump() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.allowed_update_types = AllowedUpdateTypes::FullOnly;

    let cache = TestCache::new();
    let control = CacheControl::with_periodic_updates_disabled();
    let engine = start_engine(&cache, config.clone(), &control).await.unwrap();

    assert_eq!(cache.calls(), vec![(UpdateType::Full, None)]);
    assert_eq!(dump_file_count(&config), 0);

    let stats = engine.statistics();
    assert_eq!(stats["full"]["update"]["successes-count"], 1);
    assert_eq!(stats["full"]["update"]["failures-count"], 0);
    assert_eq!(stats["current-documents-count"], 1);
    assert_eq!(stats["dump"]["is-loaded"], false);

    engine.stop().await;
}

#[tokio::test]
async fn warm_start_with_skip_mode_serves_dump_contents() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.allowed_update_types = AllowedUpdateTypes::IncrementalOnly;
    config.first_update_mode = FirstUpdateMode::Skip;
    config.dumps_enabled = true;

    let dumped_at = minutes_ago(5);
    seed_dump(&config, dumped_at, b"seeded").await;

    let cache = TestCache::new();
    cache.modify_updates.store(false, Ordering::Relaxed);
    let control = CacheControl::with_periodic_updates_disabled();
    let engine = start_engine(&cache, config, &control).await.unwrap();

    // No synchronous first update; the dump contents are served as-is.
    assert!(cache.calls().is_empty());
    assert_eq!(*cache.payload.lock(), "seeded");
    let stats = engine.statistics();
    assert_eq!(stats["dump"]["is-loaded"], true);
    assert_eq!(stats["dump"]["is-current-from-dump"], true);

    // The next incremental update continues from the dump's instant.
    engine.update(UpdateType::Incremental).await.unwrap();
    assert_eq!(
        cache.calls(),
        vec![(UpdateType::Incremental, Some(dumped_at))]
    );
    assert_eq!(engine.statistics()["dump"]["is-current-from-dump"], false);

    engine.stop().await;
}

#[tokio::test]
async fn warm_start_with_required_mode_fails_startup() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.allowed_update_types = AllowedUpdateTypes::IncrementalOnly;
    config.first_update_mode = FirstUpdateMode::Required;
    config.dumps_enabled = true;

    seed_dump(&config, minutes_ago(5), b"seeded").await;

    let cache = TestCache::new();
    cache.fail_updates.store(true, Ordering::Relaxed);
    let control = CacheControl::new();
    let error = start_engine(&cache, config, &control).await.unwrap_err();
    assert!(error.to_string().contains("failed to start cache"));

    // The failed cache is not registered for test-suite control.
    assert!(control
        .update_one("test-cache", UpdateType::Full)
        .await
        .is_err());
}

#[tokio::test]
async fn dump_only_start_forces_one_full_update() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.allowed_update_types = AllowedUpdateTypes::IncrementalOnly;
    config.first_update_mode = FirstUpdateMode::Skip;
    config.force_full_second_update = true;
    config.dumps_enabled = true;

    seed_dump(&config, minutes_ago(5), b"seeded").await;

    let cache = TestCache::new();
    let control = CacheControl::with_periodic_updates_disabled();
    let engine = start_engine(&cache, config, &control).await.unwrap();
    assert!(cache.calls().is_empty());

    tick(&engine).await.unwrap();
    tick(&engine).await.unwrap();
    let types: Vec<_> = cache.calls().iter().map(|(ty, _)| *ty).collect();
    assert_eq!(types, vec![UpdateType::Full, UpdateType::Incremental]);

    engine.stop().await;
}

#[tokio::test]
async fn dump_is_skipped_within_min_dump_interval() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.allowed_update_types = AllowedUpdateTypes::FullOnly;
    config.dumps_enabled = true;
    config.min_dump_interval = std::time::Duration::from_secs(3600);

    let cache = TestCache::new();
    let control = CacheControl::with_periodic_updates_disabled();
    let engine = start_engine(&cache, config.clone(), &control).await.unwrap();

    // The first (modifying) update schedules a dump.
    join_dump_task(&engine).await;
    assert_eq!(dump_file_count(&config), 1);

    // A second modifying update within the interval does not.
    tick(&engine).await.unwrap();
    join_dump_task(&engine).await;
    assert_eq!(dump_file_count(&config), 1);
    assert_eq!(cache.calls().len(), 2);

    engine.stop().await;
}

#[tokio::test]
async fn unchanged_cache_bumps_the_dump_instead_of_rewriting() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.allowed_update_types = AllowedUpdateTypes::FullOnly;
    config.dumps_enabled = true;

    let cache = TestCache::new();
    let control = CacheControl::with_periodic_updates_disabled();
    let engine = start_engine(&cache, config.clone(), &control).await.unwrap();

    join_dump_task(&engine).await;
    let (first_path, first_time) = latest_dump(&config).unwrap();
    let first_contents = std::fs::read(&first_path).unwrap();

    // The next update changes nothing, so the dump is renamed, not rewritten.
    cache.modify_updates.store(false, Ordering::Relaxed);
    tick(&engine).await.unwrap();
    join_dump_task(&engine).await;

    // The dump still carries the instant of the last modification, and
    // `last_dumped_update` never runs ahead of `last_modifying_update`.
    let (second_path, second_time) = latest_dump(&config).unwrap();
    assert_eq!(second_time, first_time);
    assert_eq!(std::fs::read(&second_path).unwrap(), first_contents);
    assert_eq!(dump_file_count(&config), 1);

    let update = engine.inner.update_state.lock().await;
    assert_eq!(update.last_modifying_update, Some(first_time));
    assert!(update.last_update > update.last_modifying_update);
    drop(update);
    assert_eq!(engine.inner.last_dumped_update.load(), Some(first_time));

    engine.stop().await;
}

#[tokio::test]
async fn full_only_policy_coerces_requested_incremental_updates() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.allowed_update_types = AllowedUpdateTypes::FullOnly;

    let cache = TestCache::new();
    let control = CacheControl::with_periodic_updates_disabled();
    let engine = start_engine(&cache, config, &control).await.unwrap();

    engine.update(UpdateType::Incremental).await.unwrap();
    let types: Vec<_> = cache.calls().iter().map(|(ty, _)| *ty).collect();
    assert_eq!(types, vec![UpdateType::Full, UpdateType::Full]);

    engine.stop().await;
}

#[tokio::test]
async fn failed_update_still_tries_to_dump_and_surfaces_the_error() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.allowed_update_types = AllowedUpdateTypes::FullOnly;
    config.allow_first_update_failure = true;
    config.dumps_enabled = true;

    let cache = TestCache::new();
    cache.fail_updates.store(true, Ordering::Relaxed);
    let control = CacheControl::with_periodic_updates_disabled();
    let engine = start_engine(&cache, config.clone(), &control).await.unwrap();

    // Nothing was ever loaded, so there is nothing to dump, but the engine is
    // alive and the next tick retries.
    assert_eq!(dump_file_count(&config), 0);
    assert!(tick(&engine).await.is_err());
    let stats = engine.statistics();
    assert_eq!(stats["full"]["update"]["failures-count"], 2);

    cache.fail_updates.store(false, Ordering::Relaxed);
    tick(&engine).await.unwrap();
    join_dump_task(&engine).await;
    assert_eq!(dump_file_count(&config), 1);

    engine.stop().await;
}

#[tokio::test]
async fn no_first_update_flag_requires_periodic_updates() {
    let root = tempfile::tempdir().unwrap();

    // With periodic updates enabled the flag is honored.
    let cache = TestCache::new();
    let engine = CacheEngine::start(
        Arc::clone(&cache) as Arc<dyn CacheOperations>,
        test_config(root.path()),
        CacheControl::new(),
        "test-cache",
        tokio::runtime::Handle::current(),
        StartFlags {
            no_first_update: true,
        },
    )
    .await
    .unwrap();
    assert!(cache.calls().is_empty());
    engine.stop().await;

    // Without them it is ignored, so the cache still loads once.
    let cache = TestCache::new();
    let engine = CacheEngine::start(
        Arc::clone(&cache) as Arc<dyn CacheOperations>,
        test_config(root.path()),
        CacheControl::with_periodic_updates_disabled(),
        "test-cache",
        tokio::runtime::Handle::current(),
        StartFlags {
            no_first_update: true,
        },
    )
    .await
    .unwrap();
    assert_eq!(cache.calls().len(), 1);
    engine.stop().await;
}

#[tokio::test]
async fn control_registry_triggers_updates_until_stop() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());

    let cache = TestCache::new();
    let control = CacheControl::with_periodic_updates_disabled();
    let engine = start_engine(&cache, config, &control).await.unwrap();

    control
        .update_one("test-cache", UpdateType::Full)
        .await
        .unwrap();
    control.update_all(UpdateType::Incremental).await.unwrap();
    assert_eq!(cache.calls().len(), 3);

    engine.stop().await;
    assert!(control
        .update_one("test-cache", UpdateType::Full)
        .await
        .is_err());
}

#[tokio::test]
async fn forced_dump_waits_and_writes() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.allowed_update_types = AllowedUpdateTypes::FullOnly;
    config.dumps_enabled = true;
    // A huge interval would normally suppress every dump after the first one.
    config.min_dump_interval = std::time::Duration::from_secs(3600);

    let cache = TestCache::new();
    let control = CacheControl::with_periodic_updates_disabled();
    let engine = start_engine(&cache, config.clone(), &control).await.unwrap();
    join_dump_task(&engine).await;

    tick(&engine).await.unwrap();
    engine.dump_sync_debug().await;
    let (_, time) = latest_dump(&config).unwrap();
    let last_modifying = engine
        .inner
        .update_state
        .lock()
        .await
        .last_modifying_update
        .unwrap();
    assert_eq!(time, last_modifying);

    let stats = engine.statistics();
    assert!(stats["dump"]["last-written-size"].as_u64().unwrap() > 0);

    engine.stop().await;
}
