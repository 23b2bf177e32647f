//! The cache engine: lifecycle, bootstrap, update scheduling and dumps.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::Instrument;

use crate::config::{
    AllowedUpdateTypes, CacheConfig, CacheConfigPatch, ConfigSource, FirstUpdateMode,
};
use crate::control::{CacheControl, ControlledCache};
use crate::dump::{DumpError, DumpManager, DumpReader, DumpWriter};
use crate::statistics::{CacheStatistics, UpdateCounters};

mod driver;
mod dumper;
mod periodic;
mod state;
#[cfg(test)]
mod tests;

pub use periodic::{Settings as PeriodicTaskSettings, TaskFlags};

use periodic::PeriodicTask;
use state::{AtomicTimePoint, UpdateData};

/// The kind of refresh a single update performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    /// Replace the whole in-memory snapshot.
    Full,
    /// Read only the changes since the previous update instant.
    Incremental,
}

impl UpdateType {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateType::Full => "full",
            UpdateType::Incremental => "incremental",
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags for [`CacheEngine::start`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StartFlags {
    /// Skip the synchronous first update. Ignored when periodic updates are
    /// disabled by the [`CacheControl`], because some embedders require every
    /// cache to be updated at least once.
    pub no_first_update: bool,
}

/// Handle passed into [`CacheOperations::update`].
pub struct UpdateContext<'a> {
    pub(crate) counters: &'a UpdateCounters,
    pub(crate) statistics: &'a CacheStatistics,
    pub(crate) modified: &'a AtomicBool,
}

impl UpdateContext<'_> {
    /// Must be called iff the update mutated the cache contents. Drives both
    /// the `last_modifying_update` bookkeeping and the rewrite-vs-rename dump
    /// decision.
    pub fn on_cache_modified(&self) {
        self.modified.store(true, Ordering::Relaxed);
    }

    /// Adds to the number of documents read by this update.
    pub fn add_documents_read(&self, count: u64) {
        self.counters.add_documents_read(count);
    }

    /// Reports the current size of the cache.
    pub fn set_documents_count(&self, count: u64) {
        self.statistics
            .documents_current_count
            .store(count, Ordering::Relaxed);
    }
}

/// The capability set a domain cache hands to the engine.
///
/// `update` is the only required operation. The serializer pair must be
/// inverses of each other; leaving it at the default while enabling dumps is a
/// configuration error that surfaces as [`DumpError::Unimplemented`].
pub trait CacheOperations: Send + Sync + 'static {
    /// Refreshes the cache. Must call [`UpdateContext::on_cache_modified`] iff
    /// the contents changed.
    ///
    /// `last_update` is the instant supplied to the most recent successful
    /// update (`None` on the very first one), `now` is the instant this update
    /// will be recorded under if it succeeds.
    fn update<'a>(
        &'a self,
        update_type: UpdateType,
        last_update: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        context: &'a UpdateContext<'a>,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Periodic maintenance of the in-memory state.
    fn cleanup<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    /// Serializes the cache into `writer`. May return
    /// [`DumpError::EmptyCache`] if there is nothing to dump.
    fn write_dump<'a>(&'a self, writer: &'a mut DumpWriter) -> BoxFuture<'a, Result<(), DumpError>> {
        let _ = writer;
        Box::pin(async { Err(DumpError::Unimplemented) })
    }

    /// Restores the cache from `reader`; the inverse of
    /// [`write_dump`](Self::write_dump).
    fn read_dump<'a>(&'a self, reader: &'a mut DumpReader) -> BoxFuture<'a, Result<(), DumpError>> {
        let _ = reader;
        Box::pin(async { Err(DumpError::Unimplemented) })
    }
}

pub(crate) struct EngineInner {
    pub(crate) name: String,
    pub(crate) operations: Arc<dyn CacheOperations>,
    pub(crate) config: ConfigSource,
    pub(crate) control: Arc<CacheControl>,
    /// Runtime for all blocking-ish dump I/O: reads, writes, renames, scans.
    pub(crate) fs_runtime: tokio::runtime::Handle,
    pub(crate) dump_manager: DumpManager,
    pub(crate) statistics: CacheStatistics,
    pub(crate) update_state: tokio::sync::Mutex<UpdateData>,
    update_task: PeriodicTask,
    cleanup_task: PeriodicTask,
    periodic_task_flags: parking_lot::Mutex<TaskFlags>,
    periodic_update_enabled: bool,
    pub(crate) is_running: AtomicBool,
    pub(crate) cache_modified: AtomicBool,
    pub(crate) force_next_update_full: AtomicBool,
    pub(crate) last_dumped_update: AtomicTimePoint,
}

impl fmt::Debug for EngineInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineInner")
            .field("name", &self.name)
            .field("is_running", &self.is_running)
            .finish_non_exhaustive()
    }
}

/// Owning handle of a running cache.
///
/// Created by [`CacheEngine::start`]; [`CacheEngine::stop`] must be called
/// before the handle is dropped.
#[derive(Debug)]
pub struct CacheEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl CacheEngine {
    /// Bootstraps a cache: loads the latest dump if enabled, runs the first
    /// update according to the configured policy, and starts the periodic
    /// update and cleanup tasks.
    ///
    /// Update work runs on the ambient runtime; all dump I/O runs on
    /// `fs_runtime`.
    pub async fn start(
        operations: Arc<dyn CacheOperations>,
        config: CacheConfig,
        control: Arc<CacheControl>,
        name: impl Into<String>,
        fs_runtime: tokio::runtime::Handle,
        flags: StartFlags,
    ) -> anyhow::Result<CacheEngine> {
        let name = name.into();
        let dump_manager = DumpManager::new(&config, &name);
        let periodic_update_enabled = control.periodic_updates_enabled();

        let inner = Arc::new(EngineInner {
            name,
            operations,
            config: ConfigSource::new(config),
            control,
            fs_runtime,
            dump_manager,
            statistics: CacheStatistics::default(),
            update_state: tokio::sync::Mutex::new(UpdateData::default()),
            update_task: PeriodicTask::default(),
            cleanup_task: PeriodicTask::default(),
            periodic_task_flags: parking_lot::Mutex::new(TaskFlags {
                chaotic: true,
                critical: true,
                now: false,
            }),
            periodic_update_enabled,
            is_running: AtomicBool::new(true),
            cache_modified: AtomicBool::new(false),
            force_next_update_full: AtomicBool::new(false),
            last_dumped_update: AtomicTimePoint::default(),
        });

        // Registration order is the cache dependency order: embedders start
        // their caches in dependency order, and the test-suite invalidation
        // walks the registry in the same order.
        let registration = Arc::downgrade(&inner) as Weak<dyn ControlledCache>;
        inner.control.register(registration.clone());

        match bootstrap(&inner, flags).await {
            Ok(()) => Ok(CacheEngine { inner }),
            Err(err) => {
                inner.is_running.store(false, Ordering::SeqCst);
                inner.control.deregister(&registration);
                let name = inner.name.clone();
                Err(err).with_context(|| format!("failed to start cache `{name}`"))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Triggers one update out of schedule. The requested type is coerced to
    /// full if the configuration only allows full updates. No dump is
    /// attempted.
    pub async fn update(&self, update_type: UpdateType) -> anyhow::Result<()> {
        driver::update(&self.inner, update_type).await
    }

    /// Forces a dump and waits for it to complete. Debug/test path.
    pub async fn dump_sync_debug(&self) {
        dumper::dump_sync_debug(&self.inner).await;
    }

    /// Signals that the cache contents were mutated outside of an update.
    pub fn on_cache_modified(&self) {
        self.inner.cache_modified.store(true, Ordering::Relaxed);
    }

    /// Replaces the dynamic configuration overlay and re-tunes the periodic
    /// tasks. `None` reverts to the static configuration.
    pub fn set_config(&self, patch: Option<&CacheConfigPatch>) {
        self.inner.config.set(patch);
        let config = self.inner.config.read();
        let flags = *self.inner.periodic_task_flags.lock();
        self.inner
            .update_task
            .set_settings(update_task_settings(&config, flags));
        self.inner
            .cleanup_task
            .set_settings(PeriodicTaskSettings::new(config.cleanup_interval));
    }

    /// The statistics snapshot of this cache.
    pub fn statistics(&self) -> serde_json::Value {
        self.inner.statistics.to_json()
    }

    /// Stops the periodic tasks and any in-flight dump. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.is_running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.update_task.stop().await;
        self.inner.cleanup_task.stop().await;

        let mut update = self.inner.update_state.lock().await;
        if let Some(task) = update.dump_task.take() {
            if !task.is_finished() {
                tracing::warn!(cache = %self.inner.name, "stopping an in-flight cache dump task");
                task.abort();
            }
            match task.await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {
                    tracing::debug!(cache = %self.inner.name, "cache dump task cancelled");
                }
                Err(err) => {
                    tracing::error!(
                        cache = %self.inner.name,
                        error = &err as &dyn std::error::Error,
                        "cache dump task failed during shutdown",
                    );
                }
            }
        }
        drop(update);

        let registration = Arc::downgrade(&self.inner) as Weak<dyn ControlledCache>;
        self.inner.control.deregister(&registration);
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        if self.inner.is_running.load(Ordering::SeqCst) {
            tracing::error!(
                cache = %self.inner.name,
                "cache engine dropped while still running, call stop() first",
            );
            debug_assert!(false, "CacheEngine::stop() was not called");
        }
    }
}

async fn bootstrap(inner: &Arc<EngineInner>, flags: StartFlags) -> anyhow::Result<()> {
    let config = inner.config.read();

    let dump_loaded = load_from_dump(inner, &config).await;

    let skip_first_update = (dump_loaded && config.first_update_mode == FirstUpdateMode::Skip)
        || (flags.no_first_update && inner.periodic_update_enabled);
    if !skip_first_update {
        let span = tracing::info_span!("first-update", cache = %inner.name);
        let result = driver::do_periodic_update(inner).instrument(span).await;
        if let Err(err) = result {
            if dump_loaded && config.first_update_mode != FirstUpdateMode::Required {
                tracing::error!(
                    cache = %inner.name,
                    error = format!("{err:#}"),
                    "failed to update cache after loading a dump, going on with the dump contents",
                );
            } else if config.allow_first_update_failure {
                tracing::error!(
                    cache = %inner.name,
                    error = format!("{err:#}"),
                    "failed to update cache for the first time, leaving it empty",
                );
            } else {
                return Err(err.context("first update failed"));
            }
        }
    }

    // With incremental-only updates, data loaded from a corrupted dump would
    // never be replaced, not even by a restart. Schedule a single asynchronous
    // full update to wash it out.
    if dump_loaded
        && config.allowed_update_types == AllowedUpdateTypes::IncrementalOnly
        && config.force_full_second_update
    {
        inner.force_next_update_full.store(true, Ordering::Relaxed);
        inner.periodic_task_flags.lock().now = true;
    }

    if inner.periodic_update_enabled {
        let task_flags = *inner.periodic_task_flags.lock();
        let update_inner = Arc::clone(inner);
        inner.update_task.start(
            format!("update-task/{}", inner.name),
            update_task_settings(&config, task_flags),
            move || {
                let inner = Arc::clone(&update_inner);
                async move { driver::do_periodic_update(&inner).await }
            },
        );

        let cleanup_inner = Arc::clone(inner);
        inner.cleanup_task.start(
            format!("cleanup-task/{}", inner.name),
            PeriodicTaskSettings::new(config.cleanup_interval),
            move || {
                let inner = Arc::clone(&cleanup_inner);
                async move {
                    let span = tracing::trace_span!("cache-cleanup", cache = %inner.name);
                    async {
                        inner.config.cleanup();
                        inner.operations.cleanup().await;
                    }
                    .instrument(span)
                    .await;
                    anyhow::Ok(())
                }
            },
        );
    }

    Ok(())
}

/// Loads the newest dump, if any, and primes the update bookkeeping with its
/// timestamp. Returns whether a dump was loaded; any failure is logged and
/// treated as "no dump present".
async fn load_from_dump(inner: &Arc<EngineInner>, config: &CacheConfig) -> bool {
    let mut update = inner.update_state.lock().await;
    let load_start = Instant::now();

    if !config.dumps_enabled {
        tracing::debug!(
            cache = %inner.name,
            "not loading a cache dump, dumps are disabled",
        );
        return false;
    }

    let task_inner = Arc::clone(inner);
    let load = inner.fs_runtime.spawn(
        async move {
            let dump_stats = task_inner.dump_manager.get_latest_dump()?;

            let result: Result<(), DumpError> = async {
                let mut reader = DumpReader::open(&dump_stats.full_path).await?;
                task_inner.operations.read_dump(&mut reader).await?;
                reader.finish().await
            }
            .await;

            match result {
                Ok(()) => Some(dump_stats.update_time),
                Err(err) => {
                    tracing::error!(
                        cache = %task_inner.name,
                        path = %dump_stats.full_path.display(),
                        error = &err as &dyn std::error::Error,
                        "error while reading a cache dump",
                    );
                    None
                }
            }
        }
        .instrument(tracing::info_span!("load-from-dump", cache = %inner.name)),
    );

    let update_time = match load.await {
        Ok(update_time) => update_time,
        Err(err) => {
            tracing::error!(
                cache = %inner.name,
                error = &err as &dyn std::error::Error,
                "cache dump load task failed",
            );
            None
        }
    };
    let Some(update_time) = update_time else {
        return false;
    };

    tracing::info!(cache = %inner.name, "loaded a cache dump");
    update.last_update = Some(update_time);
    update.last_modifying_update = Some(update_time);
    inner.last_dumped_update.fetch_max(update_time);
    inner.statistics.dump.record_load(load_start.elapsed());
    true
}

fn update_task_settings(config: &CacheConfig, flags: TaskFlags) -> PeriodicTaskSettings {
    PeriodicTaskSettings {
        period: config.update_interval,
        jitter: config.update_jitter(),
        flags,
    }
}

impl ControlledCache for EngineInner {
    fn name(&self) -> &str {
        &self.name
    }

    fn update(self: Arc<Self>, update_type: UpdateType) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move { driver::update(&self, update_type).await })
    }

    fn write_dump_sync(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { dumper::dump_sync_debug(&self).await })
    }
}
