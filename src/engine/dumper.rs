use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::config::CacheConfig;
use crate::dump::{DumpError, DumpWriter};

use super::state::UpdateData;
use super::EngineInner;

/// How strictly the dump decision honors `min-dump-interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DumpType {
    /// Respect the configured minimum interval between dumps.
    HonorInterval,
    /// Dump regardless of the interval (debug/test path).
    Forced,
}

#[derive(Debug, Clone, Copy)]
enum DumpOperation {
    /// Serialize the cache into a new dump file named after `new_time`.
    NewDump { new_time: DateTime<Utc> },
    /// Rename the dump written for `old_time` to advertise `new_time`.
    BumpTime {
        old_time: DateTime<Utc>,
        new_time: DateTime<Utc>,
    },
}

fn should_dump(
    inner: &EngineInner,
    dump_type: DumpType,
    update: &UpdateData,
    config: &CacheConfig,
) -> bool {
    if !config.dumps_enabled {
        tracing::debug!(cache = %inner.name, "skipped cache dump, dumps are disabled");
        return false;
    }

    let Some(last_update) = update.last_update else {
        tracing::debug!(cache = %inner.name, "skipped cache dump, the cache has not loaded yet");
        return false;
    };

    if dump_type == DumpType::HonorInterval {
        // `None` means the interval does not fit the calendar at all; treat it
        // as "never dump again" rather than as "always dump".
        let threshold = chrono::Duration::from_std(config.min_dump_interval)
            .ok()
            .and_then(|min_interval| last_update.checked_sub_signed(min_interval));
        let within_interval = match threshold {
            Some(threshold) => inner
                .last_dumped_update
                .load()
                .is_some_and(|dumped| dumped > threshold),
            None => true,
        };
        if within_interval {
            tracing::debug!(
                cache = %inner.name,
                "skipped cache dump, the dump interval has not passed yet",
            );
            return false;
        }
    }

    // Prevent concurrent dumps from accumulating and slowing everything down.
    if update.dump_task_in_flight() {
        tracing::info!(
            cache = %inner.name,
            "skipped cache dump, a previous dump operation is still in progress",
        );
        return false;
    }

    true
}

/// Decides on and schedules a dump after an update, or does nothing.
pub(crate) async fn dump_async_if_needed(
    inner: &Arc<EngineInner>,
    dump_type: DumpType,
    update: &mut UpdateData,
    config: &CacheConfig,
) {
    if !should_dump(inner, dump_type, update, config) {
        return;
    }

    // A dump is always registered under the instant of the last modification,
    // so `last_dumped_update` never gets ahead of `last_modifying_update`.
    let Some(new_time) = update.last_modifying_update else {
        tracing::debug!(
            cache = %inner.name,
            "skipped cache dump, the cache was never modified",
        );
        return;
    };

    let last_dumped = inner.last_dumped_update.load();
    let operation = if last_dumped == Some(new_time) {
        // Nothing has changed since the on-disk dump; skip the serialization
        // by just renaming the dump file.
        tracing::debug!(
            cache = %inner.name,
            "nothing has been updated since the last dump, renaming it",
        );
        DumpOperation::BumpTime {
            old_time: new_time,
            new_time,
        }
    } else {
        DumpOperation::NewDump { new_time }
    };

    dump_async(inner, operation, update).await;
}

async fn dump_async(inner: &Arc<EngineInner>, operation: DumpOperation, update: &mut UpdateData) {
    // `should_dump` verified that any previous task has finished; consume its
    // handle so a panic there does not go unobserved.
    if let Some(previous) = update.dump_task.take() {
        if let Err(err) = previous.await {
            tracing::error!(
                cache = %inner.name,
                error = &err as &dyn std::error::Error,
                "unexpected error from the previous cache dump",
            );
        }
    }

    let task_inner = Arc::clone(inner);
    let handle = inner.fs_runtime.spawn(async move {
        let span = tracing::info_span!("cache-dump", cache = %task_inner.name);
        async {
            let (success, new_time) = match operation {
                DumpOperation::NewDump { new_time } => {
                    (do_dump(&task_inner, new_time).await, new_time)
                }
                DumpOperation::BumpTime { old_time, new_time } => (
                    task_inner.dump_manager.bump_dump_time(old_time, new_time),
                    new_time,
                ),
            };
            if success {
                task_inner.last_dumped_update.fetch_max(new_time);
            }
        }
        .instrument(span)
        .await
    });
    update.dump_task = Some(handle);
}

/// Serializes the cache into a new dump file. Returns whether a dump was
/// written.
async fn do_dump(inner: &EngineInner, update_time: DateTime<Utc>) -> bool {
    let dump_start = Instant::now();
    let started_at = Utc::now();

    let written: Result<u64, DumpError> = async {
        let dump_stats = inner.dump_manager.register_new_dump(update_time)?;
        let mut writer = DumpWriter::create(dump_stats.full_path).await?;
        inner.operations.write_dump(&mut writer).await?;
        writer.finish().await
    }
    .await;

    let size = match written {
        Ok(size) => size,
        Err(DumpError::EmptyCache) => {
            // A successful update has happened, but the cache could have been
            // cleared forcefully in the meantime.
            tracing::warn!(cache = %inner.name, "could not dump cache, because it is empty");
            return false;
        }
        Err(err) => {
            tracing::error!(
                cache = %inner.name,
                error = &err as &dyn std::error::Error,
                "error while serializing a cache dump",
            );
            return false;
        }
    };

    inner.dump_manager.cleanup();
    inner
        .statistics
        .dump
        .record_write(size, dump_start.elapsed(), started_at);
    true
}

/// Forces a dump and waits for it to finish. Debug/test path.
pub(crate) async fn dump_sync_debug(inner: &Arc<EngineInner>) {
    let mut update = inner.update_state.lock().await;
    let config = inner.config.read();

    dump_async_if_needed(inner, DumpType::Forced, &mut update, &config).await;

    if let Some(task) = update.dump_task.take() {
        if let Err(err) = task.await {
            tracing::error!(
                cache = %inner.name,
                error = &err as &dyn std::error::Error,
                "cache dump task failed",
            );
        }
    }
}
