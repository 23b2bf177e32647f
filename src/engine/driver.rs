use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::Instrument;

use crate::config::AllowedUpdateTypes;
use crate::statistics::UpdateStatisticsScope;

use super::dumper::{self, DumpType};
use super::state::UpdateData;
use super::{EngineInner, UpdateContext, UpdateType};

/// One tick of the periodic update task: pick the update type, run the domain
/// update, then give the dump engine a chance regardless of the outcome.
pub(crate) async fn do_periodic_update(inner: &Arc<EngineInner>) -> anyhow::Result<()> {
    let mut update = inner.update_state.lock().await;
    let config = inner.config.read();

    // The update is full regardless of the allowed types if the cache has
    // never loaded, or if a full update was armed as a one-shot. The one-shot
    // is spent even if this tick fails.
    let force_full = inner.force_next_update_full.swap(false, Ordering::Relaxed)
        || update.last_update.is_none();

    let update_type = if force_full {
        UpdateType::Full
    } else {
        match config.allowed_update_types {
            AllowedUpdateTypes::FullOnly => UpdateType::Full,
            AllowedUpdateTypes::IncrementalOnly => UpdateType::Incremental,
            AllowedUpdateTypes::FullAndIncremental => {
                let within_full_interval = update
                    .last_full_update
                    .is_some_and(|last| last.elapsed() < config.full_update_interval);
                if within_full_interval {
                    UpdateType::Incremental
                } else {
                    UpdateType::Full
                }
            }
        }
    };

    let result = do_update(inner, update_type, &mut update).await;
    dumper::dump_async_if_needed(inner, DumpType::HonorInterval, &mut update, &config).await;

    if let Err(err) = &result {
        tracing::warn!(
            cache = %inner.name,
            error = format!("{err:#}"),
            "error while updating cache",
        );
    }
    result
}

/// Explicit update trigger used by test suites. Coerces the requested type to
/// the configured policy and runs the update body without the type decision,
/// and without a dump.
pub(crate) async fn update(inner: &Arc<EngineInner>, mut update_type: UpdateType) -> anyhow::Result<()> {
    let mut update = inner.update_state.lock().await;
    let config = inner.config.read();

    if config.allowed_update_types == AllowedUpdateTypes::FullOnly
        && update_type == UpdateType::Incremental
    {
        update_type = UpdateType::Full;
    }

    do_update(inner, update_type, &mut update).await
}

pub(crate) async fn do_update(
    inner: &Arc<EngineInner>,
    update_type: UpdateType,
    update: &mut UpdateData,
) -> anyhow::Result<()> {
    let steady_now = Instant::now();
    let system_now = crate::dump::truncate_to_micros(Utc::now());

    let span = tracing::info_span!(
        "cache-update",
        cache = %inner.name,
        update_type = update_type.as_str(),
    );
    async {
        let scope = UpdateStatisticsScope::new(&inner.statistics, update_type);
        let context = UpdateContext {
            counters: inner.statistics.counters(update_type),
            statistics: &inner.statistics,
            modified: &inner.cache_modified,
        };

        tracing::info!("updating cache");
        inner
            .operations
            .update(update_type, update.last_update, system_now, &context)
            .await?;
        scope.finish_success();
        tracing::info!("updated cache");

        update.last_update = Some(system_now);
        if inner.cache_modified.swap(false, Ordering::Relaxed) {
            update.last_modifying_update = Some(system_now);
        }
        if update_type == UpdateType::Full {
            update.last_full_update = Some(steady_now);
        }
        inner
            .statistics
            .dump
            .is_current_from_dump
            .store(false, Ordering::Relaxed);
        Ok(())
    }
    .instrument(span)
    .await
}
