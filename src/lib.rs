//! # Snapcache
//!
//! Snapcache is a reusable in-memory cache component for services that keep a full
//! snapshot of some upstream data set in memory and refresh it periodically. The
//! domain cache supplies the data and the refresh logic; this crate drives *when*
//! refreshes run, how failures are tolerated, and how the cache state is persisted
//! to an on-disk dump so the process can restart warm.
//!
//! ## Architecture
//!
//! A cache is assembled from a handful of cooperating pieces:
//!
//! - [`CacheConfig`] / [`ConfigSource`] hold the effective configuration. The static
//!   part is fixed at construction; a dynamic patch can be installed at any time via
//!   [`CacheEngine::set_config`]. Readers always observe a whole snapshot.
//! - [`CacheOperations`] is the capability set a domain cache implements: the
//!   update itself, periodic cleanup, and an optional serializer pair used for
//!   dumps. It is handed to the engine as an `Arc<dyn CacheOperations>`.
//! - [`CacheEngine`] owns the lifecycle. [`CacheEngine::start`] loads the latest
//!   dump (if enabled), runs the first update according to the configured policy,
//!   and starts the periodic update and cleanup tasks. [`CacheEngine::stop`] tears
//!   all of that down; an engine must be stopped before it is dropped.
//! - The dump machinery serializes the cache on a dedicated filesystem runtime.
//!   Identical successive updates do not rewrite the dump file: the write is
//!   skipped and the existing dump is kept via a rename-only "bump".
//! - [`CacheControl`] is a registry used by test suites to trigger updates and
//!   dump writes out of schedule.
//!
//! ## Task processors
//!
//! All update work runs on the runtime the engine was started on. All dump reads,
//! writes, renames and directory scans run on a separate
//! [`tokio::runtime::Handle`] passed to [`CacheEngine::start`], so that blocking
//! filesystem work never competes with latency-sensitive tasks.
//!
//! ## Updates
//!
//! Each periodic tick picks between a *full* refresh (replace everything) and an
//! *incremental* one (read only changes since the previous instant), based on the
//! configured [`AllowedUpdateTypes`], the time since the last full update, and
//! one-shot overrides such as the forced full update after a dump-only start. An
//! update that fails is retried on the next tick; the cache never enters a
//! terminal "broken" state.
//!
//! ## Dumps
//!
//! After every tick the engine decides whether the in-memory state should be
//! persisted. At most one dump task is in flight per cache; dumps are written to a
//! temporary file and atomically renamed into place. On startup the newest
//! readable dump is loaded before the first update, so a bad upstream does not
//! destroy a warm cache.

pub mod config;
pub mod control;
pub mod dump;
pub mod engine;
pub mod logging;
pub mod statistics;

pub use config::{
    AllowedUpdateTypes, CacheConfig, CacheConfigPatch, ConfigSource, FirstUpdateMode,
};
pub use control::CacheControl;
pub use dump::{DumpError, DumpReader, DumpWriter};
pub use engine::{CacheEngine, CacheOperations, StartFlags, UpdateContext, UpdateType};
pub use statistics::CacheStatistics;
