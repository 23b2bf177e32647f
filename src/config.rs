use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

/// Which update types the periodic update task may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllowedUpdateTypes {
    /// Every tick replaces the whole cache.
    FullOnly,
    /// Every tick reads only the changes since the previous update.
    IncrementalOnly,
    /// Incremental ticks, with a full refresh at least every
    /// `full-update-interval`.
    FullAndIncremental,
}

/// What to do about the synchronous first update when a dump was loaded on
/// startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FirstUpdateMode {
    /// Don't run the first update; the dump contents are fresh enough.
    Skip,
    /// Run it, but fall back to the dump contents if it fails.
    BestEffort,
    /// Run it, and fail startup if it fails.
    Required,
}

/// Effective cache configuration.
///
/// The whole struct can be deserialized from the component's YAML section; all
/// durations use humantime notation (`30s`, `5m`, ...). A running cache observes
/// configuration through [`ConfigSource`] snapshots, so updates never see a
/// half-applied change.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Nominal period of the periodic update task.
    #[serde(with = "humantime_serde")]
    pub update_interval: Duration,

    /// Random spread applied to every tick. Defaults to a tenth of
    /// `update-interval`; see [`CacheConfig::update_jitter`].
    #[serde(default, with = "humantime_serde")]
    pub update_jitter: Option<Duration>,

    /// Minimum interval between full updates when both update types are allowed.
    #[serde(default, with = "humantime_serde")]
    pub full_update_interval: Duration,

    /// Period of the cleanup task.
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,

    #[serde(default = "default_allowed_update_types")]
    pub allowed_update_types: AllowedUpdateTypes,

    #[serde(default = "default_first_update_mode")]
    pub first_update_mode: FirstUpdateMode,

    /// After starting from a dump with incremental-only updates, schedule one
    /// asynchronous full update to wash out potentially corrupted dump data.
    #[serde(default)]
    pub force_full_second_update: bool,

    /// Whether a failing first update leaves the cache empty instead of failing
    /// startup.
    #[serde(default)]
    pub allow_first_update_failure: bool,

    /// Whether cache dumps are written and loaded at all.
    #[serde(default)]
    pub dumps_enabled: bool,

    /// Minimum interval between dump writes triggered by periodic updates.
    #[serde(default, with = "humantime_serde")]
    pub min_dump_interval: Duration,

    /// Directory under which each cache keeps its dump files, in a subdirectory
    /// named after the cache.
    #[serde(default = "default_dump_root")]
    pub dump_root: PathBuf,

    /// Version embedded in dump file names. Only dumps of the current version
    /// are loaded; bump it when the serialized format changes.
    #[serde(default = "default_dump_format_version")]
    pub dump_format_version: u32,

    /// How many dumps of the current version to retain on disk.
    #[serde(default = "default_max_dump_count")]
    pub max_dump_count: usize,

    /// Dumps older than this are neither loaded nor retained.
    #[serde(default, with = "humantime_serde")]
    pub max_dump_age: Option<Duration>,
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_allowed_update_types() -> AllowedUpdateTypes {
    AllowedUpdateTypes::FullAndIncremental
}

fn default_first_update_mode() -> FirstUpdateMode {
    FirstUpdateMode::Skip
}

fn default_dump_root() -> PathBuf {
    PathBuf::from("./cache-dumps")
}

fn default_dump_format_version() -> u32 {
    1
}

fn default_max_dump_count() -> usize {
    1
}

impl CacheConfig {
    /// Parses a configuration from its YAML representation.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("failed to parse cache config YAML")
    }

    /// The effective update jitter.
    pub fn update_jitter(&self) -> Duration {
        self.update_jitter.unwrap_or(self.update_interval / 10)
    }

    /// Applies a dynamic overlay on top of this configuration.
    pub fn merge(&self, patch: &CacheConfigPatch) -> CacheConfig {
        let mut merged = self.clone();
        if let Some(update_interval) = patch.update_interval {
            merged.update_interval = update_interval;
        }
        if let Some(update_jitter) = patch.update_jitter {
            merged.update_jitter = Some(update_jitter);
        }
        if let Some(full_update_interval) = patch.full_update_interval {
            merged.full_update_interval = full_update_interval;
        }
        if let Some(cleanup_interval) = patch.cleanup_interval {
            merged.cleanup_interval = cleanup_interval;
        }
        if let Some(dumps_enabled) = patch.dumps_enabled {
            merged.dumps_enabled = dumps_enabled;
        }
        if let Some(min_dump_interval) = patch.min_dump_interval {
            merged.min_dump_interval = min_dump_interval;
        }
        merged
    }
}

/// Dynamic overlay for the subset of [`CacheConfig`] that may change at runtime.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfigPatch {
    #[serde(default, with = "humantime_serde")]
    pub update_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub update_jitter: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub full_update_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub cleanup_interval: Option<Duration>,
    #[serde(default)]
    pub dumps_enabled: Option<bool>,
    #[serde(default, with = "humantime_serde")]
    pub min_dump_interval: Option<Duration>,
}

/// Source of configuration snapshots for a running cache.
///
/// Writers install a new snapshot atomically; readers take a cheap `Arc` clone
/// and never block writers. Replaced snapshots are parked in a retire list so
/// an install never frees memory a reader still uses; the periodic cleanup tick
/// drops retired snapshots once the last reader is gone.
#[derive(Debug)]
pub struct ConfigSource {
    base: CacheConfig,
    current: RwLock<Arc<CacheConfig>>,
    retired: Mutex<Vec<Arc<CacheConfig>>>,
}

impl ConfigSource {
    pub fn new(base: CacheConfig) -> Self {
        let current = RwLock::new(Arc::new(base.clone()));
        ConfigSource {
            base,
            current,
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current configuration snapshot.
    pub fn read(&self) -> Arc<CacheConfig> {
        self.current.read().clone()
    }

    /// Replaces the dynamic overlay. `None` reverts to the static configuration.
    pub fn set(&self, patch: Option<&CacheConfigPatch>) {
        let next = Arc::new(match patch {
            Some(patch) => self.base.merge(patch),
            None => self.base.clone(),
        });
        let previous = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, next)
        };
        self.retired.lock().push(previous);
    }

    /// Drops retired snapshots that no reader references anymore.
    pub fn cleanup(&self) {
        self.retired
            .lock()
            .retain(|snapshot| Arc::strong_count(snapshot) > 1);
    }
}
