use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::config::CacheConfig;

/// `<timestamp>-v<version>`, e.g. `2024-03-17T08-41-19.273941-v1`.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.6f";

/// A dump file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpFileStats {
    pub full_path: PathBuf,
    /// The update instant the dump contents reflect.
    pub update_time: DateTime<Utc>,
}

/// Owner of the dump file namespace of a single cache.
///
/// All methods do blocking filesystem work; the engine only calls them from
/// tasks spawned on the filesystem runtime.
#[derive(Debug)]
pub struct DumpManager {
    dir: PathBuf,
    cache_name: String,
    format_version: u32,
    max_count: usize,
    max_age: Option<Duration>,
}

impl DumpManager {
    pub fn new(config: &CacheConfig, cache_name: &str) -> Self {
        DumpManager {
            dir: config.dump_root.join(cache_name),
            cache_name: cache_name.to_owned(),
            format_version: config.dump_format_version,
            max_count: config.max_dump_count,
            max_age: config.max_dump_age,
        }
    }

    /// Returns the newest readable dump of the current format version, if any.
    pub fn get_latest_dump(&self) -> Option<DumpFileStats> {
        let latest = self
            .scan()
            .into_iter()
            .filter(|dump| dump.version == self.format_version)
            .filter(|dump| !self.is_too_old(dump.stats.update_time))
            .max_by_key(|dump| dump.stats.update_time)?;

        // The file may have been cleaned up or be unreadable for this process.
        if let Err(err) = fs::File::open(&latest.stats.full_path) {
            tracing::warn!(
                cache = %self.cache_name,
                path = %latest.stats.full_path.display(),
                error = &err as &dyn std::error::Error,
                "latest cache dump is not readable",
            );
            return None;
        }
        Some(latest.stats)
    }

    /// Reserves the on-disk path for a new dump keyed by `update_time`.
    pub fn register_new_dump(&self, update_time: DateTime<Utc>) -> io::Result<DumpFileStats> {
        fs::create_dir_all(&self.dir)?;
        Ok(DumpFileStats {
            full_path: self.dump_path(update_time),
            update_time,
        })
    }

    /// Renames the dump written for `old_time` so that it advertises `new_time`.
    ///
    /// Returns `false` (after logging) if the previous dump is gone, e.g.
    /// removed externally; the caller must not advance its bookkeeping then.
    pub fn bump_dump_time(&self, old_time: DateTime<Utc>, new_time: DateTime<Utc>) -> bool {
        let from = self.dump_path(old_time);
        let to = self.dump_path(new_time);
        match fs::rename(&from, &to) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    cache = %self.cache_name,
                    from = %from.display(),
                    to = %to.display(),
                    error = &err as &dyn std::error::Error,
                    "failed to rename cache dump",
                );
                false
            }
        }
    }

    /// Applies the retention policy: keeps the newest `max_dump_count` dumps of
    /// the current version, removes outdated versions and expired dumps.
    /// Foreign files in the dump directory are left alone.
    pub fn cleanup(&self) {
        let mut dumps = self.scan();
        dumps.sort_by(|a, b| b.stats.update_time.cmp(&a.stats.update_time));

        let mut kept = 0usize;
        for dump in dumps {
            let keep = dump.version == self.format_version
                && !self.is_too_old(dump.stats.update_time)
                && kept < self.max_count;
            if keep {
                kept += 1;
                continue;
            }
            if let Err(err) = fs::remove_file(&dump.stats.full_path) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::error!(
                        cache = %self.cache_name,
                        path = %dump.stats.full_path.display(),
                        error = &err as &dyn std::error::Error,
                        "failed to remove an old cache dump",
                    );
                }
            }
        }
    }

    fn dump_path(&self, update_time: DateTime<Utc>) -> PathBuf {
        let name = format!(
            "{}-v{}",
            update_time.format(TIMESTAMP_FORMAT),
            self.format_version
        );
        self.dir.join(name)
    }

    fn scan(&self) -> Vec<ParsedDump> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::error!(
                        cache = %self.cache_name,
                        dir = %self.dir.display(),
                        error = &err as &dyn std::error::Error,
                        "failed to scan the dump directory",
                    );
                }
                return Vec::new();
            }
        };

        let mut dumps = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if let Some((update_time, version)) = parse_dump_name(name) {
                dumps.push(ParsedDump {
                    stats: DumpFileStats {
                        full_path: path,
                        update_time,
                    },
                    version,
                });
            }
        }
        dumps
    }

    fn is_too_old(&self, update_time: DateTime<Utc>) -> bool {
        let Some(max_age) = self.max_age else {
            return false;
        };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return false;
        };
        Utc::now() - update_time > max_age
    }
}

#[derive(Debug)]
struct ParsedDump {
    stats: DumpFileStats,
    version: u32,
}

fn parse_dump_name(name: &str) -> Option<(DateTime<Utc>, u32)> {
    let (timestamp, version) = name.rsplit_once("-v")?;
    let version = version.parse().ok()?;
    let timestamp = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
    Some((timestamp.and_utc(), version))
}
