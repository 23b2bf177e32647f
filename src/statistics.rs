//! Per-cache statistics, exposed as a JSON snapshot.
//!
//! Counters are plain atomics so that the update task, the dump task and the
//! metrics endpoint can touch them from any thread without locking.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::engine::UpdateType;

/// Counters for one update type (full or incremental).
#[derive(Debug, Default)]
pub struct UpdateCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    documents_read: AtomicU64,
    /// Unix millis; 0 means "never".
    last_attempt_start: AtomicI64,
    last_success_start: AtomicI64,
}

impl UpdateCounters {
    pub(crate) fn add_documents_read(&self, count: u64) {
        self.documents_read.fetch_add(count, Ordering::Relaxed);
    }

    fn snapshot(&self) -> UpdateSnapshot {
        UpdateSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            documents_read: self.documents_read.load(Ordering::Relaxed),
            last_attempt_start: load_time(&self.last_attempt_start),
            last_success_start: load_time(&self.last_success_start),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct UpdateSnapshot {
    attempts: u64,
    successes: u64,
    failures: u64,
    documents_read: u64,
    last_attempt_start: Option<DateTime<Utc>>,
    last_success_start: Option<DateTime<Utc>>,
}

impl UpdateSnapshot {
    /// Combines two snapshots into the "any update" view.
    fn combined(&self, other: &UpdateSnapshot) -> UpdateSnapshot {
        UpdateSnapshot {
            attempts: self.attempts + other.attempts,
            successes: self.successes + other.successes,
            failures: self.failures + other.failures,
            documents_read: self.documents_read + other.documents_read,
            last_attempt_start: self.last_attempt_start.max(other.last_attempt_start),
            last_success_start: self.last_success_start.max(other.last_success_start),
        }
    }

    fn to_json(self) -> Value {
        json!({
            "update": {
                "attempts-count": self.attempts,
                "successes-count": self.successes,
                "failures-count": self.failures,
            },
            "documents": {
                "read-count": self.documents_read,
            },
            "time": {
                "last-update-start-time": time_to_json(self.last_attempt_start),
                "last-successful-update-start-time": time_to_json(self.last_success_start),
            },
        })
    }
}

/// Dump-related statistics.
#[derive(Debug, Default)]
pub struct DumpStatistics {
    pub(crate) is_loaded: AtomicBool,
    pub(crate) is_current_from_dump: AtomicBool,
    pub(crate) load_duration_ms: AtomicU64,
    pub(crate) last_written_size: AtomicU64,
    pub(crate) last_nontrivial_write_duration_ms: AtomicU64,
    /// Unix millis; 0 means "never".
    pub(crate) last_nontrivial_write_start: AtomicI64,
}

impl DumpStatistics {
    pub(crate) fn record_load(&self, duration: Duration) {
        self.is_loaded.store(true, Ordering::Relaxed);
        self.is_current_from_dump.store(true, Ordering::Relaxed);
        self.load_duration_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, size: u64, duration: Duration, start: DateTime<Utc>) {
        self.last_written_size.store(size, Ordering::Relaxed);
        self.last_nontrivial_write_duration_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
        self.last_nontrivial_write_start
            .store(start.timestamp_millis(), Ordering::Relaxed);
    }

    fn to_json(&self) -> Value {
        json!({
            "is-loaded": self.is_loaded.load(Ordering::Relaxed),
            "is-current-from-dump": self.is_current_from_dump.load(Ordering::Relaxed),
            "load-duration": self.load_duration_ms.load(Ordering::Relaxed),
            "last-written-size": self.last_written_size.load(Ordering::Relaxed),
            "last-nontrivial-write-duration":
                self.last_nontrivial_write_duration_ms.load(Ordering::Relaxed),
            "last-nontrivial-write-start-time":
                time_to_json(load_time(&self.last_nontrivial_write_start)),
        })
    }
}

/// All statistics of a single cache.
#[derive(Debug, Default)]
pub struct CacheStatistics {
    pub(crate) full: UpdateCounters,
    pub(crate) incremental: UpdateCounters,
    pub(crate) documents_current_count: AtomicU64,
    pub(crate) dump: DumpStatistics,
}

impl CacheStatistics {
    pub(crate) fn counters(&self, update_type: UpdateType) -> &UpdateCounters {
        match update_type {
            UpdateType::Full => &self.full,
            UpdateType::Incremental => &self.incremental,
        }
    }

    /// Renders the statistics snapshot served by the metrics endpoint.
    pub fn to_json(&self) -> Value {
        let full = self.full.snapshot();
        let incremental = self.incremental.snapshot();
        let any = full.combined(&incremental);
        json!({
            "full": full.to_json(),
            "incremental": incremental.to_json(),
            "any": any.to_json(),
            "current-documents-count": self.documents_current_count.load(Ordering::Relaxed),
            "dump": self.dump.to_json(),
        })
    }
}

/// Scoped recorder for one update attempt.
///
/// Creating the scope counts the attempt; dropping it without
/// [`finish_success`](Self::finish_success) counts a failure, so an update that
/// is cancelled mid-flight is accounted for as well.
#[derive(Debug)]
pub struct UpdateStatisticsScope<'a> {
    counters: &'a UpdateCounters,
    start: Instant,
    started_at: DateTime<Utc>,
    finished: bool,
}

impl<'a> UpdateStatisticsScope<'a> {
    pub(crate) fn new(statistics: &'a CacheStatistics, update_type: UpdateType) -> Self {
        let counters = statistics.counters(update_type);
        let started_at = Utc::now();
        counters.attempts.fetch_add(1, Ordering::Relaxed);
        counters
            .last_attempt_start
            .store(started_at.timestamp_millis(), Ordering::Relaxed);
        UpdateStatisticsScope {
            counters,
            start: Instant::now(),
            started_at,
            finished: false,
        }
    }

    pub(crate) fn finish_success(mut self) -> Duration {
        self.counters.successes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_success_start
            .store(self.started_at.timestamp_millis(), Ordering::Relaxed);
        self.finished = true;
        self.start.elapsed()
    }
}

impl Drop for UpdateStatisticsScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn load_time(cell: &AtomicI64) -> Option<DateTime<Utc>> {
    let millis = cell.load(Ordering::Relaxed);
    if millis == 0 {
        return None;
    }
    DateTime::from_timestamp_millis(millis)
}

fn time_to_json(time: Option<DateTime<Utc>>) -> Value {
    match time {
        Some(time) => Value::String(time.to_rfc3339()),
        None => Value::Null,
    }
}
