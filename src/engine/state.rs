use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

/// Mutable update bookkeeping of a single cache.
///
/// Protected by the engine's `tokio::sync::Mutex`; the update driver, the dump
/// engine, the bootstrap and the synchronous debug dumper all serialize on it.
#[derive(Debug, Default)]
pub(crate) struct UpdateData {
    /// Instant supplied to the most recent successful update. `None` means the
    /// cache has never loaded.
    pub last_update: Option<DateTime<Utc>>,
    /// Instant of the most recent update that actually mutated the contents.
    pub last_modifying_update: Option<DateTime<Utc>>,
    /// Monotonic instant of the last full update, for spacing full refreshes.
    pub last_full_update: Option<Instant>,
    /// The in-flight dump task, if any. At most one exists per cache.
    pub dump_task: Option<JoinHandle<()>>,
}

impl UpdateData {
    pub fn dump_task_in_flight(&self) -> bool {
        self.dump_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

/// Wall-clock instant stored as an atomic, advanced with a monotonic max.
///
/// Readers may briefly observe an older value, never a newer one than was
/// written. Microsecond resolution, matching dump file names; the zero value
/// means "never".
#[derive(Debug, Default)]
pub(crate) struct AtomicTimePoint(AtomicI64);

impl AtomicTimePoint {
    pub fn load(&self) -> Option<DateTime<Utc>> {
        let micros = self.0.load(Ordering::Relaxed);
        if micros == 0 {
            return None;
        }
        DateTime::from_timestamp_micros(micros)
    }

    pub fn fetch_max(&self, time: DateTime<Utc>) {
        self.0.fetch_max(time.timestamp_micros(), Ordering::Relaxed);
    }
}
