//! On-disk cache dumps.
//!
//! A dump is a serialized snapshot of the cache, stored in a file whose name
//! embeds the update instant it reflects (truncated to microseconds) and the
//! dump format version. Renaming a dump file changes its advertised timestamp
//! without rewriting its contents.

use chrono::{DateTime, Utc};
use thiserror::Error;

mod io;
mod manager;

pub use io::{DumpReader, DumpWriter};
pub use manager::{DumpFileStats, DumpManager};

/// Errors produced while writing or reading a dump.
#[derive(Debug, Error)]
pub enum DumpError {
    /// The cache became empty between the dump decision and the write. Treated
    /// as a benign skip, not a failure.
    #[error("cache is empty")]
    EmptyCache,

    /// Dumps are enabled for a cache whose serializer pair was left at the
    /// default. This is a configuration error in the embedding service.
    #[error("cache dumps are enabled, but the serializer pair is unimplemented")]
    Unimplemented,

    /// The dump file contents do not match what the deserializer expects.
    #[error("malformed dump: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Truncates an instant to the microsecond resolution used in dump file names,
/// so that a recorded update instant round-trips through a file name exactly.
pub fn truncate_to_micros(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(time.timestamp_micros()).unwrap_or(time)
}
