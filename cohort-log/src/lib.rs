//! # Cohort Log
//!
//! Per-object append-only persistent log for the cohort runtime.
//!
//! Each replicated object journals its state transitions here as entries
//! carrying a strictly monotonic version number and a hybrid logical clock
//! timestamp. Replicas use the log to recover after a restart and to catch
//! up peers by shipping a serialized tail.
//!
//! ## Architecture
//!
//! - **Entries**: packed 64-byte records ([`LogEntry`]), payload bytes stored
//!   separately in the same virtual space.
//! - **Storage**: a [`SegmentStore`] divides a large virtual address space
//!   into fixed-size segments and maps the pages each log actually touches to
//!   physical segments of a single data file, first-fit over an occupancy
//!   bitmap. All metadata is recoverable from the store on open.
//! - **Durability**: appends are write-through but only become durable at
//!   [`PersistLog::persist`], which fsyncs data before metadata.

pub mod entry;
pub mod hlc;
pub mod log;
pub mod store;

pub use entry::{ENTRY_BYTES, LogEntry};
pub use hlc::Hlc;
pub use log::PersistLog;
pub use store::{LogConfig, MAX_NAME_BYTES, SegmentStore};

/// Version number meaning "no version": the latest version of an empty log,
/// and the `since` argument that selects the entire log when serializing.
pub const INVALID_VERSION: i64 = -1;

pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("version {given} does not exceed the latest version {latest}")]
    VersionOrder { given: i64, latest: i64 },
    #[error("hlc {given} is earlier than the latest hlc {latest}")]
    HlcOrder { given: Hlc, latest: Hlc },
    #[error("index {index} outside the live range [{head}, {tail})")]
    IndexOutOfRange { index: i64, head: i64, tail: i64 },
    #[error("no entry at or before the requested key")]
    EntryNotFound,
    #[error("received log tail overlaps the local log at version {version}")]
    TailOverlap { version: i64 },
    #[error("no free segments left in the store")]
    StoreFull,
    #[error("store already holds the maximum number of logs")]
    TooManyLogs,
    #[error("log name longer than {MAX_NAME_BYTES} bytes")]
    NameTooLong,
    #[error("destination buffer too small: {needed} > {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("store was created with a different configuration")]
    ConfigMismatch,
    #[error("store metadata is corrupt: {0}")]
    Corrupt(String),
}
