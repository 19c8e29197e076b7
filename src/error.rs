use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Why a single unwind step could not produce the caller's registers.
///
/// Decoded table entries are cached together with their errors, so this is
/// `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("no map contains pc {pc:#x}")]
    MapNotFound { pc: u64 },
    #[error("no unwind information covers pc {pc:#x}")]
    NoUnwindInfo { pc: u64 },
    #[error("malformed unwind table: {0}")]
    MalformedTable(String),
    #[error("failed to read {len} bytes at {addr:#x}")]
    MemoryReadFailure { addr: u64, len: usize },
    #[error("unwinding made no progress (pc {pc:#x}, sp {sp:#x})")]
    NonProgress { pc: u64, sp: u64 },
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedTable(msg.into())
    }
}

/// Failure to build a [`Maps`](crate::maps::Maps) table.
#[derive(Debug, Error)]
pub enum MapsError {
    #[error("failed to read maps: {0}")]
    Io(#[from] io::Error),
    #[error("invalid maps line {line_number}: {line:?}")]
    InvalidLine { line_number: usize, line: String },
    #[error("offline maps record truncated at byte {offset}")]
    Truncated { offset: usize },
    #[error("map {start:#x}-{end:#x} overlaps the map before it")]
    Overlap { start: u64, end: u64 },
    #[error("map {start:#x}-{end:#x} is empty")]
    EmptyRegion { start: u64, end: u64 },
}
