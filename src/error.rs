//! Defines the error types used throughout lodestore.
use std::fmt;
use std::io;

/// The primary error enum for all fallible operations in lodestore.
#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The on-disk state is damaged in a way the store cannot repair.
    ///
    /// This is returned while opening a store; once a store is open,
    /// corruption discovered during a log scan is treated as fatal and
    /// panics, because continuing would silently serve wrong data.
    Corrupt(String),
    /// Wraps an error originating from the log layer.
    Log(LogError),
    /// Represents an error in the store configuration.
    Config(String),
    /// A page referenced through the mapping table no longer exists.
    PageNotFound,
    /// The store has been closed and no longer accepts operations.
    Closed,
}

/// A specific error originating from the append-only log.
#[derive(Debug, PartialEq, Eq)]
pub enum LogError {
    /// An underlying I/O error from the filesystem.
    Io(String),
    /// Neither copy of the superblock passed validation.
    CorruptSuperBlock,
    /// A read was attempted at an offset that has been trimmed away.
    TrimmedOffset(u64),
    /// A read ended before the requested number of bytes was available.
    ShortRead,
    /// A single reservation exceeds the flush buffer capacity.
    ReservationTooLarge(usize),
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::Io(e) => write!(f, "I/O error: {}", e),
            LogError::CorruptSuperBlock => write!(f, "superblock is corrupted"),
            LogError::TrimmedOffset(off) => {
                write!(f, "offset {} lies before the log head", off)
            }
            LogError::ShortRead => write!(f, "log read ended prematurely"),
            LogError::ReservationTooLarge(sz) => {
                write!(f, "reservation of {} bytes exceeds the flush buffer", sz)
            }
        }
    }
}

impl std::error::Error for LogError {}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Corrupt(e) => write!(f, "corrupt store: {}", e),
            StoreError::Log(e) => write!(f, "log error: {}", e),
            StoreError::Config(e) => write!(f, "configuration error: {}", e),
            StoreError::PageNotFound => write!(f, "page not found in mapping table"),
            StoreError::Closed => write!(f, "store is closed"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for LogError {
    fn from(err: io::Error) -> Self {
        LogError::Io(err.to_string())
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Log(LogError::Io(err.to_string()))
    }
}

impl From<LogError> for StoreError {
    fn from(err: LogError) -> Self {
        StoreError::Log(err)
    }
}
