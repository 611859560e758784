//! Error types for the stream index
//!
//! This module defines the error type shared by every layer of the index.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Note that the two "negative" lookup outcomes, `NoStream` and `Invalid`,
//! are *not* errors. They are ordinary results carried by
//! [`LastEventNumber`](crate::LastEventNumber). Errors are reserved for
//! conditions where the index cannot do its job at all: an unreadable log,
//! a corrupt table, a failed disk write.

use std::io;
use thiserror::Error;

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, IndexError>;

/// Error types for the stream index
#[derive(Debug, Error)]
pub enum IndexError {
    /// I/O error (table files, index map, directory operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Persisted index state is inconsistent or unreadable
    #[error("Corrupt index: {0}")]
    Corrupt(String),

    /// Footer checksum does not match the content
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Expected CRC32 value (from file)
        expected: u32,
        /// Computed CRC32 value
        computed: u32,
    },

    /// File does not start with the expected magic bytes
    #[error("Invalid magic bytes")]
    InvalidMagic,

    /// Table format version is not known to this build
    #[error("Unsupported table version: {0}")]
    UnsupportedVersion(u8),

    /// Two entries share both hash and log position
    #[error("Duplicate index entry: hash {hash:016x} at log position {log_position}")]
    DuplicateEntry {
        /// Index key of the duplicated entry
        hash: u64,
        /// Log position shared by both entries
        log_position: u64,
    },

    /// The transaction log could not be read
    #[error("Log read error: {0}")]
    LogRead(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `initialize` has not been called yet
    #[error("Index is not initialized")]
    NotInitialized,

    /// `initialize` was called twice
    #[error("Index is already initialized")]
    AlreadyInitialized,

    /// The index has been closed
    #[error("Index is closed")]
    Closed,
}

impl IndexError {
    /// Create a new corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        IndexError::Corrupt(msg.into())
    }

    /// Create a new log read error
    pub fn log_read(msg: impl Into<String>) -> Self {
        IndexError::LogRead(msg.into())
    }

    /// Whether this error means persisted index state must be discarded
    ///
    /// The index is derived from the log, so a corrupt table or map is
    /// never fatal: it is thrown away and rebuilt.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            IndexError::Corrupt(_)
                | IndexError::ChecksumMismatch { .. }
                | IndexError::InvalidMagic
                | IndexError::UnsupportedVersion(_)
        )
    }
}
