//! Transaction log collaborator contract
//!
//! The index is derived from an append-only transaction log that lives
//! outside this workspace. The only thing the index needs from it is the
//! ability to read the record at a position, which is how hash collisions
//! are resolved: the record carries the real stream id.
//!
//! Readers are stateful (they keep a cursor for sequential reads) and are
//! handed out through a [`ReaderPool`] as scoped [`ReaderLease`]s.

mod pool;

pub use pool::{ReaderFactory, ReaderLease, ReaderPool};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// A prepared (written, possibly uncommitted) event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareLogRecord {
    /// Position of this record in the log
    pub log_position: u64,
    /// Position of the first record of the owning transaction
    pub transaction_position: u64,
    /// Unique event id
    pub event_id: Uuid,
    /// Correlation id of the write request
    pub correlation_id: Uuid,
    /// Stream the event belongs to
    pub event_stream_id: String,
    /// Expected version supplied by the writer
    pub expected_version: i64,
    /// Event number within the stream
    pub event_number: u32,
    /// Time the record was written
    pub timestamp: DateTime<Utc>,
    /// Event type name
    pub event_type: String,
    /// Event payload
    pub data: Vec<u8>,
    /// Event metadata payload
    pub metadata: Vec<u8>,
}

impl PrepareLogRecord {
    /// Create a single-event prepare with fresh ids and the current time
    pub fn new(
        log_position: u64,
        event_stream_id: impl Into<String>,
        event_number: u32,
        event_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        PrepareLogRecord {
            log_position,
            transaction_position: log_position,
            event_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            event_stream_id: event_stream_id.into(),
            expected_version: event_number as i64 - 1,
            event_number,
            timestamp: Utc::now(),
            event_type: event_type.into(),
            data,
            metadata: Vec::new(),
        }
    }
}

/// Commit marker for a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitLogRecord {
    /// Position of this record in the log
    pub log_position: u64,
    /// Position of the first prepare of the committed transaction
    pub transaction_position: u64,
    /// Event number assigned to the first event of the transaction
    pub first_event_number: u32,
    /// Time the record was written
    pub timestamp: DateTime<Utc>,
}

/// A record in the transaction log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Event write
    Prepare(PrepareLogRecord),
    /// Transaction commit
    Commit(CommitLogRecord),
}

impl LogRecord {
    /// Position of the record
    pub fn log_position(&self) -> u64 {
        match self {
            LogRecord::Prepare(p) => p.log_position,
            LogRecord::Commit(c) => c.log_position,
        }
    }

    /// The prepare, if this is one
    pub fn as_prepare(&self) -> Option<&PrepareLogRecord> {
        match self {
            LogRecord::Prepare(p) => Some(p),
            LogRecord::Commit(_) => None,
        }
    }

    /// Consume into the prepare, if this is one
    pub fn into_prepare(self) -> Option<PrepareLogRecord> {
        match self {
            LogRecord::Prepare(p) => Some(p),
            LogRecord::Commit(_) => None,
        }
    }
}

/// Result of a positional read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordReadResult {
    /// Whether a record was found at the position
    pub success: bool,
    /// Position following the record
    pub next_position: u64,
    /// The record, when `success`
    pub record: Option<LogRecord>,
    /// Encoded length of the record
    pub record_length: u32,
}

impl RecordReadResult {
    /// Nothing at the requested position
    pub fn failure() -> Self {
        RecordReadResult {
            success: false,
            next_position: 0,
            record: None,
            record_length: 0,
        }
    }

    /// A record was read
    pub fn found(record: LogRecord, next_position: u64, record_length: u32) -> Self {
        RecordReadResult {
            success: true,
            next_position,
            record: Some(record),
            record_length,
        }
    }
}

/// Result of a sequential read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqReadResult {
    /// Whether a record was read
    pub success: bool,
    /// Reader position before the read
    pub record_pre_position: u64,
    /// Reader position after the read
    pub record_post_position: u64,
    /// The record, when `success`
    pub record: Option<LogRecord>,
}

impl SeqReadResult {
    /// End of log in the read direction
    pub fn end(position: u64) -> Self {
        SeqReadResult {
            success: false,
            record_pre_position: position,
            record_post_position: position,
            record: None,
        }
    }
}

/// Reader over the transaction log
///
/// An `Err` means the log itself is unreadable. Retrying transient I/O
/// failures is the implementation's job; the index propagates whatever
/// comes back, since a derived index cannot answer without its source.
pub trait TransactionFileReader: Send {
    /// Move the sequential cursor
    fn reposition(&mut self, position: u64);

    /// Read forward from the cursor
    fn try_read_next(&mut self) -> Result<SeqReadResult>;

    /// Read backward from the cursor
    fn try_read_prev(&mut self) -> Result<SeqReadResult>;

    /// Read the record starting at `position`
    fn try_read_at(&mut self, position: u64) -> Result<RecordReadResult>;

    /// Whether a record starts at `position`
    fn exists_at(&mut self, position: u64) -> Result<bool>;
}

impl<T: TransactionFileReader + ?Sized> TransactionFileReader for Box<T> {
    fn reposition(&mut self, position: u64) {
        (**self).reposition(position)
    }

    fn try_read_next(&mut self) -> Result<SeqReadResult> {
        (**self).try_read_next()
    }

    fn try_read_prev(&mut self) -> Result<SeqReadResult> {
        (**self).try_read_prev()
    }

    fn try_read_at(&mut self, position: u64) -> Result<RecordReadResult> {
        (**self).try_read_at(position)
    }

    fn exists_at(&mut self, position: u64) -> Result<bool> {
        (**self).exists_at(position)
    }
}

/// Read the prepare at `position`, if one is there
pub fn read_prepare(
    reader: &mut dyn TransactionFileReader,
    position: u64,
) -> Result<Option<PrepareLogRecord>> {
    let result = reader.try_read_at(position)?;
    if !result.success {
        return Ok(None);
    }
    Ok(result.record.and_then(LogRecord::into_prepare))
}
