//! Core types for the stream index
//!
//! This crate defines the foundational types shared by the table storage
//! and the reader:
//! - Hasher pair: stream id → 64-bit index key
//! - IndexEntry: (key, event number, log position) record
//! - LastEventNumber: explicit lookup outcomes (found / no stream / invalid)
//! - Transaction log contract: the reader the index verifies collisions with
//! - ReaderPool / ReaderLease: scoped access to log readers
//! - IndexError: the shared error type

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry;
pub mod error;
pub mod event_number;
pub mod hash;
pub mod log;

pub use entry::{sort_newest_first, IndexEntry, PTableVersion};
pub use error::{IndexError, Result};
pub use event_number::{EventNumberCached, LastEventNumber};
pub use hash::{Hasher, HasherKind, HasherPair, Murmur3Hasher, XxHasher, HASH_SEED};
pub use log::{
    read_prepare, CommitLogRecord, LogRecord, PrepareLogRecord, ReaderFactory, ReaderLease,
    ReaderPool, RecordReadResult, SeqReadResult, TransactionFileReader,
};
