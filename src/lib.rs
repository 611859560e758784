//! streamindex - hash-keyed secondary index for event-sourced transaction logs
//!
//! The index maps a stream id to the log positions of its events. Stream
//! ids are never stored: entries are keyed by a 64-bit hash, and the reader
//! resolves hash collisions by checking the log.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use streamindex::{
//!     CachingIndexBackend, IndexReader, IndexReaderConfig, TableIndex, TableIndexConfig,
//! };
//!
//! let config = TableIndexConfig::new("/var/lib/events/index");
//! let index = TableIndex::open(config.clone(), config.hasher_pair(), readers.clone())?;
//! index.initialize(log_checkpoint)?;
//!
//! index.add(commit_position, "orders-42", 0, log_position)?;
//!
//! let backend = Arc::new(CachingIndexBackend::new(readers));
//! let reader = IndexReader::new(backend, index, IndexReaderConfig::default())?;
//! let last = reader.get_stream_last_event_number("orders-42")?;
//! ```
//!
//! # Architecture
//!
//! - `streamindex-core`: hashing, entries, lookup results, log contract, errors
//! - `streamindex-storage`: memtables, table files, merges, the table index
//! - `streamindex-engine`: the cache backend and the collision-resolving reader

pub use streamindex_core::*;
pub use streamindex_engine::*;
pub use streamindex_storage::{
    new_table_path, ConfigError, IndexMap, MemTable, MergeOutput, Merger, PTable, TableIndex,
    TableIndexConfig,
};
