//! Stream reads over the table index
//!
//! This crate turns hash-keyed index entries into answers about streams:
//! - IndexBackend: stream info cache with optimistic version checks, and log reader leases
//! - IndexReader: last event number, event and stream reads with collision resolution
//! - IndexCommitter: writer-side path that indexes events and refreshes the cache
//! - testing: an in-memory transaction log
//!
//! The reader is the only component that knows two streams can share a key.
//! Everything below it deals in keys; everything above it deals in stream ids.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod committer;
pub mod reader;
pub mod testing;

pub use backend::{
    CachingIndexBackend, IndexBackend, MetadataCached, StreamAcl, StreamMetadata, SystemSettings,
};
pub use committer::IndexCommitter;
pub use reader::{
    IndexReader, IndexReaderConfig, ReadEventResult, ReadStreamResult, ReaderConfigError,
    ReaderStats, StreamEventsSlice, DEFAULT_HASH_COLLISION_READ_LIMIT, METASTREAM_PREFIX,
};
pub use testing::{InMemoryReader, InMemoryTransactionLog};
