//! Table storage for the stream index
//!
//! This crate implements the durable side of the index:
//! - MemTable: concurrent in-memory buffer (DashMap + SmallVec buckets)
//! - PTable: immutable sorted table file with a midpoint cache
//! - Merger: k-way merge of a level's tables, upgrading 32-bit tables
//! - IndexMap: immutable level snapshot, persisted as the `indexmap` file
//! - TableIndex: rotation, background flush and merge, recovery
//!
//! # Concurrency
//!
//! The `TableIndex` publishes its state through `ArcSwap`:
//! - Lock-free reads of the current memtables and tables
//! - Tables superseded by a merge live until their last reader drops them
//! - Writers never wait for a flush

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod format;
pub mod index_map;
pub mod memtable;
pub mod merge;
pub mod ptable;
pub mod table_index;

pub use config::{ConfigError, TableIndexConfig};
pub use index_map::{AddResult, IndexMap};
pub use memtable::MemTable;
pub use merge::{MergeOutput, Merger};
pub use ptable::{new_table_path, PTable, PTableIter};
pub use table_index::TableIndex;
