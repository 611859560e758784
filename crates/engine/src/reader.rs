//! Collision-aware stream reads
//!
//! The table index is keyed by a hash of the stream id, so every entry it
//! returns is only a candidate: it may belong to another stream with the
//! same key. [`IndexReader`] confirms candidates by reading the record they
//! point at and comparing stream ids.
//!
//! # Read limit
//!
//! Resolving a stream's last event number scans candidates newest first.
//! A heavily shared key could make that scan arbitrarily long, so it gives
//! up after `hash_collision_read_limit` mismatches and answers
//! [`LastEventNumber::Invalid`]. That is "unknown", never "absent".
//!
//! # Caching
//!
//! A found last event number and resolved metadata are written back to the
//! [`IndexBackend`] cache with the version observed before resolving, so a
//! concurrent writer's value always wins over a stale resolution. `NoStream`
//! and `Invalid` are resolved again on every lookup.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use streamindex_core::{
    read_prepare, IndexError, LastEventNumber, PrepareLogRecord, Result, TransactionFileReader,
};
use streamindex_storage::TableIndex;
use thiserror::Error;
use tracing::{error, trace, warn};

use crate::backend::{IndexBackend, StreamMetadata};

/// Default number of colliding entries inspected per lookup
pub const DEFAULT_HASH_COLLISION_READ_LIMIT: usize = 100;

/// Prefix of the stream holding another stream's metadata
pub const METASTREAM_PREFIX: &str = "$$";

/// Reader configuration errors
#[derive(Debug, Error)]
pub enum ReaderConfigError {
    /// A zero read limit could never confirm a colliding stream
    #[error("hash_collision_read_limit must be at least 1")]
    ZeroReadLimit,
}

impl From<ReaderConfigError> for IndexError {
    fn from(e: ReaderConfigError) -> Self {
        IndexError::InvalidConfig(e.to_string())
    }
}

/// Configuration for [`IndexReader`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexReaderConfig {
    /// Mismatching entries tolerated before a lookup answers `Invalid`
    pub hash_collision_read_limit: usize,
}

impl Default for IndexReaderConfig {
    fn default() -> Self {
        IndexReaderConfig {
            hash_collision_read_limit: DEFAULT_HASH_COLLISION_READ_LIMIT,
        }
    }
}

impl IndexReaderConfig {
    /// Set the read limit
    pub fn with_hash_collision_read_limit(mut self, limit: usize) -> Self {
        self.hash_collision_read_limit = limit;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), ReaderConfigError> {
        if self.hash_collision_read_limit == 0 {
            return Err(ReaderConfigError::ZeroReadLimit);
        }
        Ok(())
    }
}

/// Outcome of reading a single event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEventResult {
    /// The event's record
    Success(PrepareLogRecord),
    /// The stream exists but has no such event
    NotFound,
    /// The stream does not exist
    NoStream,
}

/// A page of a stream read backwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventsSlice {
    /// Records, newest first
    pub records: Vec<PrepareLogRecord>,
    /// Where the next page starts, `None` at the beginning of the stream
    pub next_event_number: Option<u32>,
    /// Last event number of the stream at read time
    pub last_event_number: LastEventNumber,
    /// Whether this page reaches the first event
    pub is_end_of_stream: bool,
}

/// Outcome of a backward stream read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStreamResult {
    /// A page of events
    Success(StreamEventsSlice),
    /// The stream does not exist
    NoStream,
    /// No start was given and the stream's end could not be determined
    /// within the read limit
    Indeterminate,
}

/// Reader counters
///
/// Provides a snapshot of cache effectiveness and collision pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Lookups answered from the cache
    pub cached_stream_info: u64,
    /// Lookups resolved from the index and the log
    pub not_cached_stream_info: u64,
    /// Candidate entries that belonged to another stream
    pub hash_collisions: u64,
}

/// Resolves stream reads through the table index and the log
pub struct IndexReader {
    backend: Arc<dyn IndexBackend>,
    table_index: TableIndex,
    config: IndexReaderConfig,
    cached_stream_info: AtomicU64,
    not_cached_stream_info: AtomicU64,
    hash_collisions: AtomicU64,
}

impl IndexReader {
    /// Create a reader
    pub fn new(
        backend: Arc<dyn IndexBackend>,
        table_index: TableIndex,
        config: IndexReaderConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(IndexReader {
            backend,
            table_index,
            config,
            cached_stream_info: AtomicU64::new(0),
            not_cached_stream_info: AtomicU64::new(0),
            hash_collisions: AtomicU64::new(0),
        })
    }

    /// The table index
    pub fn table_index(&self) -> &TableIndex {
        &self.table_index
    }

    /// The backend
    pub fn backend(&self) -> &Arc<dyn IndexBackend> {
        &self.backend
    }

    /// Configuration
    pub fn config(&self) -> &IndexReaderConfig {
        &self.config
    }

    /// Last event number of `stream_id`
    ///
    /// Only `Found` results are written back to the cache. Keeping a cached
    /// value current after later writes is the writer's job; see
    /// [`IndexCommitter`](crate::IndexCommitter).
    pub fn get_stream_last_event_number(&self, stream_id: &str) -> Result<LastEventNumber> {
        let cached = self.backend.try_get_stream_last_event_number(stream_id);
        if let Some(value) = cached.last_event_number {
            self.cached_stream_info.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.not_cached_stream_info.fetch_add(1, Ordering::Relaxed);

        match self.resolve_last_event_number(stream_id)? {
            found @ LastEventNumber::Found(_) => Ok(self
                .backend
                .update_stream_last_event_number(cached.version, stream_id, found)),
            // The next write can change either answer, so neither is cached
            unresolved => Ok(unresolved),
        }
    }

    /// Read event `event_number` of `stream_id`
    pub fn read_event(&self, stream_id: &str, event_number: u32) -> Result<ReadEventResult> {
        match self.get_stream_last_event_number(stream_id)? {
            LastEventNumber::NoStream => return Ok(ReadEventResult::NoStream),
            LastEventNumber::Found(last) if event_number > last => {
                return Ok(ReadEventResult::NotFound)
            }
            // Invalid: the end is unknown, but the event may still be found
            _ => {}
        }

        let mut reader = self.backend.borrow_reader();
        Ok(match self.read_prepare_for(&mut *reader, stream_id, event_number)? {
            Some(record) => ReadEventResult::Success(record),
            None => ReadEventResult::NotFound,
        })
    }

    /// Read up to `max_count` events backwards, starting at `from_event_number`
    /// or at the end of the stream when `None`
    pub fn read_stream_events_backward(
        &self,
        stream_id: &str,
        from_event_number: Option<u32>,
        max_count: usize,
    ) -> Result<ReadStreamResult> {
        let last_event_number = self.get_stream_last_event_number(stream_id)?;
        let end = match (last_event_number, from_event_number) {
            (LastEventNumber::NoStream, _) => return Ok(ReadStreamResult::NoStream),
            (_, Some(from)) => from,
            (LastEventNumber::Found(last), None) => last,
            (LastEventNumber::Invalid, None) => return Ok(ReadStreamResult::Indeterminate),
        };

        if max_count == 0 {
            return Ok(ReadStreamResult::Success(StreamEventsSlice {
                records: Vec::new(),
                next_event_number: Some(end),
                last_event_number,
                is_end_of_stream: false,
            }));
        }

        let span = u32::try_from(max_count - 1).unwrap_or(u32::MAX);
        let start = end.saturating_sub(span);

        let candidates = self.table_index.get_range(stream_id, start, end, None)?;
        let mut reader = self.backend.borrow_reader();
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for entry in candidates {
            if seen.contains(&entry.event_number) {
                continue;
            }
            match read_prepare(&mut *reader, entry.log_position)? {
                Some(record) if record.event_stream_id == stream_id => {
                    seen.insert(entry.event_number);
                    records.push(record);
                }
                _ => self.note_collision(stream_id, entry.log_position),
            }
        }
        records.sort_by(|a, b| b.event_number.cmp(&a.event_number));

        let is_end_of_stream = start == 0;
        let next_event_number = if is_end_of_stream {
            None
        } else {
            let before = start - 1;
            Some(match last_event_number {
                LastEventNumber::Found(last) => before.min(last),
                _ => before,
            })
        };
        Ok(ReadStreamResult::Success(StreamEventsSlice {
            records,
            next_event_number,
            last_event_number,
            is_end_of_stream,
        }))
    }

    /// Metadata of `stream_id`, read from its metastream
    ///
    /// Streams without metadata, and metadata that does not parse, yield
    /// the default.
    pub fn get_stream_metadata(&self, stream_id: &str) -> Result<StreamMetadata> {
        let cached = self.backend.try_get_stream_metadata(stream_id);
        if let Some(metadata) = cached.metadata {
            self.cached_stream_info.fetch_add(1, Ordering::Relaxed);
            return Ok(metadata);
        }
        self.not_cached_stream_info.fetch_add(1, Ordering::Relaxed);

        let metastream = format!("{}{}", METASTREAM_PREFIX, stream_id);
        let metadata = match self.get_stream_last_event_number(&metastream)? {
            LastEventNumber::Found(last) => {
                let mut reader = self.backend.borrow_reader();
                match self.read_prepare_for(&mut *reader, &metastream, last)? {
                    Some(record) => StreamMetadata::from_json(&record.data).unwrap_or_else(|e| {
                        warn!(
                            target: "streamindex::reader",
                            stream_id,
                            error = %e,
                            "Unreadable stream metadata, using defaults"
                        );
                        StreamMetadata::default()
                    }),
                    None => StreamMetadata::default(),
                }
            }
            _ => StreamMetadata::default(),
        };
        Ok(self
            .backend
            .update_stream_metadata(cached.version, stream_id, metadata))
    }

    /// Counter snapshot
    pub fn statistics(&self) -> ReaderStats {
        ReaderStats {
            cached_stream_info: self.cached_stream_info.load(Ordering::Relaxed),
            not_cached_stream_info: self.not_cached_stream_info.load(Ordering::Relaxed),
            hash_collisions: self.hash_collisions.load(Ordering::Relaxed),
        }
    }

    fn resolve_last_event_number(&self, stream_id: &str) -> Result<LastEventNumber> {
        let Some(latest) = self.table_index.try_get_latest_entry(stream_id)? else {
            return Ok(LastEventNumber::NoStream);
        };

        let mut reader = self.backend.borrow_reader();
        let record = read_prepare(&mut *reader, latest.log_position)?.ok_or_else(|| {
            IndexError::corrupt(format!(
                "no prepare at log position {} for the latest entry of stream {}",
                latest.log_position, stream_id
            ))
        })?;
        if record.event_stream_id == stream_id {
            return Ok(LastEventNumber::Found(latest.event_number));
        }

        let limit = self.config.hash_collision_read_limit;
        let candidates = self
            .table_index
            .get_range(stream_id, 0, u32::MAX, Some(limit + 1))?;
        let mut mismatches = 0usize;
        for entry in candidates {
            match read_prepare(&mut *reader, entry.log_position)? {
                Some(record) if record.event_stream_id == stream_id => {
                    return Ok(LastEventNumber::Found(entry.event_number));
                }
                _ => {
                    self.note_collision(stream_id, entry.log_position);
                    mismatches += 1;
                    if mismatches > limit {
                        error!(
                            target: "streamindex::reader",
                            stream_id,
                            limit,
                            "Hash collision read limit reached, last event number is unknown"
                        );
                        return Ok(LastEventNumber::Invalid);
                    }
                }
            }
        }
        Ok(LastEventNumber::NoStream)
    }

    /// The record of `event_number` in `stream_id`, skipping colliding streams
    fn read_prepare_for(
        &self,
        reader: &mut dyn TransactionFileReader,
        stream_id: &str,
        event_number: u32,
    ) -> Result<Option<PrepareLogRecord>> {
        let Some(position) = self.table_index.try_get_one_value(stream_id, event_number)? else {
            return Ok(None);
        };
        if let Some(record) = read_prepare(reader, position)? {
            if record.event_stream_id == stream_id {
                return Ok(Some(record));
            }
        }
        self.note_collision(stream_id, position);

        for entry in self
            .table_index
            .get_range(stream_id, event_number, event_number, None)?
        {
            if entry.log_position == position {
                continue;
            }
            match read_prepare(reader, entry.log_position)? {
                Some(record) if record.event_stream_id == stream_id => return Ok(Some(record)),
                _ => self.note_collision(stream_id, entry.log_position),
            }
        }
        Ok(None)
    }

    fn note_collision(&self, stream_id: &str, log_position: u64) {
        self.hash_collisions.fetch_add(1, Ordering::Relaxed);
        trace!(
            target: "streamindex::reader",
            stream_id,
            log_position,
            "Entry belongs to a colliding stream"
        );
    }
}

impl std::fmt::Debug for IndexReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexReader")
            .field("table_index", &self.table_index)
            .field("config", &self.config)
            .field("stats", &self.statistics())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CachingIndexBackend;
    use crate::testing::InMemoryTransactionLog;
    use streamindex_storage::TableIndexConfig;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        log: InMemoryTransactionLog,
        index: TableIndex,
        backend: Arc<CachingIndexBackend>,
        reader: IndexReader,
    }

    fn fixture(limit: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let log = InMemoryTransactionLog::new();
        let config = TableIndexConfig::for_testing(dir.path());
        let hashers = config.hasher_pair();
        let index = TableIndex::open(config, hashers, log.reader_pool(2)).unwrap();
        index.initialize(u64::MAX).unwrap();

        let backend = Arc::new(CachingIndexBackend::new(log.reader_pool(2)));
        let reader = IndexReader::new(
            backend.clone(),
            index.clone(),
            IndexReaderConfig::default().with_hash_collision_read_limit(limit),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            log,
            index,
            backend,
            reader,
        }
    }

    impl Fixture {
        fn write(&self, position: u64, stream_id: &str, event_number: u32) {
            self.log.append_prepare(position, stream_id, event_number);
            self.index
                .add(position, stream_id, event_number, position)
                .unwrap();
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(IndexReaderConfig::default().validate().is_ok());
        let zero = IndexReaderConfig::default().with_hash_collision_read_limit(0);
        assert!(matches!(zero.validate(), Err(ReaderConfigError::ZeroReadLimit)));
    }

    #[test]
    fn test_unknown_stream() {
        let f = fixture(5);
        assert_eq!(
            f.reader.get_stream_last_event_number("nobody").unwrap(),
            LastEventNumber::NoStream
        );
        assert_eq!(f.reader.read_event("nobody", 0).unwrap(), ReadEventResult::NoStream);
    }

    #[test]
    fn test_last_event_number_is_cached() {
        let f = fixture(5);
        f.write(0, "orders", 0);
        f.write(1, "orders", 1);

        assert_eq!(
            f.reader.get_stream_last_event_number("orders").unwrap(),
            LastEventNumber::Found(1)
        );
        assert_eq!(
            f.reader.get_stream_last_event_number("orders").unwrap(),
            LastEventNumber::Found(1)
        );
        let stats = f.reader.statistics();
        assert_eq!(stats.not_cached_stream_info, 1);
        assert_eq!(stats.cached_stream_info, 1);
        assert_eq!(stats.hash_collisions, 0);
    }

    #[test]
    fn test_first_write_visible_after_no_stream_lookup() {
        let f = fixture(5);
        assert_eq!(
            f.reader.get_stream_last_event_number("orders").unwrap(),
            LastEventNumber::NoStream
        );
        assert!(!f.backend.try_get_stream_last_event_number("orders").is_cached());

        f.write(0, "orders", 0);
        assert_eq!(
            f.reader.get_stream_last_event_number("orders").unwrap(),
            LastEventNumber::Found(0)
        );
        assert_eq!(f.index.entries_for("orders").unwrap().len(), 1);
    }

    #[test]
    fn test_writer_value_beats_cached_resolution() {
        let f = fixture(5);
        f.write(0, "orders", 0);
        f.reader.get_stream_last_event_number("orders").unwrap();

        // The writer publishes the new end before the index catches up
        f.backend
            .set_stream_last_event_number("orders", LastEventNumber::Found(1));
        assert_eq!(
            f.reader.get_stream_last_event_number("orders").unwrap(),
            LastEventNumber::Found(1)
        );
    }

    #[test]
    fn test_read_event() {
        let f = fixture(5);
        f.write(0, "orders", 0);
        f.write(1, "orders", 1);

        match f.reader.read_event("orders", 1).unwrap() {
            ReadEventResult::Success(record) => {
                assert_eq!(record.log_position, 1);
                assert_eq!(record.event_number, 1);
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(f.reader.read_event("orders", 2).unwrap(), ReadEventResult::NotFound);
    }

    #[test]
    fn test_missing_latest_record_is_corruption() {
        let f = fixture(5);
        f.index.add(0, "ghost", 0, 42).unwrap();
        let err = f.reader.get_stream_last_event_number("ghost").unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_read_backward_pages() {
        let f = fixture(5);
        for i in 0..7u32 {
            f.write(i as u64, "orders", i);
        }

        let ReadStreamResult::Success(first) =
            f.reader.read_stream_events_backward("orders", None, 3).unwrap()
        else {
            panic!("expected a page");
        };
        let numbers: Vec<u32> = first.records.iter().map(|r| r.event_number).collect();
        assert_eq!(numbers, vec![6, 5, 4]);
        assert_eq!(first.next_event_number, Some(3));
        assert!(!first.is_end_of_stream);

        let ReadStreamResult::Success(last) = f
            .reader
            .read_stream_events_backward("orders", Some(2), 3)
            .unwrap()
        else {
            panic!("expected a page");
        };
        let numbers: Vec<u32> = last.records.iter().map(|r| r.event_number).collect();
        assert_eq!(numbers, vec![2, 1, 0]);
        assert!(last.is_end_of_stream);
        assert_eq!(last.next_event_number, None);
    }

    #[test]
    fn test_read_backward_unknown_stream() {
        let f = fixture(5);
        assert_eq!(
            f.reader.read_stream_events_backward("nobody", None, 10).unwrap(),
            ReadStreamResult::NoStream
        );
    }

    #[test]
    fn test_stream_metadata_from_metastream() {
        let f = fixture(5);
        f.write(0, "orders", 0);
        let data = br#"{"$maxCount":50}"#.to_vec();
        f.log.insert(streamindex_core::LogRecord::Prepare(PrepareLogRecord::new(
            1,
            "$$orders",
            0,
            "$metadata",
            data,
        )));
        f.index.add(1, "$$orders", 0, 1).unwrap();

        let metadata = f.reader.get_stream_metadata("orders").unwrap();
        assert_eq!(metadata.max_count, Some(50));
        assert_eq!(
            f.backend.try_get_stream_metadata("orders").metadata,
            Some(metadata)
        );
        assert_eq!(
            f.reader.get_stream_metadata("users").unwrap(),
            StreamMetadata::default()
        );
    }
}
