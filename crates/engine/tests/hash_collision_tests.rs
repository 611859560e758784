//! Hash collision resolution tests
//!
//! Two streams whose keys are equal are indistinguishable to the table
//! index. These tests drive the reader through such collisions:
//! - The read limit bounds the scan and yields `Invalid` when exhausted
//! - A larger limit reaches the true entry
//! - Colliding entries never make an absent stream appear to exist
//! - Resolutions stay correct while tables are flushed and merged

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rand::Rng;
use streamindex_core::{
    Hasher, HasherPair, LastEventNumber, LogRecord, PTableVersion, PrepareLogRecord, ReaderPool,
    RecordReadResult, Result, SeqReadResult, TransactionFileReader,
};
use streamindex_engine::{
    CachingIndexBackend, IndexCommitter, IndexReader, IndexReaderConfig, InMemoryTransactionLog,
    ReadEventResult,
};
use streamindex_storage::{TableIndex, TableIndexConfig};
use tempfile::TempDir;

// ============================================================================
// Helpers
// ============================================================================

const ACCOUNT: &str = "account--696193173";
const LPN: &str = "LPN-FC002_LPK51001";

/// Hashes by length, so any two ids of equal length collide
struct LengthHasher;

impl Hasher for LengthHasher {
    fn hash(&self, stream_id: &str) -> u32 {
        stream_id.len() as u32
    }

    fn name(&self) -> &'static str {
        "length"
    }
}

fn colliding_hashers() -> HasherPair {
    HasherPair::new(Arc::new(LengthHasher), Arc::new(LengthHasher))
}

/// Log where even positions hold ACCOUNT events and odd positions LPN events
struct ParityLog;

impl TransactionFileReader for ParityLog {
    fn reposition(&mut self, _position: u64) {}

    fn try_read_next(&mut self) -> Result<SeqReadResult> {
        Ok(SeqReadResult::end(0))
    }

    fn try_read_prev(&mut self) -> Result<SeqReadResult> {
        Ok(SeqReadResult::end(0))
    }

    fn try_read_at(&mut self, position: u64) -> Result<RecordReadResult> {
        let stream = if position % 2 == 0 { ACCOUNT } else { LPN };
        let record = PrepareLogRecord::new(position, stream, 0, "type", Vec::new());
        Ok(RecordReadResult::found(LogRecord::Prepare(record), position + 1, 1))
    }

    fn exists_at(&mut self, _position: u64) -> Result<bool> {
        Ok(true)
    }
}

struct Scenario {
    _dir: TempDir,
    index: TableIndex,
    reader: IndexReader,
}

/// 32-bit index with tiny memtables, read through the parity log
fn scenario(read_limit: usize, entries: &[(&str, u32, u64)]) -> Scenario {
    let dir = TempDir::new().unwrap();
    let config = TableIndexConfig::new(dir.path())
        .with_version(PTableVersion::V1)
        .with_max_size_for_memory(5)
        .with_max_tables_per_level(2);
    let readers = ReaderPool::new(|| Box::new(ParityLog), 1);
    let index = TableIndex::open(config, colliding_hashers(), readers.clone()).unwrap();
    index.initialize(u64::MAX).unwrap();

    for &(stream, event_number, position) in entries {
        index.add(1, stream, event_number, position).unwrap();
    }
    index.wait_for_background();

    let backend = Arc::new(CachingIndexBackend::new(readers));
    let reader = IndexReader::new(
        backend,
        index.clone(),
        IndexReaderConfig::default().with_hash_collision_read_limit(read_limit),
    )
    .unwrap();
    Scenario {
        _dir: dir,
        index,
        reader,
    }
}

/// The account's only event, buried under four newer LPN events
const BURIED: &[(&str, u32, u64)] = &[
    (ACCOUNT, 0, 0),
    (LPN, 0, 3),
    (LPN, 1, 5),
    (LPN, 2, 7),
    (LPN, 3, 9),
];

fn buried_with_one_more() -> Vec<(&'static str, u32, u64)> {
    let mut entries = BURIED.to_vec();
    entries.push((LPN, 4, 13));
    entries
}

// ============================================================================
// Read Limit Scenarios
// ============================================================================

mod read_limit {
    use super::*;

    #[test]
    fn test_stream_does_not_exist() {
        let s = scenario(5, &[(LPN, 0, 3), (LPN, 1, 5)]);
        assert_eq!(
            s.reader.get_stream_last_event_number(ACCOUNT).unwrap(),
            LastEventNumber::NoStream
        );
    }

    #[test]
    fn test_nothing_written() {
        let s = scenario(5, &[]);
        assert_eq!(
            s.reader.get_stream_last_event_number(ACCOUNT).unwrap(),
            LastEventNumber::NoStream
        );
    }

    #[test]
    fn test_stream_out_of_range_of_read_limit() {
        let s = scenario(1, &buried_with_one_more());
        assert_eq!(s.index.table_count(), 1);
        assert_eq!(
            s.reader.get_stream_last_event_number(ACCOUNT).unwrap(),
            LastEventNumber::Invalid
        );
    }

    #[test]
    fn test_stream_in_range_of_read_limit() {
        let s = scenario(5, &buried_with_one_more());
        assert_eq!(
            s.reader.get_stream_last_event_number(ACCOUNT).unwrap(),
            LastEventNumber::Found(0)
        );
    }

    #[test]
    fn test_read_limit_not_reached() {
        let s = scenario(3, BURIED);
        assert_eq!(
            s.reader.get_stream_last_event_number(ACCOUNT).unwrap(),
            LastEventNumber::Invalid
        );
    }

    #[test]
    fn test_unknown_result_is_not_cached() {
        let s = scenario(1, &buried_with_one_more());
        assert_eq!(
            s.reader.get_stream_last_event_number(ACCOUNT).unwrap(),
            LastEventNumber::Invalid
        );

        // A reader with a larger limit over the same cache still resolves it
        let patient = IndexReader::new(
            Arc::clone(s.reader.backend()),
            s.index.clone(),
            IndexReaderConfig::default().with_hash_collision_read_limit(5),
        )
        .unwrap();
        assert_eq!(
            patient.get_stream_last_event_number(ACCOUNT).unwrap(),
            LastEventNumber::Found(0)
        );
        assert_eq!(
            s.reader.get_stream_last_event_number(ACCOUNT).unwrap(),
            LastEventNumber::Found(0)
        );
    }

    #[test]
    fn test_larger_limit_only_improves() {
        let entries = buried_with_one_more();
        let results: Vec<LastEventNumber> = (1..=8)
            .map(|limit| {
                scenario(limit, &entries)
                    .reader
                    .get_stream_last_event_number(ACCOUNT)
                    .unwrap()
            })
            .collect();

        // Once resolved, a larger limit never loses the answer
        let first_found = results
            .iter()
            .position(|r| *r == LastEventNumber::Found(0))
            .unwrap();
        assert!(results[..first_found]
            .iter()
            .all(|r| *r == LastEventNumber::Invalid));
        assert!(results[first_found..]
            .iter()
            .all(|r| *r == LastEventNumber::Found(0)));
    }

    #[test]
    fn test_newest_stream_needs_no_scan() {
        let s = scenario(1, &buried_with_one_more());
        assert_eq!(
            s.reader.get_stream_last_event_number(LPN).unwrap(),
            LastEventNumber::Found(4)
        );
        assert_eq!(s.reader.statistics().hash_collisions, 0);
    }

    #[test]
    fn test_collisions_are_counted() {
        let s = scenario(5, &buried_with_one_more());
        s.reader.get_stream_last_event_number(ACCOUNT).unwrap();
        assert_eq!(s.reader.statistics().hash_collisions, 5);
    }

    #[test]
    fn test_read_event_skips_colliding_stream() {
        let s = scenario(5, &buried_with_one_more());
        // Event 0 exists in both streams; the LPN one is newer
        match s.reader.read_event(ACCOUNT, 0).unwrap() {
            ReadEventResult::Success(record) => {
                assert_eq!(record.event_stream_id, ACCOUNT);
                assert_eq!(record.log_position, 0);
            }
            other => panic!("expected the account event, got {:?}", other),
        }
        assert_eq!(s.reader.read_event(ACCOUNT, 1).unwrap(), ReadEventResult::NotFound);
    }
}

// ============================================================================
// Collisions Under Load
// ============================================================================

mod under_load {
    use super::*;

    /// Streams "c-0" .. "c-9" all share one key under the length hasher
    fn stream_name(i: usize) -> String {
        format!("c-{}", i)
    }

    struct Live {
        _dir: TempDir,
        log: InMemoryTransactionLog,
        index: TableIndex,
        committer: IndexCommitter,
        reader: Arc<IndexReader>,
    }

    fn live(read_limit: usize) -> Live {
        let dir = TempDir::new().unwrap();
        let log = InMemoryTransactionLog::new();
        let config = TableIndexConfig::for_testing(dir.path());
        let index = TableIndex::open(config, colliding_hashers(), log.reader_pool(4)).unwrap();
        index.initialize(u64::MAX).unwrap();
        let backend = Arc::new(CachingIndexBackend::new(log.reader_pool(4)));
        let committer = IndexCommitter::new(backend.clone(), index.clone());
        let reader = Arc::new(
            IndexReader::new(
                backend.clone(),
                index.clone(),
                IndexReaderConfig::default().with_hash_collision_read_limit(read_limit),
            )
            .unwrap(),
        );
        Live {
            _dir: dir,
            log,
            index,
            committer,
            reader,
        }
    }

    #[test]
    fn test_random_interleaving_resolves_every_stream() {
        let l = live(1_000);
        let mut rng = rand::thread_rng();
        let mut last = vec![None::<u32>; 10];

        for position in 0..300u64 {
            let i = rng.gen_range(0..10);
            let stream = stream_name(i);
            let event_number = last[i].map_or(0, |n| n + 1);
            l.log.append_prepare(position, &stream, event_number);
            l.index.add(position, &stream, event_number, position).unwrap();
            last[i] = Some(event_number);
        }
        l.index.wait_for_background();

        for (i, expected) in last.iter().enumerate() {
            let expected = match expected {
                Some(n) => LastEventNumber::Found(*n),
                None => LastEventNumber::NoStream,
            };
            assert_eq!(
                l.reader.get_stream_last_event_number(&stream_name(i)).unwrap(),
                expected
            );
        }
        // Same length, never written
        assert_eq!(
            l.reader.get_stream_last_event_number("c-x").unwrap(),
            LastEventNumber::NoStream
        );
    }

    #[test]
    fn test_concurrent_readers_during_flushes() {
        let l = live(1_000);
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let reader = Arc::clone(&l.reader);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    while !done.load(Ordering::Acquire) {
                        let stream = stream_name(rng.gen_range(0..4));
                        let result = reader.get_stream_last_event_number(&stream).unwrap();
                        assert_ne!(result, LastEventNumber::Invalid);
                    }
                })
            })
            .collect();

        for round in 0..50u32 {
            for i in 0..4usize {
                let position = (round as u64) * 4 + i as u64;
                let stream = stream_name(i);
                l.log.append_prepare(position, &stream, round);
                l.committer
                    .commit_event(position, &stream, round, position)
                    .unwrap();
            }
        }
        l.index.wait_for_background();
        done.store(true, Ordering::Release);
        for handle in readers {
            handle.join().unwrap();
        }

        for i in 0..4 {
            assert_eq!(
                l.reader.get_stream_last_event_number(&stream_name(i)).unwrap(),
                LastEventNumber::Found(49)
            );
        }
    }
}
