//! End-to-end collision tests with the real hashers
//!
//! "stream-44000" and "stream-182752" share their xxHash (low) half, so a
//! 32-bit index cannot tell them apart while a 64-bit index can.

mod common;

use common::{init_tracing, Stack};
use streamindex::{HasherPair, LastEventNumber, PTableVersion, ReadEventResult, ReadStreamResult};

const FIRST: &str = "stream-44000";
const SECOND: &str = "stream-182752";

// ============================================================================
// Hasher Properties
// ============================================================================

#[test]
fn test_known_pair_collides_on_low_hash_only() {
    let hashers = HasherPair::default();
    assert_eq!(hashers.low(FIRST), hashers.low(SECOND));
    assert_ne!(hashers.high(FIRST), hashers.high(SECOND));
    assert_ne!(hashers.combined(FIRST), hashers.combined(SECOND));
    assert_eq!(
        hashers.key_for(PTableVersion::V1, FIRST),
        hashers.key_for(PTableVersion::V1, SECOND)
    );
}

// ============================================================================
// 32-bit Index
// ============================================================================

#[test]
fn test_v1_index_resolves_colliding_streams() {
    init_tracing();
    let stack = Stack::new(PTableVersion::V1, 10);

    // Interleave the two streams across several flushes
    for i in 0..12u32 {
        stack.write(2 * i as u64, FIRST, i);
        stack.write(2 * i as u64 + 1, SECOND, i / 2);
    }
    stack.write(24, FIRST, 12);
    stack.index.wait_for_background();

    // The index alone mixes them up
    assert_eq!(stack.index.entries_for(FIRST).unwrap().len(), 25);

    assert_eq!(
        stack.reader.get_stream_last_event_number(FIRST).unwrap(),
        LastEventNumber::Found(12)
    );
    assert_eq!(
        stack.reader.get_stream_last_event_number(SECOND).unwrap(),
        LastEventNumber::Found(5)
    );
    assert!(stack.reader.statistics().hash_collisions >= 1);
}

#[test]
fn test_v1_index_reads_the_right_event() {
    init_tracing();
    let stack = Stack::new(PTableVersion::V1, 10);
    stack.write(0, FIRST, 0);
    stack.write(1, SECOND, 0);
    stack.write(2, SECOND, 1);

    match stack.reader.read_event(FIRST, 0).unwrap() {
        ReadEventResult::Success(record) => {
            assert_eq!(record.event_stream_id, FIRST);
            assert_eq!(record.log_position, 0);
        }
        other => panic!("expected the first stream's event, got {:?}", other),
    }
    assert_eq!(
        stack.reader.read_event(FIRST, 1).unwrap(),
        ReadEventResult::NotFound
    );
}

#[test]
fn test_v1_backward_read_filters_other_stream() {
    init_tracing();
    let stack = Stack::new(PTableVersion::V1, 10);
    for i in 0..4u32 {
        stack.write(2 * i as u64, FIRST, i);
        stack.write(2 * i as u64 + 1, SECOND, i);
    }

    let ReadStreamResult::Success(slice) = stack
        .reader
        .read_stream_events_backward(SECOND, None, 10)
        .unwrap()
    else {
        panic!("expected a page");
    };
    assert!(slice.is_end_of_stream);
    assert_eq!(slice.records.len(), 4);
    assert!(slice.records.iter().all(|r| r.event_stream_id == SECOND));
    let numbers: Vec<u32> = slice.records.iter().map(|r| r.event_number).collect();
    assert_eq!(numbers, vec![3, 2, 1, 0]);
}

// ============================================================================
// 64-bit Index
// ============================================================================

#[test]
fn test_v2_index_separates_the_pair() {
    init_tracing();
    let stack = Stack::new(PTableVersion::V2, 1);
    for i in 0..8u32 {
        stack.write(2 * i as u64, FIRST, i);
        stack.write(2 * i as u64 + 1, SECOND, i);
    }
    stack.index.wait_for_background();

    assert_eq!(stack.index.entries_for(FIRST).unwrap().len(), 8);
    assert_eq!(
        stack.reader.get_stream_last_event_number(FIRST).unwrap(),
        LastEventNumber::Found(7)
    );
    assert_eq!(stack.reader.statistics().hash_collisions, 0);
}
