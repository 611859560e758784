//! In-memory transaction log
//!
//! A log that lives in memory, for tests and benchmarks. Records are keyed
//! by position; positions need not be contiguous, so a test can place a
//! record exactly where an index entry points.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use streamindex_core::{
    CommitLogRecord, LogRecord, PrepareLogRecord, ReaderPool, RecordReadResult, Result,
    SeqReadResult, TransactionFileReader,
};

/// Length reported for every record
const RECORD_LENGTH: u32 = 1;

/// Shared in-memory log
///
/// Clones share the same records.
#[derive(Clone, Default)]
pub struct InMemoryTransactionLog {
    records: Arc<RwLock<BTreeMap<u64, LogRecord>>>,
}

impl InMemoryTransactionLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a single-event prepare at `position`, replacing whatever was there
    pub fn append_prepare(&self, position: u64, stream_id: &str, event_number: u32) {
        let record = PrepareLogRecord::new(position, stream_id, event_number, "test-event", Vec::new());
        self.records.write().insert(position, LogRecord::Prepare(record));
    }

    /// Append a commit at `position` for the transaction starting at `transaction_position`
    pub fn append_commit(&self, position: u64, transaction_position: u64, first_event_number: u32) {
        let record = CommitLogRecord {
            log_position: position,
            transaction_position,
            first_event_number,
            timestamp: Utc::now(),
        };
        self.records.write().insert(position, LogRecord::Commit(record));
    }

    /// Insert an arbitrary record at its own position
    pub fn insert(&self, record: LogRecord) {
        self.records.write().insert(record.log_position(), record);
    }

    /// Position following the last record
    pub fn end_position(&self) -> u64 {
        self.records
            .read()
            .keys()
            .next_back()
            .map_or(0, |last| last + 1)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the log has no records
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// A reader positioned at the start of the log
    pub fn reader(&self) -> InMemoryReader {
        InMemoryReader {
            log: self.clone(),
            position: 0,
        }
    }

    /// A reader pool over this log
    pub fn reader_pool(&self, max_idle: usize) -> ReaderPool {
        let log = self.clone();
        ReaderPool::new(move || Box::new(log.reader()), max_idle)
    }
}

impl std::fmt::Debug for InMemoryTransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransactionLog")
            .field("records", &self.len())
            .finish()
    }
}

/// Cursor over an [`InMemoryTransactionLog`]
#[derive(Debug, Clone)]
pub struct InMemoryReader {
    log: InMemoryTransactionLog,
    position: u64,
}

impl TransactionFileReader for InMemoryReader {
    fn reposition(&mut self, position: u64) {
        self.position = position;
    }

    fn try_read_next(&mut self) -> Result<SeqReadResult> {
        let records = self.log.records.read();
        let Some((&position, record)) = records.range(self.position..).next() else {
            return Ok(SeqReadResult::end(self.position));
        };
        let pre = self.position;
        self.position = position + 1;
        Ok(SeqReadResult {
            success: true,
            record_pre_position: pre,
            record_post_position: self.position,
            record: Some(record.clone()),
        })
    }

    fn try_read_prev(&mut self) -> Result<SeqReadResult> {
        let records = self.log.records.read();
        let Some((&position, record)) = records.range(..self.position).next_back() else {
            return Ok(SeqReadResult::end(self.position));
        };
        let pre = self.position;
        self.position = position;
        Ok(SeqReadResult {
            success: true,
            record_pre_position: pre,
            record_post_position: self.position,
            record: Some(record.clone()),
        })
    }

    fn try_read_at(&mut self, position: u64) -> Result<RecordReadResult> {
        Ok(match self.log.records.read().get(&position) {
            Some(record) => RecordReadResult::found(record.clone(), position + 1, RECORD_LENGTH),
            None => RecordReadResult::failure(),
        })
    }

    fn exists_at(&mut self, position: u64) -> Result<bool> {
        Ok(self.log.records.read().contains_key(&position))
    }
}
