//! Shared helpers for the root integration tests

#![allow(dead_code)]

use std::sync::Arc;

use streamindex::{
    CachingIndexBackend, IndexCommitter, IndexReader, IndexReaderConfig, InMemoryTransactionLog,
    PTableVersion, TableIndex, TableIndexConfig,
};
use tempfile::TempDir;

/// Route index logs to the test harness; repeated calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A log, an index over it, and a reader, sharing one temp directory
pub struct Stack {
    pub dir: TempDir,
    pub log: InMemoryTransactionLog,
    pub index: TableIndex,
    pub backend: Arc<CachingIndexBackend>,
    pub committer: IndexCommitter,
    pub reader: IndexReader,
}

impl Stack {
    /// Build a stack with the default hashers
    pub fn new(version: PTableVersion, read_limit: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let log = InMemoryTransactionLog::new();
        let config = TableIndexConfig::for_testing(dir.path()).with_version(version);
        Self::with_config(dir, log, config, read_limit)
    }

    /// Build a stack over an existing directory and log
    pub fn with_config(
        dir: TempDir,
        log: InMemoryTransactionLog,
        config: TableIndexConfig,
        read_limit: usize,
    ) -> Self {
        let hashers = config.hasher_pair();
        let index = TableIndex::open(config, hashers, log.reader_pool(4)).unwrap();
        index.initialize(u64::MAX).unwrap();
        let backend = Arc::new(CachingIndexBackend::new(log.reader_pool(4)));
        let committer = IndexCommitter::new(backend.clone(), index.clone());
        let reader = IndexReader::new(
            backend.clone(),
            index.clone(),
            IndexReaderConfig::default().with_hash_collision_read_limit(read_limit),
        )
        .unwrap();
        Stack {
            dir,
            log,
            index,
            backend,
            committer,
            reader,
        }
    }

    /// Append an event to the log and add it to the table index only
    ///
    /// The cache is not told, so lookups resolve through the index.
    pub fn write(&self, position: u64, stream_id: &str, event_number: u32) {
        self.log.append_prepare(position, stream_id, event_number);
        self.index
            .add(position, stream_id, event_number, position)
            .unwrap();
    }

    /// Append an event to the log and commit it through the committer
    pub fn commit(&self, position: u64, stream_id: &str, event_number: u32) {
        self.log.append_prepare(position, stream_id, event_number);
        self.committer
            .commit_event(position, stream_id, event_number, position)
            .unwrap();
    }
}
