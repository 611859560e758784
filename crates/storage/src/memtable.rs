//! In-memory write buffer
//!
//! A `MemTable` collects index entries until it reaches the configured
//! capacity, at which point the owning `TableIndex` rotates it out and
//! flushes it to a `PTable`.
//!
//! # Design
//!
//! - DashMap keyed by index key, FxHasher (keys are already hashes)
//! - Each bucket is a SmallVec of `(event_number, log_position)` kept sorted
//!   by log position, so the common single-entry stream never allocates
//! - An entry is inserted whole under its shard lock: readers never observe
//!   a torn entry, and writers only contend with readers of the same shard
//! - Capacity is not enforced here; rotation is the owner's decision

use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use rustc_hash::FxHasher;
use smallvec::SmallVec;
use streamindex_core::{IndexEntry, PTableVersion};
use uuid::Uuid;

type Bucket = SmallVec<[(u32, u64); 4]>;

/// Concurrent in-memory index buffer
pub struct MemTable {
    id: Uuid,
    version: PTableVersion,
    buckets: DashMap<u64, Bucket, BuildHasherDefault<FxHasher>>,
    count: AtomicUsize,
    // Checkpoints are stored as value + 1 so that 0 means "none"
    prepare_checkpoint: AtomicU64,
    commit_checkpoint: AtomicU64,
}

impl MemTable {
    /// Create an empty memtable whose keys follow `version`
    pub fn new(version: PTableVersion) -> Self {
        MemTable {
            id: Uuid::new_v4(),
            version,
            buckets: DashMap::with_hasher(BuildHasherDefault::default()),
            count: AtomicUsize::new(0),
            prepare_checkpoint: AtomicU64::new(0),
            commit_checkpoint: AtomicU64::new(0),
        }
    }

    /// Identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Key format of the entries
    pub fn version(&self) -> PTableVersion {
        self.version
    }

    /// Insert an entry
    pub fn add(&self, hash: u64, event_number: u32, log_position: u64) {
        {
            let mut bucket = self.buckets.entry(hash).or_default();
            let item = (event_number, log_position);
            // Appends are the norm: positions grow monotonically
            let at = bucket.partition_point(|&(en, pos)| (pos, en) <= (log_position, event_number));
            bucket.insert(at, item);
        }
        self.count.fetch_add(1, Ordering::Release);
        self.prepare_checkpoint
            .fetch_max(log_position.saturating_add(1), Ordering::AcqRel);
    }

    /// Whether an entry for `hash` at `log_position` exists
    pub fn contains(&self, hash: u64, log_position: u64) -> bool {
        self.buckets.get(&hash).map_or(false, |bucket| {
            let at = bucket.partition_point(|&(_, pos)| pos < log_position);
            bucket.get(at).map_or(false, |&(_, pos)| pos == log_position)
        })
    }

    /// Record that everything up to `commit_position` has been committed
    pub fn mark_commit(&self, commit_position: u64) {
        self.commit_checkpoint
            .fetch_max(commit_position.saturating_add(1), Ordering::AcqRel);
    }

    /// Number of entries
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether the memtable holds no entries
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Highest log position added
    pub fn prepare_checkpoint(&self) -> Option<u64> {
        decode_checkpoint(self.prepare_checkpoint.load(Ordering::Acquire))
    }

    /// Highest commit position recorded
    pub fn commit_checkpoint(&self) -> Option<u64> {
        decode_checkpoint(self.commit_checkpoint.load(Ordering::Acquire))
    }

    /// All entries for `hash`, newest first
    pub fn entries_for(&self, hash: u64) -> Vec<IndexEntry> {
        match self.buckets.get(&hash) {
            Some(bucket) => bucket
                .iter()
                .rev()
                .map(|&(en, pos)| IndexEntry::new(hash, en, pos))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Position of the newest entry for `hash` with `event_number`
    pub fn try_get_one_value(&self, hash: u64, event_number: u32) -> Option<u64> {
        let bucket = self.buckets.get(&hash)?;
        bucket
            .iter()
            .rev()
            .find(|&&(en, _)| en == event_number)
            .map(|&(_, pos)| pos)
    }

    /// Newest entry for `hash`
    pub fn try_get_latest_entry(&self, hash: u64) -> Option<IndexEntry> {
        let bucket = self.buckets.get(&hash)?;
        bucket
            .last()
            .map(|&(en, pos)| IndexEntry::new(hash, en, pos))
    }

    /// Oldest entry for `hash`
    pub fn try_get_oldest_entry(&self, hash: u64) -> Option<IndexEntry> {
        let bucket = self.buckets.get(&hash)?;
        bucket
            .first()
            .map(|&(en, pos)| IndexEntry::new(hash, en, pos))
    }

    /// Entries for `hash` with `start <= event_number <= end`, newest first
    ///
    /// At most `limit` entries are returned when a limit is given.
    pub fn range(&self, hash: u64, start: u32, end: u32, limit: Option<usize>) -> Vec<IndexEntry> {
        let Some(bucket) = self.buckets.get(&hash) else {
            return Vec::new();
        };
        bucket
            .iter()
            .rev()
            .filter(|&&(en, _)| en >= start && en <= end)
            .take(limit.unwrap_or(usize::MAX))
            .map(|&(en, pos)| IndexEntry::new(hash, en, pos))
            .collect()
    }

    /// Every entry in table storage order
    ///
    /// Used when flushing. The memtable must no longer receive writes.
    pub fn sorted_entries(&self) -> Vec<IndexEntry> {
        let mut entries = Vec::with_capacity(self.count());
        for bucket in self.buckets.iter() {
            let hash = *bucket.key();
            entries.extend(
                bucket
                    .value()
                    .iter()
                    .map(|&(en, pos)| IndexEntry::new(hash, en, pos)),
            );
        }
        // Buckets are already position-ordered; only the keys need sorting
        entries.sort_unstable();
        entries
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("count", &self.count())
            .finish()
    }
}

fn decode_checkpoint(raw: u64) -> Option<u64> {
    raw.checked_sub(1)
}
