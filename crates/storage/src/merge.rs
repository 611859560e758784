//! K-way table merge
//!
//! Merging combines a level's tables into a single table with a heap-based
//! k-way merge over storage order. Every input entry appears in the output
//! exactly once, with one exception: when a 32-bit table is merged into a
//! 64-bit index, each entry is re-keyed from its log record, and entries
//! whose record cannot be found (or no longer hashes to the stored key) are
//! dropped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::Arc;

use streamindex_core::{
    read_prepare, HasherPair, IndexEntry, IndexError, PTableVersion, ReaderPool, Result,
};
use tracing::{debug, info, warn};

use crate::ptable::{new_table_path, PTable};

/// Everything a merge needs besides its inputs
pub struct Merger<'a> {
    directory: &'a Path,
    version: PTableVersion,
    cache_depth: u32,
    hashers: &'a HasherPair,
    readers: &'a ReaderPool,
}

/// Result of a merge
#[derive(Debug)]
pub struct MergeOutput {
    /// The merged table
    pub table: PTable,
    /// Entries dropped while upgrading 32-bit tables
    pub dropped: usize,
}

impl<'a> Merger<'a> {
    /// Create a merger writing `version` tables into `directory`
    pub fn new(
        directory: &'a Path,
        version: PTableVersion,
        cache_depth: u32,
        hashers: &'a HasherPair,
        readers: &'a ReaderPool,
    ) -> Self {
        Merger {
            directory,
            version,
            cache_depth,
            hashers,
            readers,
        }
    }

    /// Table version the merger writes
    pub fn version(&self) -> PTableVersion {
        self.version
    }

    /// Midpoint cache depth for written tables
    pub fn cache_depth(&self) -> u32 {
        self.cache_depth
    }

    /// Directory new tables are written to
    pub fn directory(&self) -> &Path {
        self.directory
    }

    /// Merge `tables` into one new table
    pub fn merge(&self, tables: &[Arc<PTable>]) -> Result<MergeOutput> {
        let input: usize = tables.iter().map(|t| t.count()).sum();
        let mut dropped = 0;
        let mut sources: Vec<Box<dyn Iterator<Item = Result<IndexEntry>>>> =
            Vec::with_capacity(tables.len());

        for table in tables {
            match (table.version(), self.version) {
                (from, to) if from == to => sources.push(Box::new(table.iter()?)),
                (PTableVersion::V1, PTableVersion::V2) => {
                    let (upgraded, lost) = self.upgrade(table)?;
                    dropped += lost;
                    sources.push(Box::new(upgraded.into_iter().map(Ok::<_, IndexError>)));
                }
                (from, to) => {
                    return Err(IndexError::InvalidConfig(format!(
                        "cannot merge a {} table into a {} index",
                        from, to
                    )));
                }
            }
        }

        let path = new_table_path(self.directory);
        let table = PTable::build_fallible(
            &path,
            KWayMerge::new(sources)?,
            self.version,
            self.cache_depth,
        )?;

        if table.count() + dropped != input {
            // The merged table is never published when counts disagree
            table.mark_for_destruction();
            return Err(IndexError::corrupt(format!(
                "merge wrote {} entries from {} inputs ({} dropped)",
                table.count(),
                input,
                dropped
            )));
        }

        info!(
            target: "streamindex::merge",
            inputs = tables.len(),
            entries = table.count(),
            dropped,
            version = %self.version,
            "Tables merged"
        );
        Ok(MergeOutput { table, dropped })
    }

    /// Re-key a 32-bit table with the full 64-bit hash of each entry's stream
    fn upgrade(&self, table: &PTable) -> Result<(Vec<IndexEntry>, usize)> {
        let mut reader = self.readers.borrow_reader();
        let mut upgraded = Vec::with_capacity(table.count());
        let mut dropped = 0;

        for entry in table.iter()? {
            let entry = entry?;
            match read_prepare(&mut *reader, entry.log_position)? {
                Some(prepare) if self.hashers.low(&prepare.event_stream_id) as u64 == entry.hash => {
                    upgraded.push(IndexEntry::new(
                        self.hashers.combined(&prepare.event_stream_id),
                        entry.event_number,
                        entry.log_position,
                    ));
                }
                Some(prepare) => {
                    warn!(
                        target: "streamindex::merge",
                        log_position = entry.log_position,
                        stream = %prepare.event_stream_id,
                        "Record does not match its 32-bit key, dropping entry"
                    );
                    dropped += 1;
                }
                None => {
                    debug!(
                        target: "streamindex::merge",
                        log_position = entry.log_position,
                        "No prepare at position, dropping entry"
                    );
                    dropped += 1;
                }
            }
        }

        upgraded.sort_unstable();
        if dropped > 0 {
            warn!(
                target: "streamindex::merge",
                table = %table.id(),
                dropped,
                "Entries dropped while upgrading table"
            );
        }
        Ok((upgraded, dropped))
    }
}

/// Heap-driven merge of sorted entry streams
struct KWayMerge {
    sources: Vec<Box<dyn Iterator<Item = Result<IndexEntry>>>>,
    heap: BinaryHeap<Reverse<(IndexEntry, usize)>>,
    failed: bool,
}

impl KWayMerge {
    fn new(mut sources: Vec<Box<dyn Iterator<Item = Result<IndexEntry>>>>) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (i, source) in sources.iter_mut().enumerate() {
            if let Some(entry) = source.next() {
                heap.push(Reverse((entry?, i)));
            }
        }
        Ok(KWayMerge {
            sources,
            heap,
            failed: false,
        })
    }
}

impl Iterator for KWayMerge {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let Reverse((entry, source)) = self.heap.pop()?;
        match self.sources[source].next() {
            Some(Ok(next)) => self.heap.push(Reverse((next, source))),
            Some(Err(e)) => {
                self.failed = true;
                return Some(Err(e));
            }
            None => {}
        }
        Some(Ok(entry))
    }
}
