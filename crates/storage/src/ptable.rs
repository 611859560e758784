//! Immutable on-disk index table
//!
//! A `PTable` is a sorted run of index entries in one file (see
//! [`format::ptable`](crate::format::ptable) for the layout). Tables are
//! created by flushing a memtable or by merging tables, and never change
//! afterwards.
//!
//! # Lookups
//!
//! On open, up to `2^cache_depth` evenly spaced keys are sampled into a
//! midpoint cache. A lookup first narrows its binary search with the cache,
//! then searches the remaining window with positional reads. Small windows
//! are read in one go and searched in memory.
//!
//! # Lifetime
//!
//! Tables are shared as `Arc<PTable>`. A table superseded by a merge is
//! marked for destruction; the file is removed when the last reference
//! drops, so lookups that already hold the table finish undisturbed.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use streamindex_core::{IndexEntry, IndexError, PTableVersion, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::format::ptable::{
    decode_entry, encode_entry, entry_count, entry_offset, PTableHeader, PTABLE_EXTENSION,
    PTABLE_FOOTER_SIZE, PTABLE_HEADER_SIZE,
};
use crate::format::sync_parent_dir;
use crate::memtable::MemTable;

/// Windows at or below this many entries are searched in memory
const SCAN_WINDOW: usize = 64;

/// File handles kept open per table
const MAX_IDLE_FILES: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Midpoint {
    key: u64,
    index: usize,
}

/// Immutable sorted table of index entries
pub struct PTable {
    id: Uuid,
    path: PathBuf,
    version: PTableVersion,
    count: usize,
    midpoints: Vec<Midpoint>,
    files: Mutex<Vec<File>>,
    marked_for_destruction: AtomicBool,
}

/// Path for a new table file in `directory`
pub fn new_table_path(directory: &Path) -> PathBuf {
    directory.join(format!("{}.{}", Uuid::new_v4().simple(), PTABLE_EXTENSION))
}

impl PTable {
    /// Write `entries` to a new table at `path` and open it
    ///
    /// Entries must be in storage order. Two entries with the same key and
    /// log position are rejected with `DuplicateEntry`. The file is written
    /// under a temporary name, fsynced, then renamed into place.
    pub fn build<I>(path: &Path, entries: I, version: PTableVersion, cache_depth: u32) -> Result<PTable>
    where
        I: IntoIterator<Item = IndexEntry>,
    {
        PTable::build_fallible(path, entries.into_iter().map(Ok::<_, IndexError>), version, cache_depth)
    }

    /// Like [`PTable::build`], for sources that can fail mid-stream
    ///
    /// The first error aborts the build and removes the partial file.
    pub fn build_fallible<I>(
        path: &Path,
        entries: I,
        version: PTableVersion,
        cache_depth: u32,
    ) -> Result<PTable>
    where
        I: IntoIterator<Item = Result<IndexEntry>>,
    {
        let temp_path = path.with_extension("tmp");
        match write_table(&temp_path, entries, version) {
            Ok(count) => {
                fs::rename(&temp_path, path)?;
                sync_parent_dir(path)?;
                debug!(
                    target: "streamindex::ptable",
                    path = %path.display(),
                    %version,
                    count,
                    "Table written"
                );
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        }
        PTable::open(path, cache_depth)
    }

    /// Flush a memtable to a new table at `path`
    pub fn from_mem_table(memtable: &MemTable, path: &Path, cache_depth: u32) -> Result<PTable> {
        PTable::build(path, memtable.sorted_entries(), memtable.version(), cache_depth)
    }

    /// Open and verify an existing table
    ///
    /// Checks magic, version, length, checksum and sort order in a single
    /// pass, collecting the midpoint cache on the way.
    pub fn open(path: &Path, cache_depth: u32) -> Result<PTable> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut header_bytes = [0u8; PTABLE_HEADER_SIZE];
        reader.read_exact(&mut header_bytes).map_err(|_| {
            IndexError::corrupt(format!("table {} has no header", path.display()))
        })?;
        let header = PTableHeader::from_bytes(&header_bytes)?;
        let version = header.version;
        let count = entry_count(file_len, version)?;

        let mut crc = crc32fast::Hasher::new();
        crc.update(&header_bytes);

        let sample_indexes = midpoint_indexes(count, cache_depth);
        let mut next_sample = 0;
        let mut midpoints = Vec::with_capacity(sample_indexes.len());

        let mut buf = [0u8; 20];
        let entry = &mut buf[..version.entry_size()];
        let mut previous: Option<IndexEntry> = None;
        for index in 0..count {
            reader.read_exact(entry)?;
            crc.update(entry);
            let current = decode_entry(entry, version);

            if let Some(prev) = previous {
                check_order(&prev, &current).map_err(|e| match e {
                    IndexError::DuplicateEntry { .. } => IndexError::corrupt(format!(
                        "table {} holds duplicate entries: {}",
                        path.display(),
                        e
                    )),
                    other => other,
                })?;
            }
            previous = Some(current);

            if sample_indexes.get(next_sample) == Some(&index) {
                midpoints.push(Midpoint {
                    key: current.hash,
                    index,
                });
                next_sample += 1;
            }
        }

        let mut footer = [0u8; PTABLE_FOOTER_SIZE];
        reader.read_exact(&mut footer)?;
        let stored = u32::from_le_bytes(footer);
        let computed = crc.finalize();
        if stored != computed {
            return Err(IndexError::ChecksumMismatch {
                expected: stored,
                computed,
            });
        }

        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);

        Ok(PTable {
            id,
            path: path.to_path_buf(),
            version,
            count,
            midpoints,
            files: Mutex::new(vec![reader.into_inner()]),
            marked_for_destruction: AtomicBool::new(false),
        })
    }

    /// Table identifier (the file stem)
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Path of the table file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name relative to the index directory
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Entry format
    pub fn version(&self) -> PTableVersion {
        self.version
    }

    /// Number of entries
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of cached midpoints
    pub fn midpoint_count(&self) -> usize {
        self.midpoints.len()
    }

    /// All entries for `hash`, newest first
    pub fn entries_for(&self, hash: u64) -> Result<Vec<IndexEntry>> {
        if !self.may_contain(hash) {
            return Ok(Vec::new());
        }
        self.with_file(|file| {
            let lo = self.lower_bound(file, hash)?;
            let hi = self.upper_bound(file, hash, lo)?;
            let mut entries = self.read_entries(file, lo, hi)?;
            entries.reverse();
            Ok(entries)
        })
    }

    /// Position of the newest entry for `hash` with `event_number`
    pub fn try_get_one_value(&self, hash: u64, event_number: u32) -> Result<Option<u64>> {
        Ok(self
            .entries_for(hash)?
            .into_iter()
            .find(|e| e.event_number == event_number)
            .map(|e| e.log_position))
    }

    /// Newest entry for `hash`
    pub fn try_get_latest_entry(&self, hash: u64) -> Result<Option<IndexEntry>> {
        if !self.may_contain(hash) {
            return Ok(None);
        }
        self.with_file(|file| {
            let hi = self.upper_bound(file, hash, 0)?;
            if hi == 0 {
                return Ok(None);
            }
            let entry = self.read_entry(file, hi - 1)?;
            Ok((entry.hash == hash).then_some(entry))
        })
    }

    /// Oldest entry for `hash`
    pub fn try_get_oldest_entry(&self, hash: u64) -> Result<Option<IndexEntry>> {
        if !self.may_contain(hash) {
            return Ok(None);
        }
        self.with_file(|file| {
            let lo = self.lower_bound(file, hash)?;
            if lo >= self.count {
                return Ok(None);
            }
            let entry = self.read_entry(file, lo)?;
            Ok((entry.hash == hash).then_some(entry))
        })
    }

    /// Entries for `hash` with `start <= event_number <= end`, newest first
    pub fn range(&self, hash: u64, start: u32, end: u32, limit: Option<usize>) -> Result<Vec<IndexEntry>> {
        Ok(self
            .entries_for(hash)?
            .into_iter()
            .filter(|e| e.event_number >= start && e.event_number <= end)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Stream every entry in storage order
    pub fn iter(&self) -> Result<PTableIter> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(PTABLE_HEADER_SIZE as u64))?;
        Ok(PTableIter {
            reader: BufReader::new(file),
            version: self.version,
            remaining: self.count,
        })
    }

    /// Delete the file once the last reference is dropped
    pub fn mark_for_destruction(&self) {
        self.marked_for_destruction.store(true, Ordering::Release);
    }

    /// Whether the table is scheduled for deletion
    pub fn is_marked_for_destruction(&self) -> bool {
        self.marked_for_destruction.load(Ordering::Acquire)
    }

    // ========================================================================
    // Search
    // ========================================================================

    fn may_contain(&self, hash: u64) -> bool {
        match (self.midpoints.first(), self.midpoints.last()) {
            (Some(first), Some(last)) => first.key <= hash && hash <= last.key,
            _ => false,
        }
    }

    /// First index whose key is >= `hash`
    fn lower_bound(&self, file: &mut File, hash: u64) -> Result<usize> {
        let p = self.midpoints.partition_point(|m| m.key < hash);
        let lo = if p > 0 { self.midpoints[p - 1].index + 1 } else { 0 };
        let hi = self.midpoints.get(p).map_or(self.count, |m| m.index);
        self.search(file, lo, hi, |key| key < hash)
    }

    /// First index at or after `from` whose key is > `hash`
    fn upper_bound(&self, file: &mut File, hash: u64, from: usize) -> Result<usize> {
        let p = self.midpoints.partition_point(|m| m.key <= hash);
        let lo = if p > 0 { self.midpoints[p - 1].index + 1 } else { 0 };
        let hi = self.midpoints.get(p).map_or(self.count, |m| m.index);
        self.search(file, lo.max(from), hi.max(from), |key| key <= hash)
    }

    /// First index in `[lo, hi)` where `before` is false
    fn search(
        &self,
        file: &mut File,
        mut lo: usize,
        mut hi: usize,
        before: impl Fn(u64) -> bool,
    ) -> Result<usize> {
        while hi - lo > SCAN_WINDOW {
            let mid = lo + (hi - lo) / 2;
            if before(self.read_entry(file, mid)?.hash) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let window = self.read_entries(file, lo, hi)?;
        Ok(lo + window.partition_point(|e| before(e.hash)))
    }

    fn read_entry(&self, file: &mut File, index: usize) -> Result<IndexEntry> {
        let mut buf = [0u8; 20];
        let entry = &mut buf[..self.version.entry_size()];
        file.seek(SeekFrom::Start(entry_offset(index, self.version)))?;
        file.read_exact(entry)?;
        Ok(decode_entry(entry, self.version))
    }

    fn read_entries(&self, file: &mut File, lo: usize, hi: usize) -> Result<Vec<IndexEntry>> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        let size = self.version.entry_size();
        let mut bytes = vec![0u8; (hi - lo) * size];
        file.seek(SeekFrom::Start(entry_offset(lo, self.version)))?;
        file.read_exact(&mut bytes)?;
        Ok(bytes
            .chunks_exact(size)
            .map(|chunk| decode_entry(chunk, self.version))
            .collect())
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
        let pooled = self.files.lock().pop();
        let mut file = match pooled {
            Some(file) => file,
            None => File::open(&self.path)?,
        };
        let result = f(&mut file);
        let mut files = self.files.lock();
        if files.len() < MAX_IDLE_FILES {
            files.push(file);
        }
        result
    }
}

impl Drop for PTable {
    fn drop(&mut self) {
        if !self.is_marked_for_destruction() {
            return;
        }
        self.files.get_mut().clear();
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(
                target: "streamindex::ptable",
                path = %self.path.display(),
                "Deleted superseded table"
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                target: "streamindex::ptable",
                path = %self.path.display(),
                error = %e,
                "Failed to delete superseded table"
            ),
        }
    }
}

impl std::fmt::Debug for PTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PTable")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("count", &self.count)
            .field("marked_for_destruction", &self.is_marked_for_destruction())
            .finish()
    }
}

/// Streaming iterator over a table in storage order
pub struct PTableIter {
    reader: BufReader<File>,
    version: PTableVersion,
    remaining: usize,
}

impl Iterator for PTableIter {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let mut buf = [0u8; 20];
        let entry = &mut buf[..self.version.entry_size()];
        if let Err(e) = self.reader.read_exact(entry) {
            self.remaining = 0;
            return Some(Err(e.into()));
        }
        Some(Ok(decode_entry(entry, self.version)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Entries of a table must ascend and never repeat a (key, position) pair
fn check_order(prev: &IndexEntry, current: &IndexEntry) -> Result<()> {
    if prev.hash == current.hash && prev.log_position == current.log_position {
        return Err(IndexError::DuplicateEntry {
            hash: current.hash,
            log_position: current.log_position,
        });
    }
    if prev > current {
        return Err(IndexError::corrupt(format!(
            "entries out of order: {:?} before {:?}",
            prev, current
        )));
    }
    Ok(())
}

fn write_table<I>(path: &Path, entries: I, version: PTableVersion) -> Result<usize>
where
    I: IntoIterator<Item = Result<IndexEntry>>,
{
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);
    let mut crc = crc32fast::Hasher::new();

    let header = PTableHeader::new(version).to_bytes();
    writer.write_all(&header)?;
    crc.update(&header);

    let mut buf = Vec::with_capacity(version.entry_size());
    let mut previous: Option<IndexEntry> = None;
    let mut count = 0usize;
    for entry in entries {
        let entry = entry?;
        if let Some(prev) = previous {
            check_order(&prev, &entry)?;
        }
        previous = Some(entry);

        buf.clear();
        encode_entry(&mut buf, &entry, version)?;
        crc.update(&buf);
        writer.write_all(&buf)?;
        count += 1;
    }

    writer.write_all(&crc.finalize().to_le_bytes())?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(count)
}

/// Indexes sampled into the midpoint cache: first and last, evenly spaced
fn midpoint_indexes(count: usize, cache_depth: u32) -> Vec<usize> {
    if count == 0 {
        return Vec::new();
    }
    let wanted = (1usize << cache_depth).max(2).min(count);
    if wanted == 1 {
        return vec![0];
    }
    let mut indexes: Vec<usize> = (0..wanted)
        .map(|k| ((k as u128 * (count - 1) as u128) / (wanted - 1) as u128) as usize)
        .collect();
    indexes.dedup();
    indexes
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build(dir: &TempDir, entries: Vec<IndexEntry>, version: PTableVersion, depth: u32) -> PTable {
        let path = new_table_path(dir.path());
        PTable::build(&path, entries, version, depth).unwrap()
    }

    fn sample_entries() -> Vec<IndexEntry> {
        let mut entries = Vec::new();
        for hash in 0..200u64 {
            for n in 0..(hash % 4) as u32 {
                entries.push(IndexEntry::new(hash * 3, n, hash * 100 + n as u64));
            }
        }
        entries.sort();
        entries
    }

    // ========================================
    // Build and Open
    // ========================================

    #[test]
    fn test_build_and_reopen() {
        let dir = TempDir::new().unwrap();
        let entries = sample_entries();
        let table = build(&dir, entries.clone(), PTableVersion::V2, 4);
        assert_eq!(table.count(), entries.len());
        assert!(!table.path().with_extension("tmp").exists());

        let reopened = PTable::open(table.path(), 4).unwrap();
        assert_eq!(reopened.count(), entries.len());
        assert_eq!(reopened.version(), PTableVersion::V2);
        let all: Vec<IndexEntry> = reopened.iter().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(all, entries);
    }

    #[test]
    fn test_empty_table() {
        let dir = TempDir::new().unwrap();
        let table = build(&dir, vec![], PTableVersion::V1, 4);
        assert_eq!(table.count(), 0);
        assert!(table.entries_for(1).unwrap().is_empty());
        assert!(table.try_get_latest_entry(1).unwrap().is_none());
        assert_eq!(table.iter().unwrap().count(), 0);
    }

    #[test]
    fn test_build_rejects_duplicate_and_unsorted() {
        let dir = TempDir::new().unwrap();
        let path = new_table_path(dir.path());

        let dup = vec![IndexEntry::new(1, 0, 5), IndexEntry::new(1, 1, 5)];
        let err = PTable::build(&path, dup, PTableVersion::V2, 4).unwrap_err();
        assert!(matches!(err, IndexError::DuplicateEntry { hash: 1, log_position: 5 }));

        let unsorted = vec![IndexEntry::new(2, 0, 5), IndexEntry::new(1, 0, 6)];
        assert!(PTable::build(&path, unsorted, PTableVersion::V2, 4).is_err());

        // Nothing left behind
        assert!(!path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_open_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let table = build(&dir, sample_entries(), PTableVersion::V2, 4);
        let path = table.path().to_path_buf();
        drop(table);

        let mut bytes = fs::read(&path).unwrap();
        bytes[PTABLE_HEADER_SIZE + 3] ^= 0x55;
        fs::write(&path, &bytes).unwrap();
        let err = PTable::open(&path, 4).unwrap_err();
        assert!(err.is_corruption());

        bytes.truncate(bytes.len() - 3);
        fs::write(&path, &bytes).unwrap();
        assert!(PTable::open(&path, 4).unwrap_err().is_corruption());
    }

    // ========================================
    // Lookups
    // ========================================

    #[test]
    fn test_entries_for_newest_first() {
        let dir = TempDir::new().unwrap();
        let entries = vec![
            IndexEntry::new(10, 0, 1),
            IndexEntry::new(10, 1, 7),
            IndexEntry::new(10, 2, 9),
            IndexEntry::new(11, 0, 3),
        ];
        let table = build(&dir, entries, PTableVersion::V2, 4);

        let found: Vec<u64> = table.entries_for(10).unwrap().iter().map(|e| e.log_position).collect();
        assert_eq!(found, vec![9, 7, 1]);
        assert!(table.entries_for(12).unwrap().is_empty());
        assert!(table.entries_for(0).unwrap().is_empty());
    }

    #[test]
    fn test_lookups_match_linear_scan_for_all_depths() {
        let dir = TempDir::new().unwrap();
        let entries = sample_entries();
        for depth in [0, 1, 3, 16] {
            let table = build(&dir, entries.clone(), PTableVersion::V2, depth);
            for hash in 0..610u64 {
                let mut expected: Vec<IndexEntry> =
                    entries.iter().filter(|e| e.hash == hash).copied().collect();
                expected.reverse();
                assert_eq!(table.entries_for(hash).unwrap(), expected, "depth {} key {}", depth, hash);
                assert_eq!(table.try_get_latest_entry(hash).unwrap(), expected.first().copied());
                assert_eq!(table.try_get_oldest_entry(hash).unwrap(), expected.last().copied());
            }
        }
    }

    #[test]
    fn test_one_value_and_range() {
        let dir = TempDir::new().unwrap();
        let mut entries: Vec<IndexEntry> = (0..300u32).map(|n| IndexEntry::new(42, n, n as u64)).collect();
        entries.push(IndexEntry::new(43, 0, 1_000));
        let table = build(&dir, entries, PTableVersion::V1, 2);

        assert_eq!(table.try_get_one_value(42, 150).unwrap(), Some(150));
        assert_eq!(table.try_get_one_value(42, 300).unwrap(), None);

        let range = table.range(42, 10, 20, Some(5)).unwrap();
        let numbers: Vec<u32> = range.iter().map(|e| e.event_number).collect();
        assert_eq!(numbers, vec![20, 19, 18, 17, 16]);
    }

    #[test]
    fn test_from_mem_table() {
        let dir = TempDir::new().unwrap();
        let mem = MemTable::new(PTableVersion::V2);
        mem.add(5, 0, 10);
        mem.add(5, 1, 20);
        mem.add(1, 0, 15);

        let table = PTable::from_mem_table(&mem, &new_table_path(dir.path()), 4).unwrap();
        assert_eq!(table.count(), 3);
        assert_eq!(table.entries_for(5).unwrap(), mem.entries_for(5));
    }

    // ========================================
    // Deferred Deletion
    // ========================================

    #[test]
    fn test_marked_table_deleted_on_last_drop() {
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let table = Arc::new(build(&dir, sample_entries(), PTableVersion::V2, 4));
        let path = table.path().to_path_buf();

        let reader_handle = Arc::clone(&table);
        table.mark_for_destruction();
        drop(table);

        // Still readable by the outstanding holder
        assert!(path.exists());
        assert!(!reader_handle.entries_for(3).unwrap().is_empty());

        drop(reader_handle);
        assert!(!path.exists());
    }

    #[test]
    fn test_unmarked_table_survives_drop() {
        let dir = TempDir::new().unwrap();
        let table = build(&dir, sample_entries(), PTableVersion::V2, 4);
        let path = table.path().to_path_buf();
        drop(table);
        assert!(path.exists());
    }

    #[test]
    fn test_midpoint_indexes() {
        assert!(midpoint_indexes(0, 4).is_empty());
        assert_eq!(midpoint_indexes(1, 4), vec![0]);
        assert_eq!(midpoint_indexes(5, 0), vec![0, 4]);
        assert_eq!(midpoint_indexes(5, 4), vec![0, 1, 2, 3, 4]);
        let sampled = midpoint_indexes(1_000, 3);
        assert_eq!(sampled.len(), 8);
        assert_eq!(sampled.first(), Some(&0));
        assert_eq!(sampled.last(), Some(&999));
    }
}
