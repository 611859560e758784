//! The table index
//!
//! `TableIndex` owns the complete index: the memtable receiving writes,
//! memtables waiting to be flushed, and the durable table levels.
//!
//! # Concurrency
//!
//! All of that is published as one immutable `IndexState` behind an
//! `ArcSwap`. Lookups load the current state without locking and keep it
//! alive for the duration of the lookup, so a merge that supersedes a table
//! never pulls it out from under a reader.
//!
//! Writers and the background worker serialize state changes through
//! `state_lock`. A full memtable is rotated out inside that lock, so no
//! write can land in a memtable after it was handed to the worker.
//!
//! # Background work
//!
//! Rotation wakes a single worker thread that flushes waiting memtables
//! oldest first. For each one it writes the table, applies the merge
//! policy, persists the index map, and only then publishes the new state.
//! A failure leaves the published state untouched: the memtable stays
//! readable and the previous map stays durable.
//!
//! # Recovery
//!
//! The index is derived from the transaction log. `initialize` trusts the
//! persisted map only if it is intact and behind the log's checkpoint;
//! otherwise everything on disk is discarded and the caller re-indexes from
//! the log. Files not referenced by the map are incomplete flush or merge
//! output and are deleted.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use streamindex_core::{
    sort_newest_first, HasherPair, IndexEntry, IndexError, PTableVersion, ReaderPool, Result,
};
use tracing::{debug, error, info, warn};

use crate::config::TableIndexConfig;
use crate::format::index_map::INDEX_MAP_FILE_NAME;
use crate::format::ptable::PTABLE_EXTENSION;
use crate::index_map::{AddResult, IndexMap};
use crate::memtable::MemTable;
use crate::merge::Merger;
use crate::ptable::{new_table_path, PTable};

/// Published view of the whole index
struct IndexState {
    /// Current memtable first, then memtables waiting for a flush, newest first
    awaiting: Vec<Arc<MemTable>>,
    map: Arc<IndexMap>,
}

impl IndexState {
    fn current(&self) -> Result<&Arc<MemTable>> {
        self.awaiting.first().ok_or(IndexError::NotInitialized)
    }
}

#[derive(Default)]
struct Background {
    running: bool,
    handle: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

struct Inner {
    config: TableIndexConfig,
    hashers: HasherPair,
    readers: ReaderPool,
    state: ArcSwap<IndexState>,
    state_lock: Mutex<()>,
    background: Mutex<Background>,
    background_idle: Condvar,
    initialized: AtomicBool,
    closed: AtomicBool,
}

/// Hash-keyed index over the transaction log
#[derive(Clone)]
pub struct TableIndex {
    inner: Arc<Inner>,
}

impl TableIndex {
    /// Create an index over `config.directory`
    ///
    /// Nothing is read from disk until [`TableIndex::initialize`].
    /// `readers` is used to re-key 32-bit tables during merges.
    pub fn open(config: TableIndexConfig, hashers: HasherPair, readers: ReaderPool) -> Result<Self> {
        config.validate()?;
        let empty = IndexState {
            awaiting: Vec::new(),
            map: Arc::new(IndexMap::empty(config.version, config.max_tables_per_level)),
        };
        Ok(TableIndex {
            inner: Arc::new(Inner {
                config,
                hashers,
                readers,
                state: ArcSwap::from_pointee(empty),
                state_lock: Mutex::new(()),
                background: Mutex::new(Background::default()),
                background_idle: Condvar::new(),
                initialized: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Load durable state consistent with the log checkpoint
    ///
    /// `checkpoint` is the log position up to which the log is known to be
    /// durable. Afterwards, [`TableIndex::commit_checkpoint`] reports where
    /// re-indexing from the log must resume.
    pub fn initialize(&self, checkpoint: u64) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(IndexError::Closed);
        }
        let _guard = inner.state_lock.lock();
        if inner.initialized.load(Ordering::Acquire) {
            return Err(IndexError::AlreadyInitialized);
        }

        let config = &inner.config;
        let directory = config.directory.as_path();
        fs::create_dir_all(directory)?;

        let map = match IndexMap::load(directory, config.max_tables_per_level, config.cache_depth) {
            Ok(Some(map)) if map.version() > config.version => {
                return Err(IndexError::InvalidConfig(format!(
                    "index on disk is {}, configured version {} cannot read it",
                    map.version(),
                    config.version
                )));
            }
            Ok(Some(map)) if map.commit_checkpoint().map_or(false, |cp| cp >= checkpoint) => {
                warn!(
                    target: "streamindex::table_index",
                    commit_checkpoint = ?map.commit_checkpoint(),
                    checkpoint,
                    "Index is ahead of the log, discarding it"
                );
                drop(map);
                remove_index_files(directory)?;
                IndexMap::empty(config.version, config.max_tables_per_level)
            }
            Ok(Some(map)) => map.with_version(config.version),
            Ok(None) => IndexMap::empty(config.version, config.max_tables_per_level),
            Err(e) if e.is_corruption() => {
                warn!(
                    target: "streamindex::table_index",
                    error = %e,
                    "Index is corrupt, discarding it"
                );
                remove_index_files(directory)?;
                IndexMap::empty(config.version, config.max_tables_per_level)
            }
            Err(e) => return Err(e),
        };

        let orphans = remove_orphans(directory, &map.file_names())?;
        info!(
            target: "streamindex::table_index",
            directory = %directory.display(),
            tables = map.table_count(),
            entries = map.entry_count(),
            prepare_checkpoint = ?map.prepare_checkpoint(),
            commit_checkpoint = ?map.commit_checkpoint(),
            orphans,
            "Table index initialized"
        );

        inner.state.store(Arc::new(IndexState {
            awaiting: vec![Arc::new(MemTable::new(config.version))],
            map: Arc::new(map),
        }));
        inner.initialized.store(true, Ordering::Release);
        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Index `event_number` of `stream_id` at `log_position`
    ///
    /// `commit_position` is the position of the commit record that made the
    /// event durable. Never waits for a flush.
    ///
    /// An entry whose key and log position are already indexed is rejected
    /// with `DuplicateEntry` and nothing is added.
    pub fn add(
        &self,
        commit_position: u64,
        stream_id: &str,
        event_number: u32,
        log_position: u64,
    ) -> Result<()> {
        self.inner
            .add_batch(commit_position, &[(stream_id, event_number, log_position)])
    }

    /// Index a batch of `(stream_id, event_number, log_position)` entries
    /// committed at `commit_position`
    ///
    /// The batch lands in a single memtable. If any entry is a duplicate,
    /// within the batch or of an indexed entry, none of them are added.
    pub fn add_entries<S, I>(&self, commit_position: u64, entries: I) -> Result<()>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, u32, u64)>,
    {
        let entries: Vec<(S, u32, u64)> = entries.into_iter().collect();
        self.inner.add_batch(commit_position, &entries)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Log position of the newest entry for `stream_id` with `event_number`
    ///
    /// On a collision this may belong to another stream; callers verify
    /// against the log.
    pub fn try_get_one_value(&self, stream_id: &str, event_number: u32) -> Result<Option<u64>> {
        let state = self.inner.ready_state()?;
        for mem in &state.awaiting {
            let key = self.inner.key_for(mem.version(), stream_id);
            if let Some(position) = mem.try_get_one_value(key, event_number) {
                return Ok(Some(position));
            }
        }
        for table in state.map.in_order() {
            let key = self.inner.key_for(table.version(), stream_id);
            if let Some(position) = table.try_get_one_value(key, event_number)? {
                return Ok(Some(position));
            }
        }
        Ok(None)
    }

    /// Newest entry whose key matches `stream_id`
    pub fn try_get_latest_entry(&self, stream_id: &str) -> Result<Option<IndexEntry>> {
        let state = self.inner.ready_state()?;
        for mem in &state.awaiting {
            let key = self.inner.key_for(mem.version(), stream_id);
            if let Some(entry) = mem.try_get_latest_entry(key) {
                return Ok(Some(entry));
            }
        }
        for table in state.map.in_order() {
            let key = self.inner.key_for(table.version(), stream_id);
            if let Some(entry) = table.try_get_latest_entry(key)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Oldest entry whose key matches `stream_id`
    pub fn try_get_oldest_entry(&self, stream_id: &str) -> Result<Option<IndexEntry>> {
        let state = self.inner.ready_state()?;
        for table in state.map.in_order().iter().rev() {
            let key = self.inner.key_for(table.version(), stream_id);
            if let Some(entry) = table.try_get_oldest_entry(key)? {
                return Ok(Some(entry));
            }
        }
        for mem in state.awaiting.iter().rev() {
            let key = self.inner.key_for(mem.version(), stream_id);
            if let Some(entry) = mem.try_get_oldest_entry(key) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Every entry whose key matches `stream_id`, newest first
    pub fn entries_for(&self, stream_id: &str) -> Result<Vec<IndexEntry>> {
        self.get_range(stream_id, 0, u32::MAX, None)
    }

    /// Entries whose key matches `stream_id` with
    /// `start <= event_number <= end`, newest first
    ///
    /// With a `limit`, only the newest `limit` entries are returned.
    pub fn get_range(
        &self,
        stream_id: &str,
        start: u32,
        end: u32,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry>> {
        let state = self.inner.ready_state()?;
        let mut candidates = Vec::new();
        for mem in &state.awaiting {
            let key = self.inner.key_for(mem.version(), stream_id);
            candidates.extend(mem.range(key, start, end, limit));
        }
        for table in state.map.in_order() {
            let key = self.inner.key_for(table.version(), stream_id);
            candidates.extend(table.range(key, start, end, limit)?);
        }
        sort_newest_first(&mut candidates);
        if let Some(limit) = limit {
            candidates.truncate(limit);
        }
        Ok(candidates)
    }

    // ========================================================================
    // Status and lifecycle
    // ========================================================================

    /// Highest log position covered by durable tables
    pub fn prepare_checkpoint(&self) -> Option<u64> {
        self.inner.state.load().map.prepare_checkpoint()
    }

    /// Highest commit position covered by durable tables
    pub fn commit_checkpoint(&self) -> Option<u64> {
        self.inner.state.load().map.commit_checkpoint()
    }

    /// Number of durable tables per level
    pub fn level_sizes(&self) -> Vec<usize> {
        self.inner
            .state
            .load()
            .map
            .levels()
            .iter()
            .map(Vec::len)
            .collect()
    }

    /// Total number of durable tables
    pub fn table_count(&self) -> usize {
        self.inner.state.load().map.table_count()
    }

    /// Memtables not yet flushed, including the one receiving writes
    pub fn memtable_count(&self) -> usize {
        self.inner.state.load().awaiting.len()
    }

    /// Hashers used to derive keys
    pub fn hashers(&self) -> &HasherPair {
        &self.inner.hashers
    }

    /// Configuration
    pub fn config(&self) -> &TableIndexConfig {
        &self.inner.config
    }

    /// Message of the last background failure, if any
    pub fn last_background_error(&self) -> Option<String> {
        self.inner.background.lock().last_error.clone()
    }

    /// Block until no flush or merge is pending or running
    pub fn wait_for_background(&self) {
        let mut background = self.inner.background.lock();
        while background.running {
            self.inner.background_idle.wait(&mut background);
        }
    }

    /// Stop accepting work and wait for pending flushes
    ///
    /// The memtable receiving writes is not flushed; its entries are
    /// re-indexed from the log on the next start. With `remove_files`, all
    /// index files are deleted once no reader holds them.
    pub fn close(&self, remove_files: bool) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.wait_for_background();
        let handle = self.inner.background.lock().handle.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        if remove_files {
            let _guard = self.inner.state_lock.lock();
            let state = self.inner.state.load_full();
            for table in state.map.levels().iter().flatten() {
                table.mark_for_destruction();
            }
            let config = &self.inner.config;
            self.inner.state.store(Arc::new(IndexState {
                awaiting: Vec::new(),
                map: Arc::new(IndexMap::empty(config.version, config.max_tables_per_level)),
            }));
            drop(state);
            remove_index_files(&config.directory)?;
        }

        info!(
            target: "streamindex::table_index",
            directory = %self.inner.config.directory.display(),
            remove_files,
            "Table index closed"
        );
        Ok(())
    }
}

impl std::fmt::Debug for TableIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableIndex")
            .field("directory", &self.inner.config.directory)
            .field("version", &self.inner.config.version)
            .field("levels", &self.level_sizes())
            .field("memtables", &self.memtable_count())
            .finish()
    }
}

impl Inner {
    fn key_for(&self, version: PTableVersion, stream_id: &str) -> u64 {
        self.hashers.key_for(version, stream_id)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IndexError::Closed);
        }
        if !self.initialized.load(Ordering::Acquire) {
            return Err(IndexError::NotInitialized);
        }
        Ok(())
    }

    fn ready_state(&self) -> Result<Arc<IndexState>> {
        self.ensure_ready()?;
        Ok(self.state.load_full())
    }

    fn add_batch<S: AsRef<str>>(
        self: &Arc<Self>,
        commit_position: u64,
        entries: &[(S, u32, u64)],
    ) -> Result<()> {
        self.ensure_ready()?;
        let rotated = {
            let _guard = self.state_lock.lock();
            let state = self.state.load();
            let current = state.current()?;
            self.reject_duplicates(&state, entries)?;
            for (stream_id, event_number, log_position) in entries {
                let key = self.key_for(current.version(), stream_id.as_ref());
                current.add(key, *event_number, *log_position);
            }
            current.mark_commit(commit_position);

            if current.count() >= self.config.max_size_for_memory {
                let mut awaiting = Vec::with_capacity(state.awaiting.len() + 1);
                awaiting.push(Arc::new(MemTable::new(self.config.version)));
                awaiting.extend(state.awaiting.iter().cloned());
                debug!(
                    target: "streamindex::table_index",
                    memtable = %current.id(),
                    entries = current.count(),
                    waiting = awaiting.len() - 1,
                    "Memtable rotated"
                );
                self.state.store(Arc::new(IndexState {
                    awaiting,
                    map: Arc::clone(&state.map),
                }));
                true
            } else {
                false
            }
        };
        if rotated {
            self.start_background()?;
        }
        Ok(())
    }

    /// Fail with `DuplicateEntry` if any entry's key and position are taken
    ///
    /// Memtables are always checked. Durable tables only need checking for
    /// positions at or below the map's prepare checkpoint.
    fn reject_duplicates<S: AsRef<str>>(
        &self,
        state: &IndexState,
        entries: &[(S, u32, u64)],
    ) -> Result<()> {
        let durable_through = state.map.prepare_checkpoint();
        let mut batch = HashSet::with_capacity(entries.len());
        for (stream_id, _, log_position) in entries {
            let stream_id: &str = stream_id.as_ref();
            let log_position = *log_position;
            let key = self.key_for(self.config.version, stream_id);

            let mut duplicate = !batch.insert((key, log_position))
                || state
                    .awaiting
                    .iter()
                    .any(|mem| mem.contains(self.key_for(mem.version(), stream_id), log_position));
            if !duplicate && durable_through.map_or(false, |cp| log_position <= cp) {
                for table in state.map.in_order() {
                    let table_key = self.key_for(table.version(), stream_id);
                    if table
                        .entries_for(table_key)?
                        .iter()
                        .any(|e| e.log_position == log_position)
                    {
                        duplicate = true;
                        break;
                    }
                }
            }
            if duplicate {
                return Err(IndexError::DuplicateEntry {
                    hash: key,
                    log_position,
                });
            }
        }
        Ok(())
    }

    fn start_background(self: &Arc<Self>) -> Result<()> {
        let mut background = self.background.lock();
        if background.running {
            return Ok(());
        }
        // A previous worker has finished; reap it
        if let Some(handle) = background.handle.take() {
            let _ = handle.join();
        }
        let inner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("streamindex-flush".to_string())
            .spawn(move || inner.run_background())?;
        background.running = true;
        background.handle = Some(handle);
        Ok(())
    }

    fn run_background(&self) {
        loop {
            let memtable = {
                let mut background = self.background.lock();
                let state = self.state.load();
                match state.awaiting.last() {
                    Some(oldest) if state.awaiting.len() > 1 => Arc::clone(oldest),
                    _ => {
                        background.running = false;
                        self.background_idle.notify_all();
                        return;
                    }
                }
            };

            if let Err(e) = self.flush(&memtable) {
                error!(
                    target: "streamindex::table_index",
                    memtable = %memtable.id(),
                    error = %e,
                    "Flush failed, index left unchanged"
                );
                let mut background = self.background.lock();
                background.last_error = Some(e.to_string());
                background.running = false;
                self.background_idle.notify_all();
                return;
            }
        }
    }

    fn flush(&self, memtable: &Arc<MemTable>) -> Result<()> {
        let config = &self.config;
        let directory = config.directory.as_path();

        let path = new_table_path(directory);
        let table = Arc::new(PTable::from_mem_table(memtable, &path, config.cache_depth)?);
        debug!(
            target: "streamindex::table_index",
            memtable = %memtable.id(),
            table = %table.id(),
            entries = table.count(),
            "Memtable flushed"
        );

        // Only this thread replaces the map, so it cannot change underneath
        let map = Arc::clone(&self.state.load().map);
        let merger = Merger::new(
            directory,
            config.version,
            config.cache_depth,
            &self.hashers,
            &self.readers,
        );
        let AddResult {
            map: new_map,
            merged_away,
        } = match map.add_table(
            Arc::clone(&table),
            memtable.prepare_checkpoint(),
            memtable.commit_checkpoint(),
            &merger,
        ) {
            Ok(result) => result,
            Err(e) => {
                table.mark_for_destruction();
                return Err(e);
            }
        };

        if let Err(e) = new_map.save(directory) {
            discard_unpublished(&map, &new_map);
            return Err(e);
        }

        {
            let _guard = self.state_lock.lock();
            let current = self.state.load();
            let awaiting = current
                .awaiting
                .iter()
                .filter(|m| !Arc::ptr_eq(m, memtable))
                .cloned()
                .collect();
            self.state.store(Arc::new(IndexState {
                awaiting,
                map: Arc::new(new_map),
            }));
        }

        for table in &merged_away {
            table.mark_for_destruction();
        }
        info!(
            target: "streamindex::table_index",
            table = %table.id(),
            merged = merged_away.len(),
            "Index map updated"
        );
        Ok(())
    }
}

/// Mark tables that appear in `new` but not in `old` for destruction
fn discard_unpublished(old: &IndexMap, new: &IndexMap) {
    let published: Vec<&Arc<PTable>> = old.levels().iter().flatten().collect();
    for table in new.levels().iter().flatten() {
        if !published.iter().any(|p| Arc::ptr_eq(p, table)) {
            table.mark_for_destruction();
        }
    }
}

fn is_temp_file(name: &str) -> bool {
    Path::new(name).extension().map_or(false, |ext| ext == "tmp")
}

fn is_table_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .map_or(false, |ext| ext == PTABLE_EXTENSION)
}

/// Delete every index file in `directory`
fn remove_index_files(directory: &Path) -> Result<()> {
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == INDEX_MAP_FILE_NAME || is_table_file(&name) || is_temp_file(&name) {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Delete temporary files and tables the map does not reference
fn remove_orphans(directory: &Path, referenced: &HashSet<String>) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let orphan = is_temp_file(&name) || (is_table_file(&name) && !referenced.contains(&name));
        if orphan {
            debug!(
                target: "streamindex::table_index",
                file = %name,
                "Removing orphaned index file"
            );
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}
