//! Level structure of the durable index
//!
//! An `IndexMap` is an immutable snapshot of which tables exist at which
//! level, plus the log checkpoints the tables cover. Adding a table never
//! mutates a map: it produces a new map, which the owner persists and then
//! publishes.
//!
//! # Merge policy
//!
//! New tables enter level 0. Whenever a level holds more than
//! `max_tables_per_level` tables, all of them are merged into one table
//! appended to the next level, which may overflow in turn.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use streamindex_core::{IndexError, PTableVersion, Result};
use tracing::debug;

use crate::format::index_map::{IndexMapFile, MapTableRecord, INDEX_MAP_FILE_NAME};
use crate::merge::Merger;
use crate::ptable::PTable;

/// More levels than any real index reaches (2^64 tables at fan-in 2)
const MAX_LEVELS: usize = 64;

/// Immutable snapshot of the table levels
#[derive(Debug, Clone)]
pub struct IndexMap {
    version: PTableVersion,
    prepare_checkpoint: Option<u64>,
    commit_checkpoint: Option<u64>,
    // Each level is ordered oldest first
    levels: Vec<Vec<Arc<PTable>>>,
    max_tables_per_level: usize,
}

/// Outcome of [`IndexMap::add_table`]
#[derive(Debug)]
pub struct AddResult {
    /// The map including the new table and any merge output
    pub map: IndexMap,
    /// Tables replaced by merges, to be destroyed once the map is published
    pub merged_away: Vec<Arc<PTable>>,
}

impl IndexMap {
    /// A map with no tables
    pub fn empty(version: PTableVersion, max_tables_per_level: usize) -> Self {
        IndexMap {
            version,
            prepare_checkpoint: None,
            commit_checkpoint: None,
            levels: Vec::new(),
            max_tables_per_level,
        }
    }

    /// Version new tables are written in
    pub fn version(&self) -> PTableVersion {
        self.version
    }

    /// Highest log position covered by the tables
    pub fn prepare_checkpoint(&self) -> Option<u64> {
        self.prepare_checkpoint
    }

    /// Highest commit position covered by the tables
    pub fn commit_checkpoint(&self) -> Option<u64> {
        self.commit_checkpoint
    }

    /// Tables per level, oldest first within a level
    pub fn levels(&self) -> &[Vec<Arc<PTable>>] {
        &self.levels
    }

    /// Total number of tables
    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Total number of entries across all tables
    pub fn entry_count(&self) -> usize {
        self.levels.iter().flatten().map(|t| t.count()).sum()
    }

    /// Tables newest first: level 0 from the last added, then level 1, ...
    pub fn in_order(&self) -> Vec<Arc<PTable>> {
        self.levels
            .iter()
            .flat_map(|level| level.iter().rev().cloned())
            .collect()
    }

    /// File names of every table
    pub fn file_names(&self) -> HashSet<String> {
        self.levels.iter().flatten().map(|t| t.file_name()).collect()
    }

    /// Add a freshly flushed table and apply the merge policy
    ///
    /// Checkpoints only move forward. If a merge fails, tables it already
    /// produced are marked for destruction and `self` is left as it was.
    pub fn add_table(
        &self,
        table: Arc<PTable>,
        prepare_checkpoint: Option<u64>,
        commit_checkpoint: Option<u64>,
        merger: &Merger<'_>,
    ) -> Result<AddResult> {
        let mut levels = self.levels.clone();
        if levels.is_empty() {
            levels.push(Vec::new());
        }
        levels[0].push(table);

        let mut merged_away = Vec::new();
        let mut created: Vec<Arc<PTable>> = Vec::new();

        let mut level = 0;
        while level < levels.len() {
            if levels[level].len() > self.max_tables_per_level {
                let inputs = std::mem::take(&mut levels[level]);
                debug!(
                    target: "streamindex::index_map",
                    level,
                    tables = inputs.len(),
                    "Level overflow, merging"
                );
                let output = match merger.merge(&inputs) {
                    Ok(output) => output,
                    Err(e) => {
                        for table in &created {
                            table.mark_for_destruction();
                        }
                        return Err(e);
                    }
                };
                let merged = Arc::new(output.table);
                created.push(Arc::clone(&merged));
                merged_away.extend(inputs);

                if levels.len() == level + 1 {
                    levels.push(Vec::new());
                }
                levels[level + 1].push(merged);
            }
            level += 1;
        }

        // Intermediate merge output that a later merge consumed is garbage too
        for table in &merged_away {
            if created.iter().any(|c| Arc::ptr_eq(c, table)) {
                table.mark_for_destruction();
            }
        }
        merged_away.retain(|t| !created.iter().any(|c| Arc::ptr_eq(c, t)));

        let map = IndexMap {
            version: merger.version(),
            prepare_checkpoint: max_checkpoint(self.prepare_checkpoint, prepare_checkpoint),
            commit_checkpoint: max_checkpoint(self.commit_checkpoint, commit_checkpoint),
            levels,
            max_tables_per_level: self.max_tables_per_level,
        };
        Ok(AddResult { map, merged_away })
    }

    /// Persist the map into `directory`
    pub fn save(&self, directory: &Path) -> Result<()> {
        let mut tables = Vec::with_capacity(self.table_count());
        for (level, level_tables) in self.levels.iter().enumerate() {
            for (position, table) in level_tables.iter().enumerate() {
                tables.push(MapTableRecord {
                    level: level as u32,
                    position: position as u32,
                    file_name: table.file_name(),
                });
            }
        }
        let file = IndexMapFile {
            version: self.version,
            prepare_checkpoint: self.prepare_checkpoint,
            commit_checkpoint: self.commit_checkpoint,
            tables,
        };
        file.persist(&directory.join(INDEX_MAP_FILE_NAME))
    }

    /// Load the map in `directory` and open its tables
    ///
    /// Returns `None` when no map has been written yet. A listed table that
    /// is missing or fails verification is reported as corruption.
    pub fn load(
        directory: &Path,
        max_tables_per_level: usize,
        cache_depth: u32,
    ) -> Result<Option<IndexMap>> {
        let Some(file) = IndexMapFile::load(&directory.join(INDEX_MAP_FILE_NAME))? else {
            return Ok(None);
        };

        let mut records = file.tables;
        records.sort_by_key(|r| (r.level, r.position));

        let mut levels: Vec<Vec<Arc<PTable>>> = Vec::new();
        for record in records {
            let level = record.level as usize;
            if level >= MAX_LEVELS {
                return Err(IndexError::corrupt(format!(
                    "index map lists a table at level {}",
                    record.level
                )));
            }
            while levels.len() <= level {
                levels.push(Vec::new());
            }
            if record.position as usize != levels[level].len() {
                return Err(IndexError::corrupt(format!(
                    "index map has a gap at level {} position {}",
                    record.level, record.position
                )));
            }

            let path = directory.join(&record.file_name);
            let table = PTable::open(&path, cache_depth).map_err(|e| match e {
                IndexError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    IndexError::corrupt(format!("table {} listed in map is missing", record.file_name))
                }
                other => other,
            })?;
            if table.version() > file.version {
                return Err(IndexError::corrupt(format!(
                    "table {} is {} in a {} index",
                    record.file_name,
                    table.version(),
                    file.version
                )));
            }
            levels[level].push(Arc::new(table));
        }

        Ok(Some(IndexMap {
            version: file.version,
            prepare_checkpoint: file.prepare_checkpoint,
            commit_checkpoint: file.commit_checkpoint,
            levels,
            max_tables_per_level,
        }))
    }

    /// Same tables under a different write version
    pub(crate) fn with_version(mut self, version: PTableVersion) -> Self {
        self.version = version;
        self
    }
}

fn max_checkpoint(current: Option<u64>, new: Option<u64>) -> Option<u64> {
    match (current, new) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
