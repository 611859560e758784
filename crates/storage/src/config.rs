//! Table index configuration.
//!
//! This module provides configuration for the table index: memtable
//! capacity, merge fan-in, table format and the hasher selection.

use std::path::PathBuf;

use streamindex_core::{HasherKind, HasherPair, IndexError, PTableVersion};

/// Table index configuration parameters.
#[derive(Debug, Clone)]
pub struct TableIndexConfig {
    /// Directory holding table files and the index map.
    pub directory: PathBuf,

    /// Entries a memtable holds before it is rotated out and flushed
    /// (default: 1,000,000).
    pub max_size_for_memory: usize,

    /// Tables a level may hold before it is merged into the next level
    /// (default: 4).
    pub max_tables_per_level: usize,

    /// Format of newly written tables (default: V2).
    ///
    /// Merges into a V2 index upgrade any V1 input tables.
    pub version: PTableVersion,

    /// Depth of the per-table midpoint cache (default: 16).
    ///
    /// Up to `2^cache_depth` keys per table are kept in memory to narrow
    /// binary searches.
    pub cache_depth: u32,

    /// Hash function for the low 32 bits of the key.
    pub low_hasher: HasherKind,

    /// Hash function for the high 32 bits of the key.
    pub high_hasher: HasherKind,
}

impl Default for TableIndexConfig {
    fn default() -> Self {
        TableIndexConfig {
            directory: PathBuf::from("index"),
            max_size_for_memory: 1_000_000,
            max_tables_per_level: 4,
            version: PTableVersion::V2,
            cache_depth: 16,
            low_hasher: HasherKind::XxHash,
            high_hasher: HasherKind::Murmur3,
        }
    }
}

impl TableIndexConfig {
    /// Create a configuration with default values rooted at `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        TableIndexConfig {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Set memtable capacity (builder pattern).
    pub fn with_max_size_for_memory(mut self, entries: usize) -> Self {
        self.max_size_for_memory = entries;
        self
    }

    /// Set merge fan-in (builder pattern).
    pub fn with_max_tables_per_level(mut self, tables: usize) -> Self {
        self.max_tables_per_level = tables;
        self
    }

    /// Set table format version (builder pattern).
    pub fn with_version(mut self, version: PTableVersion) -> Self {
        self.version = version;
        self
    }

    /// Set midpoint cache depth (builder pattern).
    pub fn with_cache_depth(mut self, depth: u32) -> Self {
        self.cache_depth = depth;
        self
    }

    /// Set the hash functions (builder pattern).
    pub fn with_hashers(mut self, low: HasherKind, high: HasherKind) -> Self {
        self.low_hasher = low;
        self.high_hasher = high;
        self
    }

    /// Hasher pair selected by this configuration.
    pub fn hasher_pair(&self) -> HasherPair {
        HasherPair::from_kinds(self.low_hasher, self.high_hasher)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size_for_memory == 0 {
            return Err(ConfigError::ZeroMemTableSize);
        }
        if self.max_tables_per_level < 2 {
            return Err(ConfigError::TablesPerLevelTooSmall(
                self.max_tables_per_level,
            ));
        }
        if self.cache_depth > 28 {
            return Err(ConfigError::CacheDepthTooLarge(self.cache_depth));
        }
        if self.directory.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDirectory);
        }
        Ok(())
    }

    /// Create a configuration for testing (tiny memtables, frequent merges).
    pub fn for_testing(directory: impl Into<PathBuf>) -> Self {
        TableIndexConfig {
            directory: directory.into(),
            max_size_for_memory: 5,
            max_tables_per_level: 2,
            version: PTableVersion::V2,
            cache_depth: 4,
            low_hasher: HasherKind::XxHash,
            high_hasher: HasherKind::Murmur3,
        }
    }
}

/// Table index configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Memtable capacity is zero.
    #[error("Memtable size must be at least 1 entry")]
    ZeroMemTableSize,

    /// A level must hold at least two tables to merge.
    #[error("Max tables per level must be at least 2, got {0}")]
    TablesPerLevelTooSmall(usize),

    /// Midpoint cache would not fit in memory.
    #[error("Cache depth must be at most 28, got {0}")]
    CacheDepthTooLarge(u32),

    /// No index directory configured.
    #[error("Index directory must not be empty")]
    EmptyDirectory,
}

impl From<ConfigError> for IndexError {
    fn from(err: ConfigError) -> Self {
        IndexError::InvalidConfig(err.to_string())
    }
}
