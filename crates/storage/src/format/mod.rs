//! On-disk byte formats for tables and the index map.
//!
//! This module centralizes all serialization logic for persistent index
//! state. Keeping serialization separate from operational logic (how tables
//! are searched, merged and swapped) makes format evolution easier to manage.
//!
//! # Module Structure
//!
//! - `ptable`: table header and fixed-width entry encoding
//! - `index_map`: the `indexmap` file listing tables per level

pub mod index_map;
pub mod ptable;

pub use index_map::{
    IndexMapFile, MapTableRecord, INDEX_MAP_FILE_NAME, INDEX_MAP_FORMAT_VERSION, INDEX_MAP_MAGIC,
};
pub use ptable::{
    decode_entry, encode_entry, PTableHeader, PTABLE_EXTENSION, PTABLE_FOOTER_SIZE,
    PTABLE_HEADER_SIZE, PTABLE_MAGIC,
};

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Write `bytes` to `path` atomically (write-fsync-rename, then fsync the directory)
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let temp_path = path.with_extension("tmp");

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&temp_path, path)?;
    sync_parent_dir(path)
}

/// fsync the directory containing `path` so a rename is durable
pub(crate) fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if parent.exists() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
