//! Index map file format
//!
//! The `indexmap` file is the single source of truth for which table files
//! make up the durable index and at which level each sits. A table file not
//! listed here is an orphan (incomplete flush or merge output) and is
//! deleted on startup.
//!
//! # Format
//!
//! ```text
//! +--------------------+
//! | Magic: "SIMP"      | 4 bytes
//! | Format Version     | 4 bytes (u32 LE)
//! | PTable Version     | 1 byte
//! | Prepare Checkpoint | 8 bytes (u64 LE, u64::MAX = none)
//! | Commit Checkpoint  | 8 bytes (u64 LE, u64::MAX = none)
//! | Table Count        | 4 bytes (u32 LE)
//! | Table * N          | level u32 | position u32 | name_len u32 | name
//! | CRC32              | 4 bytes
//! +--------------------+
//! ```

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use streamindex_core::{IndexError, PTableVersion, Result};

use super::write_atomically;

/// Index map magic bytes: "SIMP" (0x53494D50)
pub const INDEX_MAP_MAGIC: [u8; 4] = *b"SIMP";

/// Current index map format version
pub const INDEX_MAP_FORMAT_VERSION: u32 = 1;

/// Name of the index map file inside the index directory
pub const INDEX_MAP_FILE_NAME: &str = "indexmap";

const NO_CHECKPOINT: u64 = u64::MAX;

// magic + format version + ptable version + two checkpoints + count
const FIXED_PREFIX: usize = 4 + 4 + 1 + 8 + 8 + 4;

/// One table listed in the map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapTableRecord {
    /// Merge level
    pub level: u32,
    /// Position within the level (0 = oldest)
    pub position: u32,
    /// File name relative to the index directory
    pub file_name: String,
}

/// Decoded index map file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMapFile {
    /// Version new tables and merges are written in
    pub version: PTableVersion,
    /// Highest log position covered by the listed tables
    pub prepare_checkpoint: Option<u64>,
    /// Highest commit position covered by the listed tables
    pub commit_checkpoint: Option<u64>,
    /// Tables, ordered by level then position
    pub tables: Vec<MapTableRecord>,
}

impl IndexMapFile {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FIXED_PREFIX + self.tables.len() * 48 + 4);

        bytes.extend_from_slice(&INDEX_MAP_MAGIC);
        bytes.extend_from_slice(&INDEX_MAP_FORMAT_VERSION.to_le_bytes());
        bytes.push(self.version.as_u8());
        bytes.extend_from_slice(&self.prepare_checkpoint.unwrap_or(NO_CHECKPOINT).to_le_bytes());
        bytes.extend_from_slice(&self.commit_checkpoint.unwrap_or(NO_CHECKPOINT).to_le_bytes());
        bytes.extend_from_slice(&(self.tables.len() as u32).to_le_bytes());

        for table in &self.tables {
            // Writing into a Vec cannot fail
            let _ = bytes.write_u32::<LittleEndian>(table.level);
            let _ = bytes.write_u32::<LittleEndian>(table.position);
            let _ = bytes.write_u32::<LittleEndian>(table.file_name.len() as u32);
            bytes.extend_from_slice(table.file_name.as_bytes());
        }

        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FIXED_PREFIX + 4 {
            return Err(IndexError::corrupt("index map too short"));
        }
        if bytes[0..4] != INDEX_MAP_MAGIC {
            return Err(IndexError::InvalidMagic);
        }

        let data = &bytes[..bytes.len() - 4];
        let stored_crc = LittleEndian::read_u32(&bytes[bytes.len() - 4..]);
        let computed_crc = crc32fast::hash(data);
        if stored_crc != computed_crc {
            return Err(IndexError::ChecksumMismatch {
                expected: stored_crc,
                computed: computed_crc,
            });
        }

        let format_version = LittleEndian::read_u32(&data[4..8]);
        if format_version != INDEX_MAP_FORMAT_VERSION {
            return Err(IndexError::corrupt(format!(
                "unknown index map format version {}",
                format_version
            )));
        }
        let version = PTableVersion::from_u8(data[8]).ok_or(IndexError::UnsupportedVersion(data[8]))?;
        let prepare_checkpoint = checkpoint(LittleEndian::read_u64(&data[9..17]));
        let commit_checkpoint = checkpoint(LittleEndian::read_u64(&data[17..25]));
        let count = LittleEndian::read_u32(&data[25..29]) as usize;

        let mut cursor = FIXED_PREFIX;
        // Every table takes at least 12 bytes; don't trust `count` further
        let mut tables = Vec::with_capacity(count.min((data.len() - FIXED_PREFIX) / 12));
        for _ in 0..count {
            if cursor + 12 > data.len() {
                return Err(IndexError::corrupt("index map truncated in table list"));
            }
            let level = LittleEndian::read_u32(&data[cursor..cursor + 4]);
            let position = LittleEndian::read_u32(&data[cursor + 4..cursor + 8]);
            let name_len = LittleEndian::read_u32(&data[cursor + 8..cursor + 12]) as usize;
            cursor += 12;

            if cursor + name_len > data.len() {
                return Err(IndexError::corrupt("index map truncated in table name"));
            }
            let file_name = String::from_utf8(data[cursor..cursor + name_len].to_vec())
                .map_err(|_| IndexError::corrupt("table name is not valid UTF-8"))?;
            cursor += name_len;

            if file_name.contains('/') || file_name.contains('\\') {
                return Err(IndexError::corrupt(format!(
                    "table name {:?} escapes the index directory",
                    file_name
                )));
            }

            tables.push(MapTableRecord {
                level,
                position,
                file_name,
            });
        }

        if cursor != data.len() {
            return Err(IndexError::corrupt("trailing bytes after table list"));
        }

        Ok(IndexMapFile {
            version,
            prepare_checkpoint,
            commit_checkpoint,
            tables,
        })
    }

    /// Persist atomically (write-fsync-rename)
    pub fn persist(&self, path: &Path) -> Result<()> {
        write_atomically(path, &self.to_bytes())?;
        Ok(())
    }

    /// Load from `path`, `None` if the file does not exist
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(IndexMapFile::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn checkpoint(raw: u64) -> Option<u64> {
    if raw == NO_CHECKPOINT {
        None
    } else {
        Some(raw)
    }
}
