//! PTable file format
//!
//! # Format
//!
//! ```text
//! +------------------+
//! | Magic: "SIPT"    | 4 bytes
//! | Version          | 1 byte  (1 = 32-bit hash, 2 = 64-bit hash)
//! | Reserved         | 3 bytes (zero)
//! | Entry * N        | 16 bytes (v1) or 20 bytes (v2) each
//! | CRC32            | 4 bytes (header + entries)
//! +------------------+
//! ```
//!
//! Entry layout, little-endian:
//!
//! ```text
//! v1: | hash u32 | event_number u32 | log_position u64 |
//! v2: | hash u64 | event_number u32 | log_position u64 |
//! ```
//!
//! Entries are sorted by hash, then log position, then event number, all
//! ascending. The entry count is implied by the file length.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use streamindex_core::{IndexEntry, IndexError, PTableVersion, Result};

/// PTable magic bytes: "SIPT" (0x53495054)
pub const PTABLE_MAGIC: [u8; 4] = *b"SIPT";

/// Size of the table header
pub const PTABLE_HEADER_SIZE: usize = 8;

/// Size of the CRC32 footer
pub const PTABLE_FOOTER_SIZE: usize = 4;

/// File extension of table files
pub const PTABLE_EXTENSION: &str = "ptable";

/// Table header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PTableHeader {
    /// Entry format of the table
    pub version: PTableVersion,
}

impl PTableHeader {
    /// Create a header
    pub fn new(version: PTableVersion) -> Self {
        PTableHeader { version }
    }

    /// Serialize the header
    pub fn to_bytes(&self) -> [u8; PTABLE_HEADER_SIZE] {
        let mut bytes = [0u8; PTABLE_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&PTABLE_MAGIC);
        bytes[4] = self.version.as_u8();
        bytes
    }

    /// Parse a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PTABLE_HEADER_SIZE {
            return Err(IndexError::corrupt("table header too short"));
        }
        if bytes[0..4] != PTABLE_MAGIC {
            return Err(IndexError::InvalidMagic);
        }
        let version =
            PTableVersion::from_u8(bytes[4]).ok_or(IndexError::UnsupportedVersion(bytes[4]))?;
        Ok(PTableHeader { version })
    }
}

/// Number of entries in a table file of `file_len` bytes
pub fn entry_count(file_len: u64, version: PTableVersion) -> Result<usize> {
    let overhead = (PTABLE_HEADER_SIZE + PTABLE_FOOTER_SIZE) as u64;
    if file_len < overhead {
        return Err(IndexError::corrupt(format!(
            "table file of {} bytes is shorter than header and footer",
            file_len
        )));
    }
    let body = file_len - overhead;
    let size = version.entry_size() as u64;
    if body % size != 0 {
        return Err(IndexError::corrupt(format!(
            "table body of {} bytes is not a multiple of the {}-byte entry size",
            body, size
        )));
    }
    Ok((body / size) as usize)
}

/// Byte offset of entry `index`
#[inline]
pub fn entry_offset(index: usize, version: PTableVersion) -> u64 {
    (PTABLE_HEADER_SIZE + index * version.entry_size()) as u64
}

/// Append the encoded entry to `buf`
pub fn encode_entry(buf: &mut Vec<u8>, entry: &IndexEntry, version: PTableVersion) -> Result<()> {
    match version {
        PTableVersion::V1 => {
            let hash = u32::try_from(entry.hash).map_err(|_| {
                IndexError::corrupt(format!(
                    "hash {:016x} does not fit a 32-bit table",
                    entry.hash
                ))
            })?;
            buf.write_u32::<LittleEndian>(hash)?;
        }
        PTableVersion::V2 => buf.write_u64::<LittleEndian>(entry.hash)?,
    }
    buf.write_u32::<LittleEndian>(entry.event_number)?;
    buf.write_u64::<LittleEndian>(entry.log_position)?;
    Ok(())
}

/// Decode one entry from the front of `bytes`
///
/// `bytes` must hold at least `version.entry_size()` bytes.
#[inline]
pub fn decode_entry(bytes: &[u8], version: PTableVersion) -> IndexEntry {
    let h = version.hash_size();
    let hash = match version {
        PTableVersion::V1 => LittleEndian::read_u32(&bytes[0..4]) as u64,
        PTableVersion::V2 => LittleEndian::read_u64(&bytes[0..8]),
    };
    IndexEntry {
        hash,
        event_number: LittleEndian::read_u32(&bytes[h..h + 4]),
        log_position: LittleEndian::read_u64(&bytes[h + 4..h + 12]),
    }
}
