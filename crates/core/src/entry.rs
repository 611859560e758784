//! Index entry and table version
//!
//! An [`IndexEntry`] is the fixed-size record stored in every table:
//! the stream key, the event number within that stream, and the position
//! of the event's record in the transaction log.

use std::cmp::Ordering;
use std::fmt;

/// Table format version
///
/// Selects the width of the stored hash and therefore the entry size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PTableVersion {
    /// 32-bit key (low hash only), 16-byte entries
    V1 = 1,
    /// 64-bit key (high and low hash), 20-byte entries
    V2 = 2,
}

impl PTableVersion {
    /// Newest version, used for new tables unless configured otherwise
    pub const LATEST: PTableVersion = PTableVersion::V2;

    /// Size in bytes of one encoded entry
    pub const fn entry_size(self) -> usize {
        match self {
            PTableVersion::V1 => 16,
            PTableVersion::V2 => 20,
        }
    }

    /// Size in bytes of the encoded hash
    pub const fn hash_size(self) -> usize {
        match self {
            PTableVersion::V1 => 4,
            PTableVersion::V2 => 8,
        }
    }

    /// Parse the on-disk version tag
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(PTableVersion::V1),
            2 => Some(PTableVersion::V2),
            _ => None,
        }
    }

    /// On-disk version tag
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl Default for PTableVersion {
    fn default() -> Self {
        PTableVersion::LATEST
    }
}

impl fmt::Display for PTableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// One index record
///
/// Ordering is the storage order of a table: hash ascending, then log
/// position ascending, then event number ascending. Walking one hash's run
/// backwards therefore yields entries newest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexEntry {
    /// Index key (version dependent, see `HasherPair::key_for`)
    pub hash: u64,
    /// Event number within the stream
    pub event_number: u32,
    /// Position of the event's record in the transaction log
    pub log_position: u64,
}

impl IndexEntry {
    /// Create an entry
    pub const fn new(hash: u64, event_number: u32, log_position: u64) -> Self {
        IndexEntry {
            hash,
            event_number,
            log_position,
        }
    }

    /// Recency order: greater means newer
    ///
    /// Log positions increase monotonically, so position decides; the event
    /// number only breaks ties that well-formed input never produces.
    pub fn cmp_recency(&self, other: &Self) -> Ordering {
        self.log_position
            .cmp(&other.log_position)
            .then(self.event_number.cmp(&other.event_number))
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash
            .cmp(&other.hash)
            .then(self.log_position.cmp(&other.log_position))
            .then(self.event_number.cmp(&other.event_number))
    }
}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sort entries newest-first
pub fn sort_newest_first(entries: &mut [IndexEntry]) {
    entries.sort_unstable_by(|a, b| b.cmp_recency(a));
}
