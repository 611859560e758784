//! Stream id hashing
//!
//! The index never stores stream names. Each entry is keyed by a hash of the
//! stream id, built from two independent 32-bit hash functions:
//!
//! ```text
//! combined = (high << 32) | low
//! ```
//!
//! Using two unrelated algorithms makes a collision on *both* halves very
//! unlikely, but the reader still treats an equal key as "possibly another
//! stream" and verifies against the log.
//!
//! Hashes are persisted in table files, so every hasher here must be
//! deterministic and stable across releases.

mod murmur3;
mod xxhash;

pub use murmur3::Murmur3Hasher;
pub use xxhash::XxHasher;

use std::fmt;
use std::sync::Arc;

use crate::entry::PTableVersion;

/// Seed shared by the built-in hashers
pub const HASH_SEED: u32 = 0xc58f_1a7b;

/// A 32-bit hash over a stream id
pub trait Hasher: Send + Sync {
    /// Hash the stream id
    fn hash(&self, stream_id: &str) -> u32;

    /// Stable name used in logs
    fn name(&self) -> &'static str;
}

/// Selector for a built-in hash function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HasherKind {
    /// 32-bit xxHash (XXH32)
    XxHash,
    /// MurmurHash3, x86 32-bit variant
    Murmur3,
}

impl HasherKind {
    /// Instantiate the selected hasher
    pub fn build(self) -> Arc<dyn Hasher> {
        match self {
            HasherKind::XxHash => Arc::new(XxHasher),
            HasherKind::Murmur3 => Arc::new(Murmur3Hasher),
        }
    }
}

/// The low/high hasher pair that produces index keys
#[derive(Clone)]
pub struct HasherPair {
    low: Arc<dyn Hasher>,
    high: Arc<dyn Hasher>,
}

impl HasherPair {
    /// Create a pair from two hashers
    pub fn new(low: Arc<dyn Hasher>, high: Arc<dyn Hasher>) -> Self {
        HasherPair { low, high }
    }

    /// Create a pair from configuration selectors
    pub fn from_kinds(low: HasherKind, high: HasherKind) -> Self {
        HasherPair::new(low.build(), high.build())
    }

    /// Low 32 bits of the key
    pub fn low(&self, stream_id: &str) -> u32 {
        self.low.hash(stream_id)
    }

    /// High 32 bits of the key
    pub fn high(&self, stream_id: &str) -> u32 {
        self.high.hash(stream_id)
    }

    /// Full 64-bit key
    pub fn combined(&self, stream_id: &str) -> u64 {
        ((self.high(stream_id) as u64) << 32) | self.low(stream_id) as u64
    }

    /// Key of `stream_id` in a table of the given version
    ///
    /// V1 tables only ever stored the low hash.
    pub fn key_for(&self, version: PTableVersion, stream_id: &str) -> u64 {
        match version {
            PTableVersion::V1 => self.low(stream_id) as u64,
            PTableVersion::V2 => self.combined(stream_id),
        }
    }
}

impl Default for HasherPair {
    fn default() -> Self {
        HasherPair::from_kinds(HasherKind::XxHash, HasherKind::Murmur3)
    }
}

impl fmt::Debug for HasherPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HasherPair")
            .field("low", &self.low.name())
            .field("high", &self.high.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_packs_high_then_low() {
        let pair = HasherPair::default();
        let id = "account--696193173";
        let combined = pair.combined(id);
        assert_eq!((combined >> 32) as u32, pair.high(id));
        assert_eq!(combined as u32, pair.low(id));
    }

    #[test]
    fn test_default_pair_values_are_stable() {
        let pair = HasherPair::default();
        assert_eq!(pair.low("account--696193173"), 0x5b32_850a);
        assert_eq!(pair.high("account--696193173"), 0x7627_27ab);
        assert_eq!(
            pair.combined("account--696193173"),
            0x7627_27ab_5b32_850a
        );
    }

    #[test]
    fn test_key_for_version() {
        let pair = HasherPair::default();
        let id = "LPN-FC002_LPK51001";
        assert_eq!(pair.key_for(PTableVersion::V1, id), pair.low(id) as u64);
        assert_eq!(pair.key_for(PTableVersion::V2, id), pair.combined(id));
    }

    #[test]
    fn test_known_low_hash_collision() {
        let pair = HasherPair::default();
        let a = "stream-44000";
        let b = "stream-182752";

        // Same 32-bit key, different 64-bit key
        assert_eq!(pair.key_for(PTableVersion::V1, a), 0x70ea_7e7b);
        assert_eq!(
            pair.key_for(PTableVersion::V1, a),
            pair.key_for(PTableVersion::V1, b)
        );
        assert_ne!(
            pair.key_for(PTableVersion::V2, a),
            pair.key_for(PTableVersion::V2, b)
        );
    }

    #[test]
    fn test_debug_names_hashers() {
        let text = format!("{:?}", HasherPair::default());
        assert!(text.contains("xxhash32"));
        assert!(text.contains("murmur3"));
    }
}
