//! XXH32 low hasher

use xxhash_rust::xxh32::xxh32;

use super::{Hasher, HASH_SEED};

/// 32-bit xxHash over the UTF-8 bytes of the stream id
#[derive(Debug, Clone, Copy, Default)]
pub struct XxHasher;

impl Hasher for XxHasher {
    #[inline]
    fn hash(&self, stream_id: &str) -> u32 {
        xxh32(stream_id.as_bytes(), HASH_SEED)
    }

    fn name(&self) -> &'static str {
        "xxhash32"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vectors_unseeded() {
        assert_eq!(xxh32(b"", 0), 0x02cc_5d05);
        assert_eq!(xxh32(b"abc", 0), 0x32d1_53ff);
    }

    #[test]
    fn test_seeded_stream_hash() {
        assert_eq!(XxHasher.hash("stream-44000"), 0x70ea_7e7b);
        assert_eq!(XxHasher.hash("LPN-FC002_LPK51001"), 0x95b4_6daa);
    }
}
