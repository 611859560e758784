//! MurmurHash3 (x86, 32-bit) high hasher

use super::{Hasher, HASH_SEED};

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// MurmurHash3 x86_32 over the UTF-8 bytes of the stream id
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3Hasher;

impl Hasher for Murmur3Hasher {
    #[inline]
    fn hash(&self, stream_id: &str) -> u32 {
        murmur3_32(stream_id.as_bytes(), HASH_SEED)
    }

    fn name(&self) -> &'static str {
        "murmur3"
    }
}

#[inline]
fn mix_k(mut k: u32) -> u32 {
    k = k.wrapping_mul(C1);
    k = k.rotate_left(15);
    k.wrapping_mul(C2)
}

/// MurmurHash3_x86_32
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;

    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        h ^= mix_k(k);
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k |= (*byte as u32) << (8 * i);
        }
        h ^= mix_k(k);
    }

    // Length is mixed in modulo 2^32, as in the reference implementation
    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
