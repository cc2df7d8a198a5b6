//! Guard derivation.
//!
//! Guards partition the key space of each level. They are not configured:
//! they fall out of the keys themselves. A key is a guard at level L when
//! the low `num_bits(L)` bits of its 32-bit MurmurHash3 are all ones, with
//! `num_bits(L) = top_level_bits - L * bit_decrement`. Shallow levels
//! demand more matching bits, so their guards are sparser; each level a
//! guard is chosen for also contributes it to every deeper level.
//!
//! Once observed, a guard is persisted through the manifest and never
//! removed.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::{Comparator, Options, NUM_LEVELS};
use crate::version::FileMeta;

pub const GUARD_HASH_SEED: u32 = 42;

/// MurmurHash3 x86 32-bit.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k |= (b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^= h >> 16;
    h
}

/// Bits of the hash that must be set for a key to be a guard at `level`.
pub fn num_guard_bits(level: usize, opts: &Options) -> u32 {
    let bits = opts
        .guard_top_level_bits
        .saturating_sub(level as u32 * opts.guard_bit_decrement);
    bits.clamp(1, 31)
}

/// The shallowest level at which `key` qualifies as a guard, if any. A key
/// qualifying at level L is a guard on L and every deeper level.
pub fn guard_level(key: &[u8], opts: &Options) -> Option<usize> {
    let hash = murmur3_32(key, GUARD_HASH_SEED);
    for level in 0..NUM_LEVELS {
        let bits = num_guard_bits(level, opts);
        let mask = (1u32 << bits) - 1;
        if hash & mask == mask {
            return Some(level);
        }
    }
    None
}

/// A guard partition on one level: the guard key plus the files whose
/// smallest key falls in `[key, next guard key)`.
#[derive(Debug, Clone)]
pub struct GuardFiles {
    pub key: Vec<u8>,
    pub files: Vec<Arc<FileMeta>>,
}

impl GuardFiles {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            files: Vec::new(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.file_size).sum()
    }
}

/// Index of the guard covering `user_key` within `guard_keys` (sorted
/// ascending), or `None` when the key lies below the smallest guard and
/// belongs to the sentinel.
pub fn partition_of(guard_keys: &[Vec<u8>], user_key: &[u8], cmp: &dyn Comparator) -> Option<usize> {
    if guard_keys.is_empty() {
        return None;
    }
    // First guard key > user_key; the covering guard is the one before it.
    let upper = guard_keys.partition_point(|g| cmp.compare(g, user_key) != Ordering::Greater);
    upper.checked_sub(1)
}
