//! MurmurHash3 (x86, 32-bit) specialised to a single 8-byte key.
//!
//! Every operator that touches a table derives the home slot of a key from
//! this function, so it must stay bit-identical across lookup, import and
//! optimizer paths.

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;
const KEY_BYTES: u32 = 8;

#[inline(always)]
fn mix_block(h: u32, block: u32) -> u32 {
    let k = block.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
    (h ^ k).rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64)
}

#[inline(always)]
fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^ (h >> 16)
}

/// Hashes the little-endian bytes of `key` as two 4-byte blocks.
#[inline(always)]
pub fn murmur3_32(key: i64, seed: u32) -> u32 {
    let bits = key as u64;
    let mut h = mix_block(seed, bits as u32);
    h = mix_block(h, (bits >> 32) as u32);
    fmix32(h ^ KEY_BYTES)
}

/// Seed-0 hash used by every operator unless the table overrides it.
#[inline(always)]
pub fn hash(key: i64) -> u32 {
    murmur3_32(key, 0)
}

/// First bucket probed for `key` in a table of `table_size` buckets.
#[inline(always)]
pub fn home_slot(key: i64, seed: u32, table_size: usize) -> usize {
    murmur3_32(key, seed) as usize % table_size
}

#[inline(always)]
pub const fn round_up_to_8(n: usize) -> usize {
    (n + 7) & !7
}
