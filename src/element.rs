//! Storage element types and packed word access.
//!
//! Buckets and optimizer state are stored as `AtomicU64` words. Elements of
//! 2 or 4 bytes are packed little-end-first inside those words; an element
//! never straddles two words since every region starts 8-aligned and
//! element offsets are multiples of the element width.
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use half::{bf16, f16};

/// A value type that can live in a bucket's `value[]` region.
///
/// Arithmetic always happens in `f32`; implementors only define how the
/// storage width converts to and from it.
pub trait Element: Copy + Default + PartialEq + Debug + Send + Sync + 'static {
    const BYTES: usize;

    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
    fn to_bits(self) -> u32;
    fn from_bits(bits: u32) -> Self;
}

impl Element for f32 {
    const BYTES: usize = 4;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }

    #[inline(always)]
    fn to_bits(self) -> u32 {
        f32::to_bits(self)
    }

    #[inline(always)]
    fn from_bits(bits: u32) -> Self {
        f32::from_bits(bits)
    }
}

impl Element for f16 {
    const BYTES: usize = 2;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }

    #[inline(always)]
    fn to_bits(self) -> u32 {
        f16::to_bits(self) as u32
    }

    #[inline(always)]
    fn from_bits(bits: u32) -> Self {
        f16::from_bits(bits as u16)
    }
}

impl Element for bf16 {
    const BYTES: usize = 2;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }

    #[inline(always)]
    fn to_bits(self) -> u32 {
        bf16::to_bits(self) as u32
    }

    #[inline(always)]
    fn from_bits(bits: u32) -> Self {
        bf16::from_bits(bits as u16)
    }
}

#[inline(always)]
fn lane<T: Element>(byte_offset: usize) -> (usize, u32, u64) {
    debug_assert_eq!(byte_offset % T::BYTES, 0);
    let shift = ((byte_offset % 8) * 8) as u32;
    let mask = (u64::MAX >> (64 - 8 * T::BYTES as u32)) << shift;
    (byte_offset / 8, shift, mask)
}

/// Reads the element at `byte_offset` of a word region.
#[inline(always)]
pub(crate) fn load<T: Element>(words: &[AtomicU64], byte_offset: usize) -> T {
    let (word, shift, mask) = lane::<T>(byte_offset);
    let bits = (words[word].load(Ordering::Relaxed) & mask) >> shift;
    T::from_bits(bits as u32)
}

/// Writes the element at `byte_offset`.
///
/// Not an atomic read-modify-write: only the current owner of the region may
/// call this, otherwise neighbouring lanes of the same word can be lost.
#[inline(always)]
pub(crate) fn store<T: Element>(words: &[AtomicU64], byte_offset: usize, value: T) {
    let (word, shift, mask) = lane::<T>(byte_offset);
    let cell = &words[word];
    let old = cell.load(Ordering::Relaxed);
    let new = (old & !mask) | (((value.to_bits() as u64) << shift) & mask);
    cell.store(new, Ordering::Relaxed);
}

/// Fixed-length array of packed elements, used for per-slot optimizer state.
pub struct PackedArray<T> {
    words: Box<[AtomicU64]>,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> PackedArray<T> {
    pub fn new(len: usize, fill: T) -> Self {
        let per_word = 8 / T::BYTES;
        let mut word = 0u64;
        for lane in 0..per_word {
            word |= (fill.to_bits() as u64) << (lane * T::BYTES * 8);
        }
        let words = (0..len.div_ceil(per_word))
            .map(|_| AtomicU64::new(word))
            .collect();
        Self {
            words,
            len,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> T {
        assert!(index < self.len, "index {index} out of bounds ({})", self.len);
        load(&self.words, index * T::BYTES)
    }

    /// Same single-writer contract as [`store`].
    #[inline(always)]
    pub(crate) fn set(&self, index: usize, value: T) {
        assert!(index < self.len, "index {index} out of bounds ({})", self.len);
        store(&self.words, index * T::BYTES, value)
    }

    pub fn to_vec(&self) -> Vec<T> {
        (0..self.len).map(|i| self.get(i)).collect()
    }
}
