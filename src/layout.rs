//! Binary bucket layout shared by every operator.
//!
//! ```text
//!  byte 0        8            16           24
//!  ┌────────────┬────────────┬────────────┬──────────────────────────┐
//!  │ key  (i64) │ counter    │ flags      │ value[dim] (T) … padding │
//!  └────────────┴────────────┴────────────┴──────────────────────────┘
//!  stride = round_up_to_8(24 + dim * size_of::<T>())
//!
//! flags (u64):
//!   bits [7:0]  publish state  EMPTY=0 / CLAIMED=1 / READY=2
//!   bit  8      FILTERED
//!   bit  9      EXPORTED  (insert-succeeded mask)
//!   bit  10     EVICTED
//!   bit  11     LOCKED    (writer holds the row of an existing bucket)
//! ```
use crate::error::{Result, TableError};
use crate::hash::round_up_to_8;

pub const KEY_OFFSET: usize = 0;
pub const COUNTER_OFFSET: usize = 8;
pub const FLAGS_OFFSET: usize = 16;
pub const HEADER_BYTES: usize = 24;

pub const STATE_MASK: u64 = 0xff;
pub const FILTERED: u64 = 1 << 8;
pub const EXPORTED: u64 = 1 << 9;
pub const EVICTED: u64 = 1 << 10;
pub const LOCKED: u64 = 1 << 11;
pub const META_MASK: u64 = FILTERED | EXPORTED | EVICTED;

/// Publish state of a bucket, kept in the low byte of the flag word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BucketState {
    Empty = 0,
    Claimed = 1,
    Ready = 2,
}

impl BucketState {
    #[inline(always)]
    pub fn of(flags: u64) -> Self {
        match flags & STATE_MASK {
            0 => Self::Empty,
            1 => Self::Claimed,
            _ => Self::Ready,
        }
    }

    #[inline(always)]
    pub const fn bits(self) -> u64 {
        self as u64
    }
}

/// Decoded view of a bucket's flag word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Flags(pub u64);

impl Flags {
    #[inline(always)]
    pub fn state(self) -> BucketState {
        BucketState::of(self.0)
    }

    #[inline(always)]
    pub fn is_valid(self) -> bool {
        self.state() == BucketState::Ready
    }

    #[inline(always)]
    pub fn filtered(self) -> bool {
        self.0 & FILTERED != 0
    }

    #[inline(always)]
    pub fn exported(self) -> bool {
        self.0 & EXPORTED != 0
    }

    #[inline(always)]
    pub fn evicted(self) -> bool {
        self.0 & EVICTED != 0
    }

    #[inline(always)]
    pub fn locked(self) -> bool {
        self.0 & LOCKED != 0
    }

    /// Live and still waiting to be exported; these buckets make up
    /// `not_exported_count`.
    #[inline(always)]
    pub fn pending_export(self) -> bool {
        self.is_valid() && !self.evicted() && !self.exported()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BucketLayout {
    dim: usize,
    elem_bytes: usize,
    stride: usize,
}

impl BucketLayout {
    pub fn new(dim: usize, elem_bytes: usize) -> Self {
        Self {
            dim,
            elem_bytes,
            stride: round_up_to_8(HEADER_BYTES + dim * elem_bytes),
        }
    }

    /// Accepts an externally computed bucket size, which may include extra
    /// padding but never less than the packed row.
    pub fn with_bucket_size(
        dim: usize,
        elem_bytes: usize,
        bucket_size_byte: usize,
    ) -> Result<Self> {
        let min = Self::new(dim, elem_bytes);
        if bucket_size_byte < min.stride || bucket_size_byte % 8 != 0 {
            return Err(TableError::InvalidConfig(format!(
                "bucket_size_byte {bucket_size_byte} must be a multiple of 8 and at least {}",
                min.stride
            )));
        }
        Ok(Self {
            stride: bucket_size_byte,
            ..min
        })
    }

    #[inline(always)]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline(always)]
    pub fn elem_bytes(&self) -> usize {
        self.elem_bytes
    }

    #[inline(always)]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline(always)]
    pub fn words_per_bucket(&self) -> usize {
        self.stride / 8
    }

    #[inline(always)]
    pub fn bucket_offset(&self, slot: usize) -> usize {
        slot * self.stride
    }

    /// Byte offset of `value[i]` relative to the start of a bucket.
    #[inline(always)]
    pub fn value_offset(&self, i: usize) -> usize {
        HEADER_BYTES + i * self.elem_bytes
    }
}
