//! Fixed-capacity, open-addressed embedding table.
//!
//! # Architecture
//!
//! ```text
//!  words: Box<[AtomicU64]>  (table_size * stride / 8 words, zeroed)
//! ┌─────────────────────────────┬─────────────────────────────┬───
//! │ bucket 0                    │ bucket 1                    │ …
//! │ key │ counter │ flags │ row │ key │ counter │ flags │ row │
//! └─────────────────────────────┴─────────────────────────────┴───
//!
//!  counters: TableCounters { total, not_exported }
//! ```
//!
//! A key's probe sequence starts at `murmur3(key) % table_size` and walks
//! forward one bucket at a time, wrapping around, for at most `table_size`
//! steps. Buckets are claimed with a CAS on the flag word (`EMPTY ->
//! CLAIMED`); the winner is the only writer of the key and row until it
//! publishes `READY` with a release store. Every other prober waits for
//! `READY` (acquire) before it reads the key. Buckets are never freed, so a
//! `READY` bucket keeps its key for the lifetime of the table.
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use tracing::debug;

use crate::backoff::{Backoff, DEFAULT_SPIN_LIMIT};
use crate::config::TableConfig;
use crate::element::{self, Element};
use crate::error::{Result, TableError};
use crate::hash::home_slot;
use crate::layout::{
    BucketLayout, BucketState, COUNTER_OFFSET, EVICTED, EXPORTED, FLAGS_OFFSET, Flags, KEY_OFFSET,
    LOCKED, META_MASK,
};

/// Process-wide counters of one table.
///
/// `total` counts live keys; `not_exported` counts live keys whose
/// `EXPORTED` bit is unset. Both only move inside the claim, eviction,
/// recovery, import and export paths.
#[derive(Debug, Default)]
pub struct TableCounters {
    total: AtomicI64,
    not_exported: AtomicI64,
}

impl TableCounters {
    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn not_exported(&self) -> i64 {
        self.not_exported.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn add_total(&self, delta: i64) {
        self.total.fetch_add(delta, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn add_not_exported(&self, delta: i64) {
        self.not_exported.fetch_add(delta, Ordering::AcqRel);
    }
}

/// Borrowed view of one bucket.
pub(crate) struct Bucket<'a, T> {
    words: &'a [AtomicU64],
    layout: &'a BucketLayout,
    slot: usize,
    _marker: PhantomData<T>,
}

impl<'a, T: Element> Bucket<'a, T> {
    #[inline(always)]
    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    #[inline(always)]
    pub(crate) fn key(&self) -> i64 {
        self.words[KEY_OFFSET / 8].load(Ordering::Relaxed) as i64
    }

    #[inline(always)]
    fn set_key(&self, key: i64) {
        self.words[KEY_OFFSET / 8].store(key as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn counter(&self) -> u64 {
        self.words[COUNTER_OFFSET / 8].load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn set_counter(&self, counter: u64) {
        self.words[COUNTER_OFFSET / 8].store(counter, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn bump_counter(&self) -> u64 {
        self.words[COUNTER_OFFSET / 8].fetch_add(1, Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn flags_cell(&self) -> &'a AtomicU64 {
        &self.words[FLAGS_OFFSET / 8]
    }

    #[inline(always)]
    pub(crate) fn flags(&self) -> Flags {
        Flags(self.flags_cell().load(Ordering::Acquire))
    }

    #[inline(always)]
    pub(crate) fn value(&self, i: usize) -> T {
        element::load(self.words, self.layout.value_offset(i))
    }

    #[inline(always)]
    pub(crate) fn set_value(&self, i: usize, v: T) {
        element::store(self.words, self.layout.value_offset(i), v)
    }

    pub(crate) fn read_row(&self, out: &mut [T]) {
        for (i, v) in out.iter_mut().enumerate() {
            *v = self.value(i);
        }
    }

    pub(crate) fn write_row(&self, row: &[T]) {
        for (i, &v) in row.iter().enumerate() {
            self.set_value(i, v);
        }
    }

    /// Atomically rewrites the flag bits covered by `mask`, keeping the
    /// state byte and every other bit. Returns the previous flags.
    pub(crate) fn replace_meta(&self, mask: u64, bits: u64) -> Flags {
        let cell = self.flags_cell();
        let mut current = cell.load(Ordering::Acquire);
        loop {
            let next = (current & !mask) | (bits & mask);
            match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Flags(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Atomically applies `update` to the flags if `pred` holds. Returns the
    /// flags that were replaced, or `None` if `pred` failed.
    pub(crate) fn transition(
        &self,
        pred: impl Fn(Flags) -> bool,
        update: impl Fn(u64) -> u64,
    ) -> Option<Flags> {
        let cell = self.flags_cell();
        let mut current = cell.load(Ordering::Acquire);
        loop {
            if !pred(Flags(current)) {
                return None;
            }
            match cell.compare_exchange_weak(
                current,
                update(current),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Flags(current)),
                Err(actual) => current = actual,
            }
        }
    }

    fn entry(&self) -> Entry<T> {
        let mut values = vec![T::default(); self.layout.dim()];
        self.read_row(&mut values);
        Entry {
            slot: self.slot,
            key: self.key(),
            counter: self.counter(),
            flags: self.flags(),
            values,
        }
    }
}

/// Exclusive writer of an existing bucket's row, released on drop.
///
/// Claimed buckets already have a single writer; this guard gives the same
/// guarantee to paths that rewrite a bucket that is already `READY`
/// (import overwrite, optimizer update), so two workers holding the same key
/// never interleave their row writes.
pub(crate) struct RowGuard<'a, T> {
    bucket: Bucket<'a, T>,
}

impl<'a, T: Element> RowGuard<'a, T> {
    pub(crate) fn bucket(&self) -> &Bucket<'a, T> {
        &self.bucket
    }
}

impl<T> Drop for RowGuard<'_, T> {
    fn drop(&mut self) {
        self.bucket.words[FLAGS_OFFSET / 8].fetch_and(!LOCKED, Ordering::Release);
    }
}

/// Outcome of a successful claim-or-find probe.
pub(crate) enum Probe<'a, T> {
    /// The bucket was empty and now holds the key.
    Claimed(Bucket<'a, T>),
    /// The key was already resident; carries the flags observed at `READY`.
    Existing(Bucket<'a, T>, Flags),
}

/// Snapshot of one bucket taken at a quiescent point.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry<T> {
    pub slot: usize,
    pub key: i64,
    pub counter: u64,
    pub flags: Flags,
    pub values: Vec<T>,
}

pub struct EmbeddingTable<T> {
    words: Box<[AtomicU64]>,
    layout: BucketLayout,
    table_size: usize,
    seed: u32,
    counters: TableCounters,
    _marker: PhantomData<T>,
}

/// Shared handle to a table, passed to every operator call.
pub type TableHandle<T> = Arc<EmbeddingTable<T>>;

impl<T: Element> EmbeddingTable<T> {
    pub fn new(config: &TableConfig) -> Result<Self> {
        let layout = config.layout(T::BYTES)?;
        let words = (0..config.table_size * layout.words_per_bucket())
            .map(|_| AtomicU64::new(0))
            .collect();
        debug!(
            table_size = config.table_size,
            dim = config.dim,
            stride = layout.stride(),
            elem_bytes = T::BYTES,
            "allocated embedding table"
        );
        Ok(Self {
            words,
            layout,
            table_size: config.table_size,
            seed: config.seed,
            counters: TableCounters::default(),
            _marker: PhantomData,
        })
    }

    pub fn with_capacity(table_size: usize, dim: usize) -> Result<Self> {
        Self::new(&TableConfig::new(table_size, dim))
    }

    pub fn into_handle(self) -> TableHandle<T> {
        Arc::new(self)
    }

    pub fn table_size(&self) -> usize {
        self.table_size
    }

    pub fn dim(&self) -> usize {
        self.layout.dim()
    }

    pub fn layout(&self) -> &BucketLayout {
        &self.layout
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn counters(&self) -> &TableCounters {
        &self.counters
    }

    pub fn total_count(&self) -> i64 {
        self.counters.total()
    }

    pub fn not_exported_count(&self) -> i64 {
        self.counters.not_exported()
    }

    #[inline(always)]
    pub(crate) fn bucket(&self, slot: usize) -> Bucket<'_, T> {
        let wpb = self.layout.words_per_bucket();
        Bucket {
            words: &self.words[slot * wpb..(slot + 1) * wpb],
            layout: &self.layout,
            slot,
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    fn next_slot(&self, slot: usize) -> usize {
        if slot + 1 == self.table_size { 0 } else { slot + 1 }
    }

    /// Waits until the bucket leaves the `CLAIMED` state.
    fn wait_ready(
        &self,
        bucket: &Bucket<'_, T>,
        mut current: u64,
        key: i64,
        limit: u32,
    ) -> Result<u64> {
        let mut backoff = Backoff::new(limit);
        while BucketState::of(current) == BucketState::Claimed {
            if !backoff.snooze() {
                return Err(TableError::ContentionTimeout {
                    key,
                    slot: bucket.slot,
                    spins: backoff.rounds(),
                });
            }
            current = bucket.flags_cell().load(Ordering::Acquire);
        }
        Ok(current)
    }

    /// Finds the bucket holding `key` or claims the first empty bucket on its
    /// probe sequence.
    ///
    /// On a claim, `fill` runs as the bucket's only writer after the key has
    /// been stored and before `READY` is published; it returns the meta bits
    /// (`FILTERED`, `EXPORTED`, …) the bucket is published with.
    ///
    /// Returns `Ok(None)` when `table_size` buckets were visited without a
    /// free or matching one.
    pub(crate) fn claim_or_find<F>(
        &self,
        key: i64,
        spin_limit: u32,
        fill: F,
    ) -> Result<Option<Probe<'_, T>>>
    where
        F: FnOnce(&Bucket<'_, T>) -> u64,
    {
        let mut slot = home_slot(key, self.seed, self.table_size);
        for _ in 0..self.table_size {
            let bucket = self.bucket(slot);
            let cell = bucket.flags_cell();
            match cell.compare_exchange(
                BucketState::Empty.bits(),
                BucketState::Claimed.bits(),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    bucket.set_key(key);
                    let meta = fill(&bucket);
                    cell.store(BucketState::Ready.bits() | (meta & META_MASK), Ordering::Release);
                    return Ok(Some(Probe::Claimed(bucket)));
                }
                Err(current) => {
                    let current = self.wait_ready(&bucket, current, key, spin_limit)?;
                    if bucket.key() == key {
                        return Ok(Some(Probe::Existing(bucket, Flags(current))));
                    }
                }
            }
            slot = self.next_slot(slot);
        }
        Ok(None)
    }

    /// Read-only probe for `key`.
    ///
    /// An empty bucket ends the search early: claims always take the first
    /// empty bucket of a probe sequence and buckets are never emptied again,
    /// so a resident key always sits before any empty bucket on its path.
    pub(crate) fn find(&self, key: i64, spin_limit: u32) -> Result<Option<Bucket<'_, T>>> {
        let mut slot = home_slot(key, self.seed, self.table_size);
        for _ in 0..self.table_size {
            let bucket = self.bucket(slot);
            let current = bucket.flags_cell().load(Ordering::Acquire);
            match BucketState::of(current) {
                BucketState::Empty => return Ok(None),
                BucketState::Claimed => {
                    self.wait_ready(&bucket, current, key, spin_limit)?;
                }
                BucketState::Ready => {}
            }
            if bucket.key() == key {
                return Ok(Some(bucket));
            }
            slot = self.next_slot(slot);
        }
        Ok(None)
    }

    /// Takes the row lock of a `READY` bucket.
    pub(crate) fn lock_row<'a>(
        &self,
        bucket: Bucket<'a, T>,
        spin_limit: u32,
    ) -> Result<RowGuard<'a, T>> {
        let mut backoff = Backoff::new(spin_limit);
        loop {
            if bucket.transition(|f| !f.locked(), |bits| bits | LOCKED).is_some() {
                return Ok(RowGuard { bucket });
            }
            if !backoff.snooze() {
                return Err(TableError::ContentionTimeout {
                    key: bucket.key(),
                    slot: bucket.slot,
                    spins: backoff.rounds(),
                });
            }
        }
    }

    /// Clears `EVICTED` on a resident bucket. The caller that wins the
    /// transition brings the key back to life, unexported, and accounts for
    /// it in both counters.
    pub(crate) fn recover(&self, bucket: &Bucket<'_, T>) -> bool {
        let won = bucket
            .transition(|f| f.evicted(), |bits| bits & !(EVICTED | EXPORTED))
            .is_some();
        if won {
            self.counters.add_total(1);
            self.counters.add_not_exported(1);
        }
        won
    }

    /// Marks `key` as logically removed. The slot and key stay in place so a
    /// later lookup of the same key recovers the original row.
    ///
    /// Returns `Ok(false)` if the key is absent or already evicted.
    pub fn evict(&self, key: i64) -> Result<bool> {
        let Some(bucket) = self.find(key, DEFAULT_SPIN_LIMIT)? else {
            return Ok(false);
        };
        match bucket.transition(|f| !f.evicted(), |bits| bits | EVICTED) {
            Some(before) => {
                self.counters.add_total(-1);
                if !before.exported() {
                    self.counters.add_not_exported(-1);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Snapshot of the bucket holding `key`.
    pub fn get(&self, key: i64) -> Result<Option<Entry<T>>> {
        Ok(self.find(key, DEFAULT_SPIN_LIMIT)?.map(|b| b.entry()))
    }

    /// Iterates over every `READY` bucket in slot order, evicted ones
    /// included.
    pub fn entries(&self) -> impl Iterator<Item = Entry<T>> + '_ {
        (0..self.table_size)
            .map(|slot| self.bucket(slot))
            .filter(|b| b.flags().is_valid())
            .map(|b| b.entry())
    }

    /// Number of occupied buckets, evicted ones included.
    pub fn len(&self) -> usize {
        (0..self.table_size)
            .filter(|&slot| self.bucket(slot).flags().is_valid())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn load_factor(&self) -> f64 {
        self.len() as f64 / self.table_size as f64
    }

    /// Collects up to `limit` live buckets that have not been exported yet
    /// and marks them `EXPORTED`, decrementing `not_exported_count` once per
    /// bucket taken.
    pub fn export_pending(&self, limit: usize) -> Vec<Entry<T>> {
        let mut out = Vec::new();
        for slot in 0..self.table_size {
            if out.len() >= limit {
                break;
            }
            let bucket = self.bucket(slot);
            if bucket
                .transition(|f| f.pending_export(), |bits| bits | EXPORTED)
                .is_some()
            {
                self.counters.add_not_exported(-1);
                out.push(bucket.entry());
            }
        }
        debug!(exported = out.len(), "exported pending buckets");
        out
    }
}

impl<T: Element> fmt::Debug for EmbeddingTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingTable")
            .field("table_size", &self.table_size)
            .field("dim", &self.layout.dim())
            .field("stride", &self.layout.stride())
            .field("total", &self.counters.total())
            .field("not_exported", &self.counters.not_exported())
            .finish()
    }
}
