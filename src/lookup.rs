//! Lookup-or-insert engine.
//!
//! For every key of the batch, a worker resolves the key's bucket (claiming
//! an empty one on first sight), bumps the bucket's counter and copies the
//! row into the caller's output. Existing rows are never overwritten here;
//! only a freshly claimed bucket gets its row initialized.
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{LaunchConfig, MissPolicy};
use crate::element::Element;
use crate::error::{Result, TableError, check_len};
use crate::hash::murmur3_32;
use crate::launch::{CallStats, Grid, SendPtr};
use crate::table::{Bucket, EmbeddingTable, Probe};

/// How the row of a freshly inserted key is filled.
#[derive(Clone, Copy, Debug)]
pub enum Init<'a, T> {
    /// Leave the row zeroed. Buckets are never reused, so a claimed row is
    /// still all zero bits.
    Zeros,
    Constant(f32),
    /// Row-major initial values aligned with the batch keys.
    Values(&'a [T]),
    /// Uniform in `[low, high)`, derived from the key so every worker
    /// produces the same row for the same key.
    Uniform { low: f32, high: f32, seed: u32 },
}

impl<T: Element> Init<'_, T> {
    fn fill(&self, bucket: &Bucket<'_, T>, key: i64, index: usize, dim: usize) {
        match *self {
            Init::Zeros => {}
            Init::Constant(c) => {
                let c = T::from_f32(c);
                for i in 0..dim {
                    bucket.set_value(i, c);
                }
            }
            Init::Values(rows) => bucket.write_row(&rows[index * dim..(index + 1) * dim]),
            Init::Uniform { low, high, seed } => {
                let key_seed = murmur3_32(key, seed);
                for i in 0..dim {
                    // 24 high bits: exactly representable, so u < 1.
                    let u = (murmur3_32(i as i64, key_seed) >> 8) as f32 / (1u32 << 24) as f32;
                    bucket.set_value(i, T::from_f32(low + (high - low) * u));
                }
            }
        }
    }
}

/// Routes one key to another before hashing, e.g. every out-of-vocabulary
/// id to a shared default row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct KeyFilter {
    pub filter_key: i64,
    pub default_key: i64,
}

impl KeyFilter {
    #[inline(always)]
    pub fn apply(&self, key: i64) -> i64 {
        if key == self.filter_key { self.default_key } else { key }
    }
}

pub struct LookupRequest<'a, T> {
    pub keys: &'a [i64],
    pub init: Init<'a, T>,
    pub filter: Option<KeyFilter>,
}

impl<'a, T: Element> LookupRequest<'a, T> {
    pub fn new(keys: &'a [i64]) -> Self {
        Self {
            keys,
            init: Init::Zeros,
            filter: None,
        }
    }

    pub fn with_init(mut self, init: Init<'a, T>) -> Self {
        self.init = init;
        self
    }

    pub fn with_filter(mut self, filter: KeyFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    fn validate(&self, dim: usize) -> Result<()> {
        if let Init::Values(rows) = self.init {
            check_len("init values", self.keys.len() * dim, rows.len())?;
        }
        if let Init::Uniform { low, high, .. } = self.init {
            if !(low <= high) {
                return Err(TableError::InvalidConfig(format!(
                    "uniform init needs low <= high, got [{low}, {high})"
                )));
            }
        }
        Ok(())
    }
}

/// Resolves every key of `request` to its bucket, inserting missing keys,
/// and copies each row into `out` (`keys.len() * dim` elements, row-major).
///
/// A fresh insert bumps both table counters. An existing bucket whose
/// `EVICTED` flag is set is revived; the worker that clears the flag bumps
/// both counters. Keys that find neither a free nor a matching bucket leave
/// their output row untouched and are reported according to the launch's
/// [`MissPolicy`].
pub fn lookup_or_insert<T: Element>(
    table: &EmbeddingTable<T>,
    request: &LookupRequest<'_, T>,
    out: &mut [T],
    launch: &LaunchConfig,
) -> Result<CallStats> {
    launch.validate()?;
    let dim = table.dim();
    let keys = request.keys;
    request.validate(dim)?;
    check_len("lookup output", keys.len() * dim, out.len())?;

    let out_ptr = SendPtr::new(out);
    let grid = Grid::for_batch(launch.threads, keys.len());
    let per_worker = grid.run(|worker| -> Result<CallStats> {
        let mut stats = CallStats::default();
        for index in worker.indices(keys.len()) {
            stats.keys += 1;
            let key = match request.filter {
                Some(filter) => filter.apply(keys[index]),
                None => keys[index],
            };
            let probe = table.claim_or_find(key, launch.spin_limit, |bucket| {
                request.init.fill(bucket, key, index, dim);
                0
            })?;
            let bucket = match probe {
                Some(Probe::Claimed(bucket)) => {
                    table.counters().add_total(1);
                    table.counters().add_not_exported(1);
                    stats.inserted += 1;
                    bucket
                }
                Some(Probe::Existing(bucket, flags)) => {
                    stats.found += 1;
                    if flags.evicted() && table.recover(&bucket) {
                        stats.recovered += 1;
                    }
                    bucket
                }
                None => {
                    stats.dropped += 1;
                    stats.fail(index);
                    continue;
                }
            };
            bucket.bump_counter();
            // SAFETY: each batch index is visited by exactly one worker.
            bucket.read_row(unsafe { out_ptr.row(index, dim) });
        }
        Ok(stats)
    });
    let stats = CallStats::merge(per_worker.into_iter().collect::<Result<Vec<_>>>()?);

    debug!(
        keys = stats.keys,
        inserted = stats.inserted,
        found = stats.found,
        recovered = stats.recovered,
        dropped = stats.dropped,
        "lookup_or_insert"
    );
    if let Some(index) = stats.first_failure {
        match launch.miss_policy {
            MissPolicy::Strict => {
                return Err(TableError::TableFull {
                    key: keys[index],
                    probes: table.table_size(),
                });
            }
            MissPolicy::Silent => {
                warn!(
                    dropped = stats.dropped,
                    table_size = table.table_size(),
                    "table full, keys dropped"
                );
            }
        }
    }
    Ok(stats)
}
