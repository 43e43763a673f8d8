//! Bulk import engine.
//!
//! Replays `(key, counter, filter flag, row)` tuples into one or more tables
//! with the same claim/probe protocol as lookup-or-insert. Imported rows
//! come from a snapshot, so every bucket written here is published with the
//! `EXPORTED` bit: a new key only grows `total_count`, and an existing key
//! that was still waiting for export leaves `not_exported_count`.
use tracing::{debug, trace, warn};

use crate::config::{LaunchConfig, MissPolicy};
use crate::element::Element;
use crate::error::{Result, TableError, check_len};
use crate::launch::{CallStats, Grid};
use crate::layout::{EXPORTED, FILTERED, META_MASK};
use crate::table::{EmbeddingTable, Probe};

/// Column-wise tuples destined for one table.
#[derive(Clone, Copy, Debug)]
pub struct ImportBatch<'a, T> {
    pub keys: &'a [i64],
    pub counters: &'a [u64],
    pub filter_flags: &'a [bool],
    /// Row-major, `keys.len() * dim` elements.
    pub values: &'a [T],
}

impl<T: Element> ImportBatch<'_, T> {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn validate(&self, dim: usize) -> Result<()> {
        let n = self.keys.len();
        check_len("import counters", n, self.counters.len())?;
        check_len("import filter flags", n, self.filter_flags.len())?;
        check_len("import values", n * dim, self.values.len())
    }
}

/// Imports `batches[t]` into `tables[t]`, table after table.
///
/// Under [`MissPolicy::Strict`] the first table with a dropped key stops the
/// call; earlier tables keep their imported rows.
pub fn import<T: Element>(
    tables: &[&EmbeddingTable<T>],
    batches: &[ImportBatch<'_, T>],
    launch: &LaunchConfig,
) -> Result<Vec<CallStats>> {
    if tables.len() != batches.len() {
        return Err(TableError::BatchCountMismatch {
            tables: tables.len(),
            batches: batches.len(),
        });
    }
    let mut all = Vec::with_capacity(tables.len());
    for (index, (table, batch)) in tables.iter().zip(batches).enumerate() {
        let stats = import_table(table, batch, launch)?;
        trace!(
            table = index,
            keys = stats.keys,
            inserted = stats.inserted,
            found = stats.found,
            "imported table"
        );
        all.push(stats);
    }
    Ok(all)
}

/// Imports one batch into one table, thread-parallel over the batch.
pub fn import_table<T: Element>(
    table: &EmbeddingTable<T>,
    batch: &ImportBatch<'_, T>,
    launch: &LaunchConfig,
) -> Result<CallStats> {
    launch.validate()?;
    let dim = table.dim();
    batch.validate(dim)?;
    let n = batch.len();

    let grid = Grid::for_batch(launch.threads, n);
    let per_worker = grid.run(|worker| -> Result<CallStats> {
        let mut stats = CallStats::default();
        for index in worker.indices(n) {
            stats.keys += 1;
            let key = batch.keys[index];
            let counter = batch.counters[index];
            let row = &batch.values[index * dim..(index + 1) * dim];
            let meta = EXPORTED | if batch.filter_flags[index] { FILTERED } else { 0 };

            let probe = table.claim_or_find(key, launch.spin_limit, |bucket| {
                bucket.set_counter(counter);
                bucket.write_row(row);
                meta
            })?;
            match probe {
                Some(Probe::Claimed(_)) => {
                    table.counters().add_total(1);
                    stats.inserted += 1;
                }
                Some(Probe::Existing(bucket, _)) => {
                    let guard = table.lock_row(bucket, launch.spin_limit)?;
                    let bucket = guard.bucket();
                    let before = bucket.replace_meta(META_MASK, meta);
                    if before.evicted() {
                        // Eviction already took it out of both counters.
                        table.counters().add_total(1);
                        stats.recovered += 1;
                    } else if !before.exported() {
                        table.counters().add_not_exported(-1);
                    }
                    bucket.set_counter(counter);
                    bucket.write_row(row);
                    stats.found += 1;
                }
                None => {
                    stats.dropped += 1;
                    stats.fail(index);
                }
            }
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
        "import_table"
    );
    if let Some(index) = stats.first_failure {
        match launch.miss_policy {
            MissPolicy::Strict => {
                return Err(TableError::TableFull {
                    key: batch.keys[index],
                    probes: table.table_size(),
                });
            }
            MissPolicy::Silent => {
                warn!(
                    dropped = stats.dropped,
                    table_size = table.table_size(),
                    "table full, imported keys dropped"
                );
            }
        }
    }
    Ok(stats)
}
