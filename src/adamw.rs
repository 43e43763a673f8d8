//! AdamW apply engine.
//!
//! Applies one optimizer step to the rows of keys that are already resident
//! in a table. Nothing is inserted here: absent keys are counted as missing
//! (or rejected under [`MissPolicy::Strict`]).
//!
//! ```text
//!  worker 0: beta1_power *= beta1; beta2_power *= beta2   (release)
//!  ─────────────────────── barrier ───────────────────────
//!  all workers: load powers (acquire), then per key
//!      find -> lock row -> update value / m / v / max_grad_norm -> unlock
//! ```
//!
//! Moments are kept per slot, so a key keeps its optimizer state across
//! eviction and recovery.
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::config::{AdamWParams, BiasCorrection, LaunchConfig, MissPolicy};
use crate::element::{Element, PackedArray};
use crate::error::{Result, TableError, check_len};
use crate::launch::{CallStats, Grid};
use crate::table::{Bucket, EmbeddingTable};

/// Running `beta^step` products shared by every row of a table.
#[derive(Debug)]
pub struct BiasPowers {
    beta1: AtomicU32,
    beta2: AtomicU32,
}

impl Default for BiasPowers {
    fn default() -> Self {
        Self::new()
    }
}

impl BiasPowers {
    pub fn new() -> Self {
        Self::from_values(1.0, 1.0)
    }

    pub fn from_values(beta1_power: f32, beta2_power: f32) -> Self {
        Self {
            beta1: AtomicU32::new(beta1_power.to_bits()),
            beta2: AtomicU32::new(beta2_power.to_bits()),
        }
    }

    pub fn beta1_power(&self) -> f32 {
        f32::from_bits(self.beta1.load(Ordering::Acquire))
    }

    pub fn beta2_power(&self) -> f32 {
        f32::from_bits(self.beta2.load(Ordering::Acquire))
    }

    /// Single writer only: called by the grid leader before the barrier.
    fn advance(&self, beta1: f32, beta2: f32) {
        let b1 = f32::from_bits(self.beta1.load(Ordering::Relaxed)) * beta1;
        let b2 = f32::from_bits(self.beta2.load(Ordering::Relaxed)) * beta2;
        self.beta1.store(b1.to_bits(), Ordering::Release);
        self.beta2.store(b2.to_bits(), Ordering::Release);
    }
}

/// First and second moments plus the AMSGrad running maximum, one row per
/// table slot.
pub struct OptimizerState<T> {
    m: PackedArray<T>,
    v: PackedArray<T>,
    max_grad_norm: PackedArray<T>,
    powers: BiasPowers,
    table_size: usize,
    dim: usize,
    /// `dim` padded to whole words so two slots never share a word.
    row_stride: usize,
}

impl<T: Element> OptimizerState<T> {
    pub fn new(table_size: usize, dim: usize) -> Self {
        let row_stride = dim.next_multiple_of(8 / T::BYTES);
        let len = table_size * row_stride;
        Self {
            m: PackedArray::new(len, T::default()),
            v: PackedArray::new(len, T::default()),
            max_grad_norm: PackedArray::new(len, T::default()),
            powers: BiasPowers::new(),
            table_size,
            dim,
            row_stride,
        }
    }

    /// Zeroed state sized for `table`.
    pub fn for_table(table: &EmbeddingTable<T>) -> Self {
        Self::new(table.table_size(), table.dim())
    }

    pub fn powers(&self) -> &BiasPowers {
        &self.powers
    }

    pub fn table_size(&self) -> usize {
        self.table_size
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn m(&self, slot: usize) -> Vec<T> {
        self.row(&self.m, slot)
    }

    pub fn v(&self, slot: usize) -> Vec<T> {
        self.row(&self.v, slot)
    }

    pub fn max_grad_norm(&self, slot: usize) -> Vec<T> {
        self.row(&self.max_grad_norm, slot)
    }

    fn row(&self, array: &PackedArray<T>, slot: usize) -> Vec<T> {
        let base = slot * self.row_stride;
        (0..self.dim).map(|i| array.get(base + i)).collect()
    }

    fn check_table(&self, table: &EmbeddingTable<T>) -> Result<()> {
        check_len("optimizer state slots", table.table_size(), self.table_size)?;
        check_len("optimizer state dim", table.dim(), self.dim)
    }
}

/// Step coefficients resolved once per call.
#[derive(Clone, Copy, Debug)]
struct Step {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    decay: f32,
    maximize: bool,
    amsgrad: bool,
    beta1_power: f32,
    c2: f32,
}

impl Step {
    fn new(params: &AdamWParams, powers: &BiasPowers) -> Self {
        let beta2_power = powers.beta2_power();
        let c2 = match params.bias_correction {
            BiasCorrection::Standard => 1.0 - beta2_power,
            BiasCorrection::Literal => beta2_power - 1.0,
        };
        Self {
            lr: params.lr,
            beta1: params.beta1,
            beta2: params.beta2,
            eps: params.eps,
            decay: 1.0 - params.lr * params.weight_decay,
            maximize: params.maximize,
            amsgrad: params.amsgrad,
            beta1_power: powers.beta1_power(),
            c2,
        }
    }

    /// Caller holds the row lock of `bucket`.
    fn apply<T: Element>(&self, bucket: &Bucket<'_, T>, state: &OptimizerState<T>, grad: &[T]) {
        let base = bucket.slot() * state.row_stride;
        for (i, g) in grad.iter().enumerate() {
            let g = if self.maximize { -g.to_f32() } else { g.to_f32() };
            let at = base + i;

            let value = bucket.value(i).to_f32() * self.decay;
            let m = self.beta1 * state.m.get(at).to_f32() - (self.beta1 - 1.0) * g;
            let v = self.beta2 * state.v.get(at).to_f32() - (self.beta2 - 1.0) * g * g;
            let vmax = if self.amsgrad {
                let vmax = state.max_grad_norm.get(at).to_f32().max(v);
                state.max_grad_norm.set(at, T::from_f32(vmax));
                vmax
            } else {
                v
            };
            let denom = (vmax / self.c2).sqrt() + self.eps;
            let value = value + (self.lr * m / (self.beta1_power - 1.0)) / denom;

            bucket.set_value(i, T::from_f32(value));
            state.m.set(at, T::from_f32(m));
            state.v.set(at, T::from_f32(v));
        }
    }
}

/// Runs one AdamW step over `keys`, with `grads` row-major aligned to them.
///
/// Duplicate keys are applied one after another, in no particular order.
pub fn apply_adamw<T: Element>(
    table: &EmbeddingTable<T>,
    state: &OptimizerState<T>,
    keys: &[i64],
    grads: &[T],
    params: &AdamWParams,
    launch: &LaunchConfig,
) -> Result<CallStats> {
    launch.validate()?;
    params.validate()?;
    state.check_table(table)?;
    let dim = table.dim();
    check_len("adamw grads", keys.len() * dim, grads.len())?;

    let grid = Grid::for_batch(launch.threads, keys.len());
    let barrier = grid.barrier();
    let per_worker = grid.run(|worker| -> Result<CallStats> {
        if worker.is_leader() {
            state.powers.advance(params.beta1, params.beta2);
        }
        barrier.wait();
        let step = Step::new(params, &state.powers);

        let mut stats = CallStats::default();
        for index in worker.indices(keys.len()) {
            stats.keys += 1;
            let key = keys[index];
            if params.ignore_key == Some(key) {
                stats.skipped += 1;
                continue;
            }
            let Some(bucket) = table.find(key, launch.spin_limit)? else {
                stats.missing += 1;
                stats.fail(index);
                continue;
            };
            let guard = table.lock_row(bucket, launch.spin_limit)?;
            step.apply(guard.bucket(), state, &grads[index * dim..(index + 1) * dim]);
            stats.found += 1;
        }
        Ok(stats)
    });
    let stats = CallStats::merge(per_worker.into_iter().collect::<Result<Vec<_>>>()?);

    debug!(
        keys = stats.keys,
        updated = stats.found,
        missing = stats.missing,
        skipped = stats.skipped,
        beta1_power = state.powers.beta1_power(),
        "apply_adamw"
    );
    if let Some(index) = stats.first_failure {
        match launch.miss_policy {
            MissPolicy::Strict => return Err(TableError::KeyNotFound { key: keys[index] }),
            MissPolicy::Silent => warn!(missing = stats.missing, "adamw keys not resident"),
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::import::{ImportBatch, import_table};
    use crate::lookup::{Init, LookupRequest, lookup_or_insert};
    use half::{bf16, f16};

    fn launch(threads: usize) -> LaunchConfig {
        LaunchConfig::with_threads(threads)
    }

    fn params() -> AdamWParams {
        AdamWParams {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
            ..AdamWParams::default()
        }
    }

    fn seeded<T: Element>(keys: &[i64], dim: usize, value: f32) -> EmbeddingTable<T> {
        let table = EmbeddingTable::<T>::with_capacity(16, dim).unwrap();
        let values = vec![T::from_f32(value); keys.len() * dim];
        let counters = vec![0; keys.len()];
        let flags = vec![false; keys.len()];
        let batch = ImportBatch {
            keys,
            counters: &counters,
            filter_flags: &flags,
            values: &values,
        };
        import_table(&table, &batch, &launch(1)).unwrap();
        table
    }

    fn slot_of<T: Element>(table: &EmbeddingTable<T>, key: i64) -> usize {
        table.get(key).unwrap().unwrap().slot
    }

    #[test]
    fn single_step_matches_reference_numbers() {
        let table = seeded::<f32>(&[7], 1, 1.0);
        let state = OptimizerState::for_table(&table);
        let stats = apply_adamw(&table, &state, &[7], &[0.5], &params(), &launch(1)).unwrap();
        assert_eq!(stats.found, 1);

        assert!((state.powers().beta1_power() - 0.9).abs() < 1e-7);
        assert!((state.powers().beta2_power() - 0.999).abs() < 1e-7);
        let slot = slot_of(&table, 7);
        assert!((state.m(slot)[0] - 0.05).abs() < 1e-6);
        assert!((state.v(slot)[0] - 0.00025).abs() < 1e-6);
        // 0.99999 - 0.001 * 0.05 / 0.1 / (sqrt(0.00025 / 0.001) + 1e-8)
        let value = table.get(7).unwrap().unwrap().values[0];
        assert!((value - 0.98999).abs() < 1e-6, "value {value}");
    }

    #[test]
    fn literal_bias_correction_keeps_source_arithmetic() {
        let table = seeded::<f32>(&[7], 1, 1.0);
        let state = OptimizerState::for_table(&table);
        let params = AdamWParams {
            bias_correction: BiasCorrection::Literal,
            ..params()
        };
        apply_adamw(&table, &state, &[7], &[0.5], &params, &launch(1)).unwrap();
        // sqrt of v / (beta2_power - 1) is the root of a negative number.
        assert!(table.get(7).unwrap().unwrap().values[0].is_nan());
        let slot = slot_of(&table, 7);
        assert!((state.m(slot)[0] - 0.05).abs() < 1e-6);
    }

    #[test]
    fn maximize_flips_the_update() {
        let down = seeded::<f32>(&[1], 1, 1.0);
        let up = seeded::<f32>(&[1], 1, 1.0);
        let s1 = OptimizerState::for_table(&down);
        let s2 = OptimizerState::for_table(&up);
        let maximize = AdamWParams {
            maximize: true,
            ..params()
        };
        apply_adamw(&down, &s1, &[1], &[0.5], &params(), &launch(1)).unwrap();
        apply_adamw(&up, &s2, &[1], &[0.5], &maximize, &launch(1)).unwrap();
        let d = down.get(1).unwrap().unwrap().values[0];
        let u = up.get(1).unwrap().unwrap().values[0];
        assert!(d < 0.99999 && u > 0.99999, "down {d} up {u}");
        assert!(((0.99999 - d) - (u - 0.99999)).abs() < 1e-6);
    }

    #[test]
    fn amsgrad_keeps_running_maximum() {
        let table = seeded::<f32>(&[3], 1, 0.0);
        let state = OptimizerState::for_table(&table);
        let params = AdamWParams {
            amsgrad: true,
            ..params()
        };
        apply_adamw(&table, &state, &[3], &[1.0], &params, &launch(1)).unwrap();
        let slot = slot_of(&table, 3);
        let first = state.max_grad_norm(slot)[0];
        assert!((first - 0.001).abs() < 1e-7);
        apply_adamw(&table, &state, &[3], &[0.0], &params, &launch(1)).unwrap();
        // v decays, the maximum does not.
        assert!(state.v(slot)[0] < first);
        assert_eq!(state.max_grad_norm(slot)[0], first);
    }

    #[test]
    fn plain_steps_leave_running_maximum_alone() {
        let table = seeded::<f32>(&[3], 1, 0.0);
        let state = OptimizerState::for_table(&table);
        let slot = slot_of(&table, 3);
        for _ in 0..2 {
            apply_adamw(&table, &state, &[3], &[1.0], &params(), &launch(1)).unwrap();
        }
        assert!(state.v(slot)[0] > 0.0);
        assert_eq!(state.max_grad_norm(slot), vec![0.0]);

        // Switching amsgrad on picks up from the stored maximum, not from v.
        let ams = AdamWParams {
            amsgrad: true,
            ..params()
        };
        apply_adamw(&table, &state, &[3], &[1.0], &ams, &launch(1)).unwrap();
        assert_eq!(state.max_grad_norm(slot), state.v(slot));
    }

    #[test]
    fn padded_buckets_survive_every_operator() {
        let config = TableConfig {
            bucket_size_byte: Some(64),
            ..TableConfig::new(8, 3)
        };
        let table = EmbeddingTable::<f32>::new(&config).unwrap();
        assert_eq!(table.layout().stride(), 64);

        let mut out = vec![0.0; 6];
        let req = LookupRequest::new(&[1, 2]).with_init(Init::Constant(1.0));
        lookup_or_insert(&table, &req, &mut out, &launch(2)).unwrap();
        assert_eq!(out, vec![1.0; 6]);

        let batch = ImportBatch {
            keys: &[2, 3],
            counters: &[5, 6],
            filter_flags: &[false, true],
            values: &[2.0, 2.0, 2.0, 3.0, 3.0, 3.0],
        };
        import_table(&table, &batch, &launch(2)).unwrap();
        assert_eq!(table.total_count(), 3);

        let state = OptimizerState::for_table(&table);
        apply_adamw(&table, &state, &[1, 2, 3], &[0.0; 9], &params(), &launch(3)).unwrap();
        let decay = 1.0 - 1e-5;
        for (key, start) in [(1, 1.0f32), (2, 2.0), (3, 3.0)] {
            let e = table.get(key).unwrap().unwrap();
            assert!(e.values.iter().all(|v| (v - start * decay).abs() < 1e-6), "{e:?}");
        }
        assert_eq!(table.get(3).unwrap().unwrap().counter, 6);
        assert!(table.get(3).unwrap().unwrap().flags.filtered());
    }

    #[test]
    fn weight_decay_without_gradient() {
        let table = seeded::<f32>(&[4], 2, 2.0);
        let state = OptimizerState::for_table(&table);
        apply_adamw(&table, &state, &[4], &[0.0, 0.0], &params(), &launch(1)).unwrap();
        for v in table.get(4).unwrap().unwrap().values {
            assert!((v - 2.0 * (1.0 - 1e-5)).abs() < 1e-6);
        }
    }

    #[test]
    fn missing_and_ignored_keys() {
        let table = seeded::<f32>(&[1, 2], 1, 1.0);
        let state = OptimizerState::for_table(&table);
        let err = apply_adamw(&table, &state, &[1, 99], &[0.1, 0.1], &params(), &launch(2))
            .unwrap_err();
        assert_eq!(err, TableError::KeyNotFound { key: 99 });

        let params = AdamWParams {
            ignore_key: Some(2),
            ..params()
        };
        let stats = apply_adamw(
            &table,
            &state,
            &[1, 2, 99],
            &[0.1, 0.1, 0.1],
            &params,
            &launch(2).silent(),
        )
        .unwrap();
        assert_eq!(stats.found, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.missing, 1);
        assert_eq!(table.get(2).unwrap().unwrap().values, vec![1.0]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn evicted_rows_still_train() {
        let table = seeded::<f32>(&[5], 1, 1.0);
        table.evict(5).unwrap();
        let state = OptimizerState::for_table(&table);
        let stats = apply_adamw(&table, &state, &[5], &[0.5], &params(), &launch(1)).unwrap();
        assert_eq!(stats.found, 1);
        let e = table.get(5).unwrap().unwrap();
        assert!(e.flags.evicted());
        assert!(e.values[0] < 1.0);
    }

    #[test]
    fn duplicate_keys_apply_every_step() {
        let n = 64;
        let table = seeded::<f32>(&[11], 1, 0.0);
        let state = OptimizerState::for_table(&table);
        let keys = vec![11i64; n];
        let grads = vec![1.0f32; n];
        let stats = apply_adamw(&table, &state, &keys, &grads, &params(), &launch(8)).unwrap();
        assert_eq!(stats.found, n);
        // m follows m = 0.9 m + 0.1 after n serial updates.
        let expected = 1.0 - 0.9f32.powi(n as i32);
        let slot = slot_of(&table, 11);
        assert!((state.m(slot)[0] - expected).abs() < 1e-4);
        assert!(!table.get(11).unwrap().unwrap().flags.locked());
    }

    #[test]
    fn powers_advance_once_per_call() {
        let table = seeded::<f32>(&[1, 2, 3, 4], 1, 1.0);
        let state = OptimizerState::for_table(&table);
        for _ in 0..3 {
            apply_adamw(&table, &state, &[1, 2, 3, 4], &[0.1; 4], &params(), &launch(4)).unwrap();
        }
        assert!((state.powers().beta1_power() - 0.729).abs() < 1e-6);
        assert!((state.powers().beta2_power() - 0.999f32.powi(3)).abs() < 1e-6);
    }

    #[test]
    fn half_precision_rows() {
        let t16 = seeded::<f16>(&[7, 8, 9], 3, 1.0);
        let s16 = OptimizerState::for_table(&t16);
        let tb = seeded::<bf16>(&[7], 3, 1.0);
        let sb = OptimizerState::for_table(&tb);
        let g16 = vec![f16::from_f32(0.5); 9];
        let gb = vec![bf16::from_f32(0.5); 3];
        apply_adamw(&t16, &s16, &[7, 8, 9], &g16, &params(), &launch(3)).unwrap();
        apply_adamw(&tb, &sb, &[7], &gb, &params(), &launch(1)).unwrap();
        for key in [7, 8, 9] {
            for v in t16.get(key).unwrap().unwrap().values {
                assert!((v.to_f32() - 0.98999).abs() < 1e-3);
            }
        }
        for v in tb.get(7).unwrap().unwrap().values {
            assert!((v.to_f32() - 0.98999).abs() < 1e-2);
        }
        let slot = slot_of(&t16, 8);
        assert!(s16.m(slot).iter().all(|m| (m.to_f32() - 0.05).abs() < 1e-3));
    }

    #[test]
    fn state_must_match_table() {
        let table = seeded::<f32>(&[1], 2, 1.0);
        let state = OptimizerState::<f32>::new(8, 2);
        assert!(matches!(
            apply_adamw(&table, &state, &[1], &[0.0, 0.0], &params(), &launch(1)),
            Err(TableError::ShapeMismatch { .. })
        ));
        let state = OptimizerState::for_table(&table);
        assert!(apply_adamw(&table, &state, &[1], &[0.0], &params(), &launch(1)).is_err());
    }
}
