//! Per-call configuration handed to the engines.
//!
//! These structs play the role of the launch/tiling block an operator
//! receives alongside its tensors: table geometry, how many workers to run
//! and the operator scalars. All of them deserialize with serde so a host
//! can keep them in JSON or TOML next to the model definition.
use serde::Deserialize;

use crate::backoff::DEFAULT_SPIN_LIMIT;
use crate::error::{Result, TableError};
use crate::layout::BucketLayout;

/// Geometry of one embedding table.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub table_size: usize,
    pub dim: usize,
    /// Precomputed bucket stride; derived from `dim` when absent.
    pub bucket_size_byte: Option<usize>,
    pub seed: u32,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            table_size: 1 << 16,
            dim: 16,
            bucket_size_byte: None,
            seed: 0,
        }
    }
}

impl TableConfig {
    pub fn new(table_size: usize, dim: usize) -> Self {
        Self {
            table_size,
            dim,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.table_size == 0 {
            return Err(TableError::InvalidConfig("table_size must be positive".into()));
        }
        if self.dim == 0 {
            return Err(TableError::InvalidConfig("dim must be positive".into()));
        }
        Ok(())
    }

    pub(crate) fn layout(&self, elem_bytes: usize) -> Result<BucketLayout> {
        self.validate()?;
        match self.bucket_size_byte {
            Some(bytes) => BucketLayout::with_bucket_size(self.dim, elem_bytes, bytes),
            None => Ok(BucketLayout::new(self.dim, elem_bytes)),
        }
    }
}

/// What an engine does with a key it cannot place or find.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissPolicy {
    /// Fail the call with `TableFull` / `KeyNotFound` for the first such key.
    #[default]
    Strict,
    /// Leave that key's output untouched and count it in the call stats.
    Silent,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Number of workers in the grid.
    pub threads: usize,
    /// Wait rounds allowed on a claimed bucket before giving up. Must be
    /// positive.
    pub spin_limit: u32,
    pub miss_policy: MissPolicy,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            spin_limit: DEFAULT_SPIN_LIMIT,
            miss_policy: MissPolicy::Strict,
        }
    }
}

impl LaunchConfig {
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }

    pub fn silent(mut self) -> Self {
        self.miss_policy = MissPolicy::Silent;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(TableError::InvalidConfig("threads must be positive".into()));
        }
        if self.spin_limit == 0 {
            return Err(TableError::InvalidConfig("spin_limit must be positive".into()));
        }
        Ok(())
    }
}

/// Which bias-correction term divides the second moment.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasCorrection {
    /// `sqrt(v / (1 - beta2_power))`, the reference AdamW denominator.
    #[default]
    Standard,
    /// `sqrt(v / (beta2_power - 1))` exactly as the device kernel computes
    /// it. The radicand is negative for positive `v`, so the update is NaN.
    Literal,
}

/// Scalars of the decoupled-weight-decay Adam step.
///
/// The default [`BiasCorrection::Standard`] differs from the device kernel's
/// arithmetic; select [`BiasCorrection::Literal`] to reproduce it exactly.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdamWParams {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
    pub maximize: bool,
    pub amsgrad: bool,
    /// Keys equal to this sentinel are skipped without a lookup.
    pub ignore_key: Option<i64>,
    pub bias_correction: BiasCorrection,
}

impl Default for AdamWParams {
    fn default() -> Self {
        Self {
            lr: 1.0e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1.0e-8,
            weight_decay: 1.0e-2,
            maximize: false,
            amsgrad: false,
            ignore_key: None,
            bias_correction: BiasCorrection::Standard,
        }
    }
}

impl AdamWParams {
    pub fn validate(&self) -> Result<()> {
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(TableError::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {beta}"
                )));
            }
        }
        if !self.lr.is_finite() || !self.eps.is_finite() || !self.weight_decay.is_finite() {
            return Err(TableError::InvalidConfig(
                "lr, eps and weight_decay must be finite".into(),
            ));
        }
        Ok(())
    }
}
