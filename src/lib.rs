//! Concurrent fixed-capacity embedding tables.
//!
//! A table maps `i64` keys to fixed-width rows of `f32`, `f16` or `bf16`
//! values. Three batch operators work on it, each fanned out over a grid of
//! worker threads: [`lookup_or_insert`], [`import`] and [`apply_adamw`].
pub mod adamw;
pub mod backoff;
pub mod config;
pub mod element;
pub mod error;
pub mod hash;
pub mod import;
pub mod launch;
pub mod layout;
pub mod lookup;
pub mod table;

pub use adamw::{BiasPowers, OptimizerState, apply_adamw};
pub use config::{AdamWParams, BiasCorrection, LaunchConfig, MissPolicy, TableConfig};
pub use element::{Element, PackedArray};
pub use error::{Result, TableError};
pub use import::{ImportBatch, import, import_table};
pub use launch::CallStats;
pub use layout::{BucketLayout, BucketState, Flags};
pub use lookup::{Init, KeyFilter, LookupRequest, lookup_or_insert};
pub use table::{EmbeddingTable, Entry, TableCounters, TableHandle};
