//! Streaming Enrichment of Sparse Autoencoder Features
//!
//! This library attributes the learned features of a sparse autoencoder to
//! categorical labels of biological entities (cell type, tissue, ...). A
//! position-level activation stream that does not fit in memory is reduced
//! to per-entity summaries, and every sufficiently active feature is tested
//! for over-representation of each label among its top-activating entities.
//!
//! # Overview
//!
//! - **data**: Entity metadata, categorical groupings, chunked stream readers, reports
//! - **encode**: Sparse encoder interface and the top-k SAE
//! - **accumulate**: Streaming per-entity accumulation and summary matrices
//! - **enrich**: Top-quantile selection, contingency tables, per-feature enrichment
//! - **test**: One-sided Fisher's exact test
//! - **correct**: Multiple testing correction (Benjamini-Hochberg)
//! - **pipeline**: YAML configuration, checkpoints, checkpointed runner
//!
//! # Example
//!
//! ```no_run
//! use sae_enrich::prelude::*;
//!
//! let config = RunConfig::load("enrichment.yaml").unwrap();
//! let runner = CheckpointedRunner::from_config(config).unwrap();
//!
//! match runner.run(&[]).unwrap() {
//!     RunOutcome::Completed { written, .. } => println!("{} reports written", written.len()),
//!     RunOutcome::Interrupted { unit, .. } => println!("stopped in unit {}", unit),
//! }
//! ```

pub mod accumulate;
pub mod correct;
pub mod data;
pub mod encode;
pub mod enrich;
pub mod error;
pub mod pipeline;
pub mod test;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::accumulate::{ActivationMetric, EntitySummary, StreamingAccumulator};
    pub use crate::correct::{correct_bh, BhCorrected};
    pub use crate::data::{
        ActivationSource, Enrichment, EntityIndex, EntityTable, FeatureReport, Grouping,
        InMemorySource, RawF32Source, TopEntity, UnitReport,
    };
    pub use crate::encode::{SparseEncoder, TopKSae};
    pub use crate::enrich::{
        build_groupings, enrich_feature, enrich_grouping, run_enrichment, select_top,
        ContingencyTable, EnrichmentConfig, GroupingPolicy, TopSelection,
    };
    pub use crate::error::{EnrichError, Result};
    pub use crate::pipeline::{
        Checkpoint, CheckpointedRunner, RunConfig, RunOutcome, StreamConfig, UnitInputs,
        UnitSpec, UnitState,
    };
    pub use crate::test::{test_fisher, FisherResult};
}
