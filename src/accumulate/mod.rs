//! Streaming accumulation of encoded positions into per-entity summaries.

mod accumulator;
mod summary;

pub use accumulator::StreamingAccumulator;
pub use summary::{ActivationMetric, EntitySummary};
