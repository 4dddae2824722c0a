//! Configuration, checkpointing and checkpointed execution of enrichment runs.

pub mod checkpoint;
pub mod config;
mod runner;

pub use checkpoint::{AccumulatorSnapshot, Checkpoint};
pub use config::{RunConfig, StreamConfig, UnitSpec};
pub use runner::{open_unit_files, CheckpointedRunner, RunOutcome, UnitInputs, UnitState};
