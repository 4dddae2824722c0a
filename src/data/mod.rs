//! Entity metadata, activation streams and reports.

mod entity;
mod grouping;
pub mod report;
pub mod stream;

pub use entity::EntityTable;
pub use grouping::Grouping;
pub use report::{Enrichment, FeatureReport, TopEntity, UnitReport};
pub use stream::{write_raw_f32, ActivationSource, EntityIndex, InMemorySource, RawF32Source};
