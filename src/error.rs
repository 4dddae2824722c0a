//! Error types for the sae-enrich library.

use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Missing column '{0}' in entity metadata")]
    MissingColumn(String),

    #[error("Invalid entity id '{value}' at row {row}: {reason}")]
    InvalidEntityId {
        value: String,
        row: usize,
        reason: String,
    },

    #[error("Entity id {id} at position {position} is out of range (n_entities = {n_entities})")]
    EntityOutOfRange {
        id: u64,
        position: usize,
        n_entities: usize,
    },

    #[error("Activation stream is not grouped by entity: id {id} at position {position} follows id {previous}")]
    StreamNotGrouped {
        id: u32,
        previous: u32,
        position: usize,
    },

    #[error("Encoder artifact error: {0}")]
    Encoder(String),

    #[error("Empty data: {0}")]
    EmptyData(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Non-finite value in report field '{field}' (feature {feature:?})")]
    NonFinite {
        field: String,
        feature: Option<usize>,
    },

    #[error("unit {unit} / {stage}: {source}")]
    Pipeline {
        unit: u32,
        stage: &'static str,
        #[source]
        source: Box<EnrichError>,
    },

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EnrichError {
    /// Tag an error with the processing unit and stage it came from.
    pub fn in_stage(self, unit: u32, stage: &'static str) -> Self {
        EnrichError::Pipeline {
            unit,
            stage,
            source: Box::new(self),
        }
    }
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, EnrichError>;
