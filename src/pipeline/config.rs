//! Run configuration, stored as YAML.

use crate::enrich::{EnrichmentConfig, GroupingPolicy};
use crate::error::{EnrichError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Inputs of one processing unit (one model layer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    /// Unit identifier, used in output names.
    pub id: u32,
    /// Raw little-endian `f32` position rows.
    pub activations: PathBuf,
    /// Raw little-endian `u32` entity id per position.
    pub entity_ids: PathBuf,
    /// Encoder artifact (JSON).
    pub encoder: PathBuf,
}

/// How the position stream is read and how often progress is saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Positions per read.
    pub chunk_size: usize,
    /// Entities per checkpoint batch.
    pub checkpoint_every: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            checkpoint_every: 200,
        }
    }
}

/// Full configuration of an enrichment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Name of the run.
    pub name: String,
    /// Entity metadata: `.json` extraction metadata or TSV.
    pub metadata: PathBuf,
    /// Directory receiving one report per unit.
    pub output_dir: PathBuf,
    /// Checkpoint file; defaults to `<output_dir>/enrichment_checkpoint.json`.
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    pub units: Vec<UnitSpec>,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

impl RunConfig {
    /// Load from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(EnrichError::from)
    }

    /// Save to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(EnrichError::from)
    }

    /// Read and validate a YAML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as a YAML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// A complete config with the usual layout of an extraction directory.
    pub fn example() -> Self {
        let units = [0u32, 5, 11, 17]
            .iter()
            .map(|&id| UnitSpec {
                id,
                activations: PathBuf::from(format!("extraction/layer{:02}_activations.f32", id)),
                entity_ids: PathBuf::from(format!("extraction/layer{:02}_cell_ids.u32", id)),
                encoder: PathBuf::from(format!("sae/layer{:02}_sae.json", id)),
            })
            .collect();
        Self {
            name: "celltype-enrichment".to_string(),
            metadata: PathBuf::from("extraction/cell_metadata.json"),
            output_dir: PathBuf::from("enrichment"),
            checkpoint: None,
            units,
            enrichment: EnrichmentConfig {
                groupings: vec![
                    GroupingPolicy::new("cell_type", 3, Some(10)),
                    GroupingPolicy::new("tissue", 0, None),
                ],
                ..EnrichmentConfig::default()
            },
            stream: StreamConfig::default(),
        }
    }

    /// Check the whole config before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.units.is_empty() {
            return Err(EnrichError::InvalidParameter(
                "no processing units configured".to_string(),
            ));
        }
        let mut ids = BTreeSet::new();
        for unit in &self.units {
            if !ids.insert(unit.id) {
                return Err(EnrichError::InvalidParameter(format!(
                    "unit {} listed twice",
                    unit.id
                )));
            }
        }
        if self.stream.chunk_size == 0 {
            return Err(EnrichError::InvalidParameter(
                "stream.chunk_size must be positive".to_string(),
            ));
        }
        if self.stream.checkpoint_every == 0 {
            return Err(EnrichError::InvalidParameter(
                "stream.checkpoint_every must be positive".to_string(),
            ));
        }
        self.enrichment.validate()
    }

    /// Report path of a unit.
    pub fn output_path(&self, unit: u32) -> PathBuf {
        self.output_dir.join(format!("enrichment_layer{:02}.json", unit))
    }

    /// Checkpoint path, explicit or defaulted.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint
            .clone()
            .unwrap_or_else(|| self.output_dir.join("enrichment_checkpoint.json"))
    }

    /// Look up a unit by id.
    pub fn unit(&self, id: u32) -> Option<&UnitSpec> {
        self.units.iter().find(|u| u.id == id)
    }

    /// Units to process, in config order; all of them when `ids` is empty.
    pub fn select_units(&self, ids: &[u32]) -> Result<Vec<&UnitSpec>> {
        if ids.is_empty() {
            return Ok(self.units.iter().collect());
        }
        for &id in ids {
            if self.unit(id).is_none() {
                return Err(EnrichError::InvalidParameter(format!(
                    "unit {} is not in the config",
                    id
                )));
            }
        }
        Ok(self.units.iter().filter(|u| ids.contains(&u.id)).collect())
    }
}
