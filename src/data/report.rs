//! Per-unit enrichment reports and their on-disk form.

use crate::accumulate::ActivationMetric;
use crate::enrich::GroupingPolicy;
use crate::error::{EnrichError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One significant category for one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    /// Category label.
    pub category: String,
    /// One-sided exact test p-value.
    pub p_raw: f64,
    /// BH-adjusted p-value within the grouping.
    pub p_adj: f64,
    /// Odds ratio, rounded to 2 decimals.
    pub odds_ratio: f64,
    /// Selected entities in the category (`a`).
    pub n_top: usize,
    /// Entities in the category overall.
    pub n_total: usize,
    /// `n_top` over the size of the selection, rounded to 4 decimals.
    pub frac_top: f64,
}

/// One of the highest-activating entities of a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopEntity {
    pub entity: usize,
    /// Label per grouping column; unlabelled columns are omitted.
    pub labels: BTreeMap<String, String>,
    /// Activation rounded to 4 decimals.
    pub activation: f64,
}

/// Results for one tested feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureReport {
    /// Entities with a positive value for the selection metric.
    pub n_active_entities: usize,
    /// Size of the top selection after tie inclusion.
    pub n_selected: usize,
    /// Significant categories per grouping column, ascending by `p_adj`.
    pub enrichments: BTreeMap<String, Vec<Enrichment>>,
    /// Highest-activating entities, independent of the selection.
    pub top_entities: Vec<TopEntity>,
}

impl FeatureReport {
    /// Whether any grouping produced a significant category.
    pub fn has_enrichment(&self) -> bool {
        self.enrichments.values().any(|e| !e.is_empty())
    }
}

/// Report for one processing unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit: u32,
    pub n_entities: usize,
    /// Encoder feature count.
    pub n_features: usize,
    /// Features that passed the minimum-active filter.
    pub n_features_tested: usize,
    pub top_frac: f64,
    pub min_active_entities: usize,
    pub alpha: f64,
    pub metric: ActivationMetric,
    /// Grouping policies the unit was tested with.
    pub groupings: Vec<GroupingPolicy>,
    /// Population table per grouping column.
    pub category_counts: BTreeMap<String, BTreeMap<String, usize>>,
    /// Positions consumed from the stream.
    pub n_positions: u64,
    /// Mean number of active features per position.
    pub mean_active_per_position: f64,
    /// Features with at least one significant category, per grouping column.
    pub n_with_enrichment: BTreeMap<String, usize>,
    /// Tested features keyed by feature index.
    pub features: BTreeMap<usize, FeatureReport>,
}

impl UnitReport {
    /// Reject reports carrying NaN or infinite values.
    pub fn validate(&self) -> Result<()> {
        check_finite("top_frac", None, self.top_frac)?;
        check_finite("alpha", None, self.alpha)?;
        check_finite("mean_active_per_position", None, self.mean_active_per_position)?;

        for (&feature, report) in &self.features {
            for enrichments in report.enrichments.values() {
                for e in enrichments {
                    check_finite("p_raw", Some(feature), e.p_raw)?;
                    check_finite("p_adj", Some(feature), e.p_adj)?;
                    check_finite("odds_ratio", Some(feature), e.odds_ratio)?;
                    check_finite("frac_top", Some(feature), e.frac_top)?;
                }
            }
            for top in &report.top_entities {
                check_finite("activation", Some(feature), top.activation)?;
            }
        }
        Ok(())
    }

    /// Validate and write as JSON, replacing any existing file whole.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        write_json_atomic(path, self)
    }

    /// Read a report written by [`UnitReport::write_json`].
    pub fn read_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_json(path)
    }

    /// Feature indices in descending order of significant categories.
    pub fn most_enriched(&self, limit: usize) -> Vec<(usize, usize)> {
        let mut ranked: Vec<(usize, usize)> = self
            .features
            .iter()
            .map(|(&f, r)| (f, r.enrichments.values().map(Vec::len).sum()))
            .filter(|&(_, n)| n > 0)
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }
}

fn check_finite(field: &str, feature: Option<usize>, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(EnrichError::NonFinite {
            field: field.to_string(),
            feature,
        })
    }
}

/// Round to a fixed number of decimals.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Serialize `value` as JSON to `<path>.tmp`, sync, then rename over `path`.
///
/// Readers see either the previous file or the new one, never a partial write.
pub fn write_json_atomic<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);

    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)?;
    let mut writer = BufWriter::with_capacity(64 * 1024, file);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    writer.get_mut().sync_all()?;
    drop(writer);

    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "wrote artifact");
    Ok(())
}

/// Read a JSON artifact.
pub fn read_json<P: AsRef<Path>, T: DeserializeOwned>(path: P) -> Result<T> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
