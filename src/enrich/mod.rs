//! Per-feature enrichment of categorical groupings.
//!
//! For every feature that is active in enough entities, the top fraction of
//! entities by activation is selected and each grouping is tested with the
//! same routine: a one-sided exact test per eligible category, BH
//! correction across the grouping's categories, then filtering to the
//! rejected categories ranked by adjusted p-value.

pub mod contingency;
pub mod select;

pub use contingency::{ContingencyTable, ODDS_RATIO_EPSILON};
pub use select::{count_active, n_top_for, select_top, top_entities, TopSelection};

use crate::accumulate::{ActivationMetric, EntitySummary, StreamingAccumulator};
use crate::correct::{correct_bh, DEFAULT_ALPHA};
use crate::data::{Enrichment, EntityTable, FeatureReport, Grouping, TopEntity, UnitReport};
use crate::data::report::round_to;
use crate::error::{EnrichError, Result};
use crate::test::test_fisher;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

const PROGRESS_EVERY: usize = 500;

/// How one label column is tested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingPolicy {
    /// Label column in the entity metadata.
    pub column: String,
    /// Categories with fewer entities are not tested.
    #[serde(default)]
    pub min_entities: usize,
    /// Keep at most this many significant categories.
    #[serde(default)]
    pub max_results: Option<usize>,
}

impl GroupingPolicy {
    pub fn new(column: &str, min_entities: usize, max_results: Option<usize>) -> Self {
        Self {
            column: column.to_string(),
            min_entities,
            max_results,
        }
    }
}

/// Parameters of the enrichment stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Fraction of entities forming the top group.
    pub top_frac: f64,
    /// Features active in fewer entities are not tested.
    pub min_active_entities: usize,
    /// FDR level for BH.
    pub alpha: f64,
    /// Length of the per-feature top-entity list.
    pub max_top_entities: usize,
    /// Summary that drives selection.
    pub metric: ActivationMetric,
    pub groupings: Vec<GroupingPolicy>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            top_frac: 0.10,
            min_active_entities: 10,
            alpha: DEFAULT_ALPHA,
            max_top_entities: 10,
            metric: ActivationMetric::MeanActive,
            groupings: vec![
                GroupingPolicy::new("cell_type", 3, Some(10)),
                GroupingPolicy::new("tissue", 0, None),
            ],
        }
    }
}

impl EnrichmentConfig {
    /// Check parameter ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.top_frac > 0.0 && self.top_frac <= 1.0) {
            return Err(EnrichError::InvalidParameter(format!(
                "top_frac must be in (0, 1], got {}",
                self.top_frac
            )));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(EnrichError::InvalidParameter(format!(
                "alpha must be in (0, 1), got {}",
                self.alpha
            )));
        }
        if self.groupings.is_empty() {
            return Err(EnrichError::InvalidParameter(
                "at least one grouping is required".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for g in &self.groupings {
            if !seen.insert(g.column.as_str()) {
                return Err(EnrichError::InvalidParameter(format!(
                    "grouping column '{}' listed twice",
                    g.column
                )));
            }
            if g.max_results == Some(0) {
                return Err(EnrichError::InvalidParameter(format!(
                    "max_results for '{}' must be positive",
                    g.column
                )));
            }
        }
        Ok(())
    }
}

/// Encode every configured grouping column of the entity table.
pub fn build_groupings(table: &EntityTable, config: &EnrichmentConfig) -> Result<Vec<Grouping>> {
    config
        .groupings
        .iter()
        .map(|policy| Grouping::from_table(table, &policy.column))
        .collect()
}

/// Test one grouping against one feature's selection.
///
/// Every category with at least `policy.min_entities` members is tested;
/// BH runs over all of them, and only rejected categories are returned,
/// ascending by adjusted p-value and truncated to `policy.max_results`.
pub fn enrich_grouping(
    grouping: &Grouping,
    policy: &GroupingPolicy,
    selection: &TopSelection,
    alpha: f64,
) -> Vec<Enrichment> {
    let eligible = grouping.eligible_levels(policy.min_entities);
    if eligible.is_empty() {
        return Vec::new();
    }
    let overlaps = grouping.selected_per_level(&selection.mask);
    let n_entities = grouping.n_entities();

    let tested: Vec<(usize, ContingencyTable, f64)> = eligible
        .iter()
        .map(|&level| {
            let table = ContingencyTable::from_counts(
                overlaps[level],
                selection.n_selected,
                grouping.population(level),
                n_entities,
            );
            (level, table, test_fisher(&table).p_value)
        })
        .collect();

    let p_values: Vec<f64> = tested.iter().map(|(_, _, p)| *p).collect();
    let corrected = correct_bh(&p_values, alpha);

    let mut results: Vec<Enrichment> = corrected
        .significant_indices()
        .into_iter()
        .map(|i| {
            let (level, table, p_raw) = &tested[i];
            Enrichment {
                category: grouping.levels()[*level].clone(),
                p_raw: *p_raw,
                p_adj: corrected.q_values[i],
                odds_ratio: round_to(table.odds_ratio(), 2),
                n_top: table.a as usize,
                n_total: grouping.population(*level),
                frac_top: round_to(table.a as f64 / selection.n_selected.max(1) as f64, 4),
            }
        })
        .collect();

    // stable: equal p_adj keep level order
    results.sort_by(|a, b| a.p_adj.total_cmp(&b.p_adj));
    if let Some(max) = policy.max_results {
        results.truncate(max);
    }
    results
}

/// Test one feature against every grouping.
///
/// Returns `None` when fewer than `min_active_entities` entities are active.
pub fn enrich_feature(
    values: &[f64],
    groupings: &[Grouping],
    config: &EnrichmentConfig,
) -> Option<FeatureReport> {
    let n_active = count_active(values);
    if n_active < config.min_active_entities {
        return None;
    }

    let n_top = n_top_for(values.len(), config.top_frac);
    let selection = select_top(values, n_top);

    let enrichments = config
        .groupings
        .iter()
        .zip(groupings)
        .map(|(policy, grouping)| {
            (
                policy.column.clone(),
                enrich_grouping(grouping, policy, &selection, config.alpha),
            )
        })
        .collect();

    let top_entities = top_entities(values, config.max_top_entities)
        .into_iter()
        .map(|(entity, value)| TopEntity {
            entity,
            labels: groupings
                .iter()
                .filter_map(|g| {
                    g.code(entity)
                        .map(|c| (g.column().to_string(), g.levels()[c].clone()))
                })
                .collect(),
            activation: round_to(value, 4),
        })
        .collect();

    Some(FeatureReport {
        n_active_entities: n_active,
        n_selected: selection.n_selected,
        enrichments,
        top_entities,
    })
}

/// Summarize a finished accumulator and test every feature.
///
/// `groupings` must line up with `config.groupings`, as produced by
/// [`build_groupings`]. Features are tested in parallel.
pub fn run_enrichment(
    unit: u32,
    acc: &StreamingAccumulator,
    groupings: &[Grouping],
    config: &EnrichmentConfig,
) -> Result<UnitReport> {
    if groupings.len() != config.groupings.len() {
        return Err(EnrichError::DimensionMismatch {
            expected: config.groupings.len(),
            actual: groupings.len(),
        });
    }
    for g in groupings {
        if g.n_entities() != acc.n_entities() {
            return Err(EnrichError::DimensionMismatch {
                expected: acc.n_entities(),
                actual: g.n_entities(),
            });
        }
    }

    let summary = EntitySummary::from_accumulator(acc);
    let tested = AtomicUsize::new(0);

    let features: BTreeMap<usize, FeatureReport> = (0..summary.n_features())
        .into_par_iter()
        .filter_map(|f| {
            let values = summary.column(config.metric, f);
            let report = enrich_feature(&values, groupings, config)?;
            let done = tested.fetch_add(1, Ordering::Relaxed) + 1;
            if done % PROGRESS_EVERY == 0 {
                debug!(unit, tested = done, "enrichment progress");
            }
            Some((f, report))
        })
        .collect();

    let n_with_enrichment: BTreeMap<String, usize> = config
        .groupings
        .iter()
        .map(|policy| {
            let n = features
                .values()
                .filter(|r| r.enrichments.get(&policy.column).is_some_and(|e| !e.is_empty()))
                .count();
            (policy.column.clone(), n)
        })
        .collect();

    info!(
        unit,
        tested = features.len(),
        n_features = summary.n_features(),
        with_enrichment = ?n_with_enrichment,
        "enrichment finished"
    );

    Ok(UnitReport {
        unit,
        n_entities: acc.n_entities(),
        n_features: summary.n_features(),
        n_features_tested: features.len(),
        top_frac: config.top_frac,
        min_active_entities: config.min_active_entities,
        alpha: config.alpha,
        metric: config.metric,
        groupings: config.groupings.clone(),
        category_counts: groupings
            .iter()
            .map(|g| (g.column().to_string(), g.population_table()))
            .collect(),
        n_positions: acc.total_positions(),
        mean_active_per_position: acc.mean_active_per_position(),
        n_with_enrichment,
        features,
    })
}
