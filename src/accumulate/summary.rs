//! Per-entity feature summaries derived from a finished accumulator.

use super::StreamingAccumulator;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Which per-entity summary drives top-quantile selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMetric {
    /// Mean activation over the positions where the feature fired.
    #[default]
    MeanActive,
    /// Fraction of the entity's positions where the feature fired.
    FracActive,
}

/// Dense `(n_entities, n_features)` summary matrices.
///
/// `mean_active[e, f] = sum[e, f] / count[e, f]` when `count > 0`, else 0.
/// `frac_active[e, f] = count[e, f] / positions[e]` when `positions > 0`, else 0.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySummary {
    mean_active: DMatrix<f64>,
    frac_active: DMatrix<f64>,
}

impl EntitySummary {
    /// Build both matrices with safe division.
    pub fn from_accumulator(acc: &StreamingAccumulator) -> Self {
        let sum = acc.sum();
        let count = acc.count();
        let positions = acc.positions();

        let mean_active = DMatrix::from_fn(acc.n_entities(), acc.n_features(), |e, f| {
            match count[(e, f)] {
                0 => 0.0,
                c => sum[(e, f)] / c as f64,
            }
        });
        let frac_active = DMatrix::from_fn(acc.n_entities(), acc.n_features(), |e, f| {
            match positions[e] {
                0 => 0.0,
                n => count[(e, f)] as f64 / n as f64,
            }
        });

        Self {
            mean_active,
            frac_active,
        }
    }

    /// Number of entities.
    pub fn n_entities(&self) -> usize {
        self.mean_active.nrows()
    }

    /// Number of features.
    pub fn n_features(&self) -> usize {
        self.mean_active.ncols()
    }

    /// Mean-value-when-active matrix.
    pub fn mean_active(&self) -> &DMatrix<f64> {
        &self.mean_active
    }

    /// Fraction-of-positions-active matrix.
    pub fn frac_active(&self) -> &DMatrix<f64> {
        &self.frac_active
    }

    /// Matrix for a selection metric.
    pub fn matrix(&self, metric: ActivationMetric) -> &DMatrix<f64> {
        match metric {
            ActivationMetric::MeanActive => &self.mean_active,
            ActivationMetric::FracActive => &self.frac_active,
        }
    }

    /// One feature's per-entity values.
    pub fn column(&self, metric: ActivationMetric, feature: usize) -> Vec<f64> {
        self.matrix(metric).column(feature).iter().copied().collect()
    }
}
