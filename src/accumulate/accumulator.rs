//! Streaming per-entity accumulation of sparse feature activations.

use crate::error::{EnrichError, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use sprs::CsVec;

/// Running per-entity / per-feature totals over a position stream.
///
/// Footprint is `O(n_entities × n_features)` regardless of stream length.
/// Accumulation is purely additive, so the final state does not depend on
/// how the stream was split into chunks, and partial accumulators over
/// disjoint parts of a stream can be combined with [`merge`](Self::merge).
///
/// Invariant: `count[(e, f)] <= positions[e]` for every entity and feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingAccumulator {
    /// Sum of activation values while firing, `(n_entities, n_features)`.
    sum: DMatrix<f64>,
    /// Number of positions where the feature fired, `(n_entities, n_features)`.
    count: DMatrix<u32>,
    /// Number of positions seen per entity.
    positions: DVector<u64>,
}

impl StreamingAccumulator {
    /// Create an empty accumulator.
    pub fn new(n_entities: usize, n_features: usize) -> Self {
        Self {
            sum: DMatrix::zeros(n_entities, n_features),
            count: DMatrix::zeros(n_entities, n_features),
            positions: DVector::zeros(n_entities),
        }
    }

    /// Number of entities.
    #[inline]
    pub fn n_entities(&self) -> usize {
        self.sum.nrows()
    }

    /// Number of features.
    #[inline]
    pub fn n_features(&self) -> usize {
        self.sum.ncols()
    }

    /// Add one chunk of encoded positions.
    ///
    /// `activations[i]` belongs to entity `entity_ids[i]`. Every position
    /// bumps its entity's position count; every nonzero feature adds its value
    /// to the running sum and bumps the fire count. The chunk is validated in
    /// full before any state changes.
    pub fn consume(&mut self, activations: &[CsVec<f32>], entity_ids: &[u32]) -> Result<()> {
        if activations.len() != entity_ids.len() {
            return Err(EnrichError::DimensionMismatch {
                expected: activations.len(),
                actual: entity_ids.len(),
            });
        }
        for (position, (h, &id)) in activations.iter().zip(entity_ids).enumerate() {
            if id as usize >= self.n_entities() {
                return Err(EnrichError::EntityOutOfRange {
                    id: id as u64,
                    position,
                    n_entities: self.n_entities(),
                });
            }
            if h.dim() != self.n_features() {
                return Err(EnrichError::DimensionMismatch {
                    expected: self.n_features(),
                    actual: h.dim(),
                });
            }
        }

        for (h, &id) in activations.iter().zip(entity_ids) {
            let e = id as usize;
            self.positions[e] += 1;
            for (f, &v) in h.iter() {
                if v != 0.0 {
                    self.sum[(e, f)] += v as f64;
                    self.count[(e, f)] += 1;
                }
            }
        }
        Ok(())
    }

    /// Fold another accumulator over the same entities and features into this one.
    pub fn merge(&mut self, other: &StreamingAccumulator) -> Result<()> {
        if self.sum.shape() != other.sum.shape() {
            return Err(EnrichError::DimensionMismatch {
                expected: self.n_entities() * self.n_features(),
                actual: other.n_entities() * other.n_features(),
            });
        }
        self.sum += &other.sum;
        self.count += &other.count;
        self.positions += &other.positions;
        Ok(())
    }

    /// Running activation sums.
    pub fn sum(&self) -> &DMatrix<f64> {
        &self.sum
    }

    /// Fire counts.
    pub fn count(&self) -> &DMatrix<u32> {
        &self.count
    }

    /// Positions seen per entity.
    pub fn positions(&self) -> &DVector<u64> {
        &self.positions
    }

    /// Total positions consumed.
    pub fn total_positions(&self) -> u64 {
        self.positions.iter().sum()
    }

    /// Total (position, feature) firings.
    pub fn total_fires(&self) -> u64 {
        self.count.iter().map(|&c| c as u64).sum()
    }

    /// Mean number of active features per entity-position.
    pub fn mean_active_per_position(&self) -> f64 {
        self.total_fires() as f64 / self.total_positions().max(1) as f64
    }
}
