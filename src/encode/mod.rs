//! Sparse feature encoders.
//!
//! An encoder maps a centered hidden-state vector to a sparse activation
//! vector over its learned features. The enrichment engine only relies on
//! the [`SparseEncoder`] interface; [`TopKSae`] is the concrete top-k
//! sparse autoencoder used by the CLI.

mod topk;

pub use topk::TopKSae;

use crate::error::{EnrichError, Result};
use nalgebra::DMatrix;
use rayon::prelude::*;
use sprs::CsVec;

/// Interface of a sparse feature encoder.
pub trait SparseEncoder: Send + Sync {
    /// Input dimensionality.
    fn d_in(&self) -> usize;

    /// Number of output features.
    fn n_features(&self) -> usize;

    /// Maximum number of active features per input.
    fn k(&self) -> usize;

    /// Centering vector subtracted from every raw input before encoding.
    fn centering(&self) -> &[f32];

    /// Encode one centered input.
    fn encode(&self, centered: &[f32]) -> Result<CsVec<f32>>;

    /// Center and encode every row of a `(n_rows, d_in)` block.
    fn encode_block(&self, block: &DMatrix<f32>) -> Result<Vec<CsVec<f32>>> {
        if block.ncols() != self.d_in() {
            return Err(EnrichError::DimensionMismatch {
                expected: self.d_in(),
                actual: block.ncols(),
            });
        }
        let mean = self.centering();
        (0..block.nrows())
            .into_par_iter()
            .map(|r| {
                let centered: Vec<f32> = block
                    .row(r)
                    .iter()
                    .zip(mean)
                    .map(|(x, m)| x - m)
                    .collect();
                self.encode(&centered)
            })
            .collect()
    }
}
