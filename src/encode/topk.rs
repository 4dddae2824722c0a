//! Top-k sparse autoencoder (encoder half).
//!
//! ```text
//! pre  = W_enc @ x + b_enc
//! h[i] = pre[i]  if i is among the k largest pre-activations and pre[i] > 0
//!        0       otherwise
//! ```

use super::SparseEncoder;
use crate::error::{EnrichError, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use sprs::CsVec;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// On-disk layout of an encoder artifact.
#[derive(Debug, Serialize, Deserialize)]
struct SaeArtifact {
    d_model: usize,
    n_features: usize,
    k: usize,
    /// Row-major `(n_features, d_model)`.
    w_enc: Vec<f32>,
    b_enc: Vec<f32>,
    /// Mean of the training inputs.
    activation_mean: Vec<f32>,
}

/// Encoder weights of a top-k sparse autoencoder plus its centering vector.
#[derive(Debug, Clone)]
pub struct TopKSae {
    /// `(n_features, d_model)`.
    w_enc: DMatrix<f32>,
    b_enc: DVector<f32>,
    activation_mean: Vec<f32>,
    k: usize,
}

impl TopKSae {
    /// Assemble an encoder, checking that all shapes agree.
    pub fn new(
        w_enc: DMatrix<f32>,
        b_enc: DVector<f32>,
        activation_mean: Vec<f32>,
        k: usize,
    ) -> Result<Self> {
        let (n_features, d_model) = w_enc.shape();
        if b_enc.len() != n_features {
            return Err(EnrichError::Encoder(format!(
                "b_enc has {} entries, expected {}",
                b_enc.len(),
                n_features
            )));
        }
        if activation_mean.len() != d_model {
            return Err(EnrichError::Encoder(format!(
                "activation_mean has {} entries, expected {}",
                activation_mean.len(),
                d_model
            )));
        }
        if k == 0 || k > n_features {
            return Err(EnrichError::Encoder(format!(
                "k = {} must be in 1..={}",
                k, n_features
            )));
        }
        Ok(Self {
            w_enc,
            b_enc,
            activation_mean,
            k,
        })
    }

    /// Load an encoder artifact from JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            EnrichError::Encoder(format!("cannot open {}: {}", path.display(), e))
        })?;
        let artifact: SaeArtifact = serde_json::from_reader(BufReader::new(file))?;
        if artifact.w_enc.len() != artifact.n_features * artifact.d_model {
            return Err(EnrichError::Encoder(format!(
                "w_enc has {} entries, expected {} x {}",
                artifact.w_enc.len(),
                artifact.n_features,
                artifact.d_model
            )));
        }
        Self::new(
            DMatrix::from_row_slice(artifact.n_features, artifact.d_model, &artifact.w_enc),
            DVector::from_vec(artifact.b_enc),
            artifact.activation_mean,
            artifact.k,
        )
    }

    /// Write the encoder as a JSON artifact.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let (n_features, d_model) = self.w_enc.shape();
        let w_enc = (0..n_features)
            .flat_map(|r| self.w_enc.row(r).iter().copied().collect::<Vec<_>>())
            .collect();
        let artifact = SaeArtifact {
            d_model,
            n_features,
            k: self.k,
            w_enc,
            b_enc: self.b_enc.iter().copied().collect(),
            activation_mean: self.activation_mean.clone(),
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &artifact)?;
        Ok(())
    }
}

impl SparseEncoder for TopKSae {
    fn d_in(&self) -> usize {
        self.w_enc.ncols()
    }

    fn n_features(&self) -> usize {
        self.w_enc.nrows()
    }

    fn k(&self) -> usize {
        self.k
    }

    fn centering(&self) -> &[f32] {
        &self.activation_mean
    }

    fn encode(&self, centered: &[f32]) -> Result<CsVec<f32>> {
        if centered.len() != self.d_in() {
            return Err(EnrichError::DimensionMismatch {
                expected: self.d_in(),
                actual: centered.len(),
            });
        }
        let x = DVector::from_column_slice(centered);
        let pre = &self.w_enc * x + &self.b_enc;

        let mut active: Vec<(usize, f32)> = pre
            .iter()
            .enumerate()
            .filter(|(_, &v)| v > 0.0)
            .map(|(i, &v)| (i, v))
            .collect();

        // Largest first, lower index wins ties.
        let by_magnitude = |a: &(usize, f32), b: &(usize, f32)| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        };
        if active.len() > self.k {
            active.select_nth_unstable_by(self.k - 1, by_magnitude);
            active.truncate(self.k);
        }
        active.sort_unstable_by_key(|(i, _)| *i);

        let (indices, values): (Vec<usize>, Vec<f32>) = active.into_iter().unzip();
        Ok(CsVec::new(self.n_features(), indices, values))
    }
}
