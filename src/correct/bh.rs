//! Benjamini-Hochberg false discovery rate correction.

use serde::{Deserialize, Serialize};

/// Default FDR level.
pub const DEFAULT_ALPHA: f64 = 0.05;

/// Result of BH correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BhCorrected {
    /// Original p-values, in input order.
    pub p_values: Vec<f64>,
    /// Adjusted p-values (q-values), in input order.
    pub q_values: Vec<f64>,
    /// Whether each hypothesis is rejected at `alpha`.
    pub reject: Vec<bool>,
    /// FDR level the decisions were made at.
    pub alpha: f64,
    /// Number of tests.
    pub n_tests: usize,
}

impl BhCorrected {
    /// Count rejected hypotheses.
    pub fn n_significant(&self) -> usize {
        self.reject.iter().filter(|&&r| r).count()
    }

    /// Get indices of rejected hypotheses.
    pub fn significant_indices(&self) -> Vec<usize> {
        self.reject
            .iter()
            .enumerate()
            .filter(|(_, &r)| r)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Apply Benjamini-Hochberg FDR correction.
///
/// The BH procedure controls the false discovery rate (FDR) at level α.
/// For each p-value, the adjusted p-value (q-value) is calculated as:
/// q[i] = min(p[i] * n / rank[i], q[i+1])
///
/// A hypothesis is rejected when its q-value is at most `alpha`, which is the
/// same set as the step-up rule on the sorted raw p-values.
pub fn correct_bh(p_values: &[f64], alpha: f64) -> BhCorrected {
    let n = p_values.len();
    if n == 0 {
        return BhCorrected {
            p_values: vec![],
            q_values: vec![],
            reject: vec![],
            alpha,
            n_tests: 0,
        };
    }

    // Create sorted index
    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

    // Calculate adjusted p-values
    let mut q_sorted = vec![0.0; n];
    let n_f64 = n as f64;

    // Start from largest p-value
    q_sorted[n - 1] = p_values[indices[n - 1]].min(1.0);

    // Work backwards
    for i in (0..n - 1).rev() {
        let rank = i + 1;
        let adjusted = p_values[indices[i]] * n_f64 / rank as f64;
        q_sorted[i] = adjusted.min(q_sorted[i + 1]).min(1.0);
    }

    // Restore original order
    let mut q_values = vec![0.0; n];
    for (i, &orig_idx) in indices.iter().enumerate() {
        q_values[orig_idx] = q_sorted[i];
    }
    let reject = q_values.iter().map(|&q| q <= alpha).collect();

    BhCorrected {
        p_values: p_values.to_vec(),
        q_values,
        reject,
        alpha,
        n_tests: n,
    }
}
