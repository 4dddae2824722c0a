//! 2×2 contingency tables: top-vs-rest × category-vs-rest.

use serde::{Deserialize, Serialize};

/// Floor on the odds-ratio denominator.
pub const ODDS_RATIO_EPSILON: f64 = 1e-10;

/// Counts for one (feature, category) pair.
///
/// ```text
///              category   rest
/// selected        a         b
/// not selected    c         d
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContingencyTable {
    pub a: u64,
    pub b: u64,
    pub c: u64,
    pub d: u64,
}

impl ContingencyTable {
    /// Build from a selection mask and a category membership mask.
    pub fn from_masks(selected: &[bool], in_category: &[bool]) -> Self {
        let mut table = Self { a: 0, b: 0, c: 0, d: 0 };
        for (&s, &m) in selected.iter().zip(in_category) {
            match (s, m) {
                (true, true) => table.a += 1,
                (true, false) => table.b += 1,
                (false, true) => table.c += 1,
                (false, false) => table.d += 1,
            }
        }
        table
    }

    /// Build from marginal counts.
    ///
    /// `overlap` selected entities are in the category, out of `n_selected`
    /// selected, `n_category` in the category and `n_entities` overall.
    pub fn from_counts(overlap: usize, n_selected: usize, n_category: usize, n_entities: usize) -> Self {
        let a = overlap as u64;
        let b = (n_selected - overlap) as u64;
        let c = (n_category - overlap) as u64;
        let d = n_entities as u64 - a - b - c;
        Self { a, b, c, d }
    }

    /// Total entities in the table.
    pub fn total(&self) -> u64 {
        self.a + self.b + self.c + self.d
    }

    /// Sample odds ratio `(a·d) / max(b·c, ε)`.
    pub fn odds_ratio(&self) -> f64 {
        let num = self.a as f64 * self.d as f64;
        let den = self.b as f64 * self.c as f64;
        num / den.max(ODDS_RATIO_EPSILON)
    }
}
