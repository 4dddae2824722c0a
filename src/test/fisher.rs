//! One-sided Fisher's exact test for over-representation.
//!
//! For a 2×2 table `[[a, b], [c, d]]` the "greater" alternative asks whether
//! the selected group holds more members of the category than chance would
//! give. Under the null, `a` follows a hypergeometric distribution with
//! population `N = a+b+c+d`, `K = a+c` category members and `n = a+b` draws,
//! and the p-value is the upper tail `P(X >= a)`.
//!
//! The tail is summed term by term in log space so p-values far below
//! `1 - f64::EPSILON` keep their precision.

use crate::enrich::ContingencyTable;
use serde::{Deserialize, Serialize};
use statrs::function::factorial::ln_binomial;

/// Result of an exact test on one table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FisherResult {
    /// One-sided p-value.
    pub p_value: f64,
    /// Sample odds ratio with the ε floor applied.
    pub odds_ratio: f64,
}

/// Upper-tail hypergeometric probability `P(X >= a)` for the table.
pub fn fisher_exact_greater(table: &ContingencyTable) -> f64 {
    let ContingencyTable { a, b, c, d } = *table;
    let population = a + b + c + d;
    let successes = a + c;
    let draws = a + b;
    let upper = successes.min(draws);

    if a == 0 {
        return 1.0;
    }

    let ln_total = ln_binomial(population, draws);
    let p: f64 = (a..=upper)
        .map(|i| {
            (ln_binomial(successes, i) + ln_binomial(population - successes, draws - i) - ln_total)
                .exp()
        })
        .sum();
    p.clamp(0.0, 1.0)
}

/// Test one table.
///
/// A table with `a == 0` gets `p = 1.0` without evaluating the tail, since
/// `P(X >= 0)` is always 1.
pub fn test_fisher(table: &ContingencyTable) -> FisherResult {
    let p_value = if table.a == 0 {
        1.0
    } else {
        fisher_exact_greater(table)
    };
    FisherResult {
        p_value,
        odds_ratio: table.odds_ratio(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn table(a: u64, b: u64, c: u64, d: u64) -> ContingencyTable {
        ContingencyTable { a, b, c, d }
    }

    #[test]
    fn test_tea_tasting() {
        // Fisher's lady tasting tea: [[3, 1], [1, 3]] -> one-sided p = 17/70
        let p = fisher_exact_greater(&table(3, 1, 1, 3));
        assert_relative_eq!(p, 17.0 / 70.0, epsilon = 1e-10);
    }

    #[test]
    fn test_perfect_separation() {
        // 8 of 8 category members selected, 12 others unselected:
        // p = 1 / C(20, 8)
        let result = test_fisher(&table(8, 0, 0, 12));
        assert_relative_eq!(result.p_value, 1.0 / 125_970.0, max_relative = 1e-9);
        assert!(result.p_value < 0.05);
        assert!(result.odds_ratio > 1e11);
    }

    #[test]
    fn test_zero_overlap_short_circuit() {
        let result = test_fisher(&table(0, 5, 3, 12));
        assert_eq!(result.p_value, 1.0);
        assert_eq!(result.odds_ratio, 0.0);
    }

    #[test]
    fn test_depleted_table_not_significant() {
        // fewer in the selected group than expected
        let p = fisher_exact_greater(&table(1, 9, 9, 1));
        assert!(p > 0.99);
        assert!(p <= 1.0);
    }

    #[test]
    fn test_tail_is_monotone_in_overlap() {
        // same margins, growing overlap -> shrinking p
        let mut prev = 1.0;
        for a in 1..=5u64 {
            let t = table(a, 5 - a, 5 - a, 5 + a);
            let p = fisher_exact_greater(&t);
            assert!(p <= prev, "a = {}: {} > {}", a, p, prev);
            prev = p;
        }
    }

    #[test]
    fn test_small_table() {
        // N = 6, K = 3, n = 3: P(X >= 2) = (C(3,2)C(3,1) + C(3,3)) / C(6,3) = 10/20
        let p = fisher_exact_greater(&table(2, 1, 1, 2));
        assert_relative_eq!(p, 0.5, epsilon = 1e-10);
    }
}
