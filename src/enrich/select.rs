//! Top-quantile selection of entities for one feature.

use serde::{Deserialize, Serialize};

/// Entities chosen as the "top" group for one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopSelection {
    /// Selection mask over all entities.
    pub mask: Vec<bool>,
    /// Number of selected entities (`actual_n_top`).
    pub n_selected: usize,
    /// Number of entities with a positive value.
    pub n_active: usize,
    /// Inclusive threshold, or `None` when every active entity was taken.
    pub threshold: Option<f64>,
}

/// Size of the top group for `n_entities` at fraction `top_frac`.
///
/// `max(1, ceil(n_entities * top_frac))`. The product is nudged down by a
/// tiny tolerance first so representation error (e.g. `3000 * 0.1`) does not
/// push an exact integer up to the next one.
pub fn n_top_for(n_entities: usize, top_frac: f64) -> usize {
    let raw = n_entities as f64 * top_frac;
    ((raw - 1e-9).ceil().max(1.0)) as usize
}

/// Number of entities with a positive value.
pub fn count_active(values: &[f64]) -> usize {
    values.iter().filter(|&&v| v > 0.0).count()
}

/// Select the top `n_top` entities by value.
///
/// When no more than `n_top` entities are active, all of them are selected
/// with no thresholding. Otherwise the `n_top`-th largest value is found by
/// partition (no full sort) and every entity at or above it is selected, so
/// ties at the boundary can push the selected count above `n_top`.
pub fn select_top(values: &[f64], n_top: usize) -> TopSelection {
    let n_active = count_active(values);

    if n_active <= n_top {
        let mask: Vec<bool> = values.iter().map(|&v| v > 0.0).collect();
        return TopSelection {
            mask,
            n_selected: n_active,
            n_active,
            threshold: None,
        };
    }

    let mut scratch = values.to_vec();
    let (_, nth, _) = scratch.select_nth_unstable_by(n_top - 1, |a, b| b.total_cmp(a));
    let threshold = *nth;

    let mask: Vec<bool> = values.iter().map(|&v| v >= threshold).collect();
    let n_selected = mask.iter().filter(|&&m| m).count();
    TopSelection {
        mask,
        n_selected,
        n_active,
        threshold: Some(threshold),
    }
}

/// The `k` highest-valued active entities as `(entity, value)`.
///
/// Ordered by descending value, ties by ascending entity id. This view is
/// independent of [`select_top`]: it ranks by magnitude alone.
pub fn top_entities(values: &[f64], k: usize) -> Vec<(usize, f64)> {
    if k == 0 {
        return Vec::new();
    }
    let mut active: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter(|(_, &v)| v > 0.0)
        .map(|(i, &v)| (i, v))
        .collect();

    let order = |a: &(usize, f64), b: &(usize, f64)| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0));
    if active.len() > k {
        active.select_nth_unstable_by(k - 1, order);
        active.truncate(k);
    }
    active.sort_unstable_by(order);
    active
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_n_top() {
        assert_eq!(n_top_for(20, 0.5), 10);
        assert_eq!(n_top_for(20, 0.1), 2);
        assert_eq!(n_top_for(3000, 0.1), 300);
        assert_eq!(n_top_for(25, 0.1), 3);
        assert_eq!(n_top_for(5, 0.01), 1);
    }

    #[test]
    fn test_sparse_feature_selects_all_active() {
        let mut values = vec![0.0; 20];
        for (i, v) in values.iter_mut().enumerate().take(8) {
            *v = 1.0 + i as f64;
        }
        let n_top = n_top_for(20, 0.5);
        let sel = select_top(&values, n_top);

        assert_eq!(sel.n_active, 8);
        assert_eq!(sel.n_selected, 8);
        assert_eq!(sel.threshold, None);
        assert!(sel.mask[..8].iter().all(|&m| m));
        assert!(sel.mask[8..].iter().all(|&m| !m));
    }

    #[test]
    fn test_ties_at_threshold_are_kept() {
        let mut values = vec![5.0, 5.0, 5.0];
        values.extend(std::iter::repeat(3.0).take(17));
        let n_top = n_top_for(20, 0.1);
        let sel = select_top(&values, n_top);

        assert_eq!(n_top, 2);
        assert_eq!(sel.threshold, Some(5.0));
        assert_eq!(sel.n_selected, 3);
        assert_eq!(&sel.mask[..4], &[true, true, true, false]);
    }

    #[test]
    fn test_threshold_selection() {
        let values = vec![0.1, 0.9, 0.0, 0.5, 0.7, 0.3];
        let sel = select_top(&values, 2);

        assert_eq!(sel.n_active, 5);
        assert_eq!(sel.threshold, Some(0.7));
        assert_eq!(sel.mask, vec![false, true, false, false, true, false]);
    }

    #[test]
    fn test_top_entities_order() {
        let values = vec![0.2, 0.9, 0.0, 0.9, 0.5];
        assert_eq!(top_entities(&values, 3), vec![(1, 0.9), (3, 0.9), (4, 0.5)]);
    }

    #[test]
    fn test_top_entities_skips_inactive() {
        let values = vec![0.0, 0.4, 0.0];
        assert_eq!(top_entities(&values, 10), vec![(1, 0.4)]);
        assert!(top_entities(&values, 0).is_empty());
    }
}
