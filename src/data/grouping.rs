//! A categorical grouping of entities (cell type, tissue, ...).

use crate::data::EntityTable;
use crate::error::{EnrichError, Result};
use std::collections::BTreeMap;

/// One label column encoded as per-entity category codes.
///
/// Levels are sorted; `codes[e]` indexes into `levels`, or is `None` when
/// the entity has no label in this column. Unlabelled entities still count
/// toward the "rest" cells of every contingency table.
#[derive(Debug, Clone)]
pub struct Grouping {
    column: String,
    levels: Vec<String>,
    codes: Vec<Option<usize>>,
    populations: Vec<usize>,
}

impl Grouping {
    /// Encode one column of an entity table.
    pub fn from_table(table: &EntityTable, column: &str) -> Result<Self> {
        let labels = table.column(column)?;
        let levels = table.levels(column)?;
        if levels.is_empty() {
            return Err(EnrichError::EmptyData(format!(
                "Column '{}' has no labelled entities",
                column
            )));
        }
        let index: BTreeMap<&str, usize> = levels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i))
            .collect();

        let mut populations = vec![0usize; levels.len()];
        let codes = labels
            .iter()
            .map(|label| {
                let code = label.as_deref().and_then(|l| index.get(l).copied());
                if let Some(c) = code {
                    populations[c] += 1;
                }
                code
            })
            .collect();

        Ok(Self {
            column: column.to_string(),
            levels,
            codes,
            populations,
        })
    }

    /// Name of the label column.
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Sorted category levels.
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Number of entities covered (labelled or not).
    pub fn n_entities(&self) -> usize {
        self.codes.len()
    }

    /// Category code of an entity.
    #[inline]
    pub fn code(&self, entity: usize) -> Option<usize> {
        self.codes.get(entity).copied().flatten()
    }

    /// Number of entities in a category.
    pub fn population(&self, level: usize) -> usize {
        self.populations.get(level).copied().unwrap_or(0)
    }

    /// Category codes whose population is at least `min_entities`.
    pub fn eligible_levels(&self, min_entities: usize) -> Vec<usize> {
        (0..self.levels.len())
            .filter(|&l| self.populations[l] >= min_entities)
            .collect()
    }

    /// Membership mask for one category.
    pub fn membership(&self, level: usize) -> Vec<bool> {
        self.codes.iter().map(|c| *c == Some(level)).collect()
    }

    /// Count selected entities per category in one pass over the mask.
    pub fn selected_per_level(&self, selected: &[bool]) -> Vec<usize> {
        let mut counts = vec![0usize; self.levels.len()];
        for (code, &sel) in self.codes.iter().zip(selected) {
            if let (Some(c), true) = (code, sel) {
                counts[*c] += 1;
            }
        }
        counts
    }

    /// Population table keyed by level name.
    pub fn population_table(&self) -> BTreeMap<String, usize> {
        self.levels
            .iter()
            .cloned()
            .zip(self.populations.iter().copied())
            .collect()
    }
}
