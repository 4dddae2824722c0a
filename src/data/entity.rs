//! Entity (cell) metadata: dense integer ids with categorical label columns.

use crate::error::{EnrichError, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

/// Categorical labels for every entity in a run.
///
/// Entity ids are dense and 0-based: row `i` of the table is entity `i`.
/// Label columns are stored column-major so a grouping can borrow one
/// column without touching the others.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityTable {
    /// Label column names in order.
    column_names: Vec<String>,
    /// `columns[c][e]` is the label of entity `e` in column `c`.
    columns: Vec<Vec<Option<String>>>,
    /// Number of entities.
    n_entities: usize,
}

/// Raw shape of the extraction metadata document.
#[derive(Debug, Deserialize)]
struct ExtractionMetadata {
    n_cells: Option<usize>,
    cell_data: Vec<serde_json::Map<String, serde_json::Value>>,
}

fn parse_label(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "NA" || trimmed == "na" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl EntityTable {
    /// Build a table from label columns given in entity order.
    pub fn from_columns(column_names: Vec<String>, columns: Vec<Vec<Option<String>>>) -> Result<Self> {
        if column_names.len() != columns.len() {
            return Err(EnrichError::DimensionMismatch {
                expected: column_names.len(),
                actual: columns.len(),
            });
        }
        let n_entities = columns.first().map(Vec::len).unwrap_or(0);
        if n_entities == 0 {
            return Err(EnrichError::EmptyData("No entities in metadata".to_string()));
        }
        for col in &columns {
            if col.len() != n_entities {
                return Err(EnrichError::DimensionMismatch {
                    expected: n_entities,
                    actual: col.len(),
                });
            }
        }
        Ok(Self {
            column_names,
            columns,
            n_entities,
        })
    }

    /// Load metadata, choosing the format from the file extension.
    ///
    /// `.json` files are read as extraction metadata; anything else as TSV.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let table = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_extraction_json(path)?,
            _ => Self::from_tsv(path)?,
        };
        info!(
            path = %path.display(),
            n_entities = table.n_entities(),
            columns = ?table.column_names(),
            "loaded entity metadata"
        );
        Ok(table)
    }

    /// Load metadata from a TSV file.
    ///
    /// Expected format:
    /// - First row: header; the first column holds the entity id
    /// - Subsequent rows: entity id followed by label values
    ///
    /// Ids must cover `0..n` exactly once each, in any row order.
    /// Empty and `NA` cells are treated as missing labels.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| EnrichError::EmptyData("Empty metadata file".to_string()))??;
        let header: Vec<&str> = header_line.split('\t').collect();
        if header.len() < 2 {
            return Err(EnrichError::EmptyData(
                "Metadata must have at least one label column".to_string(),
            ));
        }
        let column_names: Vec<String> = header[1..].iter().map(|s| s.trim().to_string()).collect();

        let mut rows: Vec<(usize, Vec<Option<String>>)> = Vec::new();
        for (row_idx, line_result) in lines.enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let raw_id = fields[0].trim();
            let id: usize = raw_id.parse().map_err(|_| EnrichError::InvalidEntityId {
                value: raw_id.to_string(),
                row: row_idx,
                reason: "not a non-negative integer".to_string(),
            })?;
            let labels = (0..column_names.len())
                .map(|c| fields.get(c + 1).and_then(|raw| parse_label(raw)))
                .collect();
            rows.push((id, labels));
        }

        if rows.is_empty() {
            return Err(EnrichError::EmptyData("No entities in metadata".to_string()));
        }

        rows.sort_by_key(|(id, _)| *id);
        for (expected, (id, _)) in rows.iter().enumerate() {
            if *id != expected {
                let reason = if *id < expected {
                    "duplicate id".to_string()
                } else {
                    format!("ids must be contiguous from 0, missing {}", expected)
                };
                return Err(EnrichError::InvalidEntityId {
                    value: id.to_string(),
                    row: expected,
                    reason,
                });
            }
        }

        let mut columns: Vec<Vec<Option<String>>> =
            vec![Vec::with_capacity(rows.len()); column_names.len()];
        for (_, labels) in rows {
            for (c, label) in labels.into_iter().enumerate() {
                columns[c].push(label);
            }
        }

        Self::from_columns(column_names, columns)
    }

    /// Load extraction metadata JSON.
    ///
    /// Expected shape: `{"n_cells": N, "cell_data": [{"cell_type": .., "tissue": .., ...}, ...]}`.
    /// The entity id is the array index. Every string-valued field becomes a
    /// label column; other field types are ignored.
    pub fn from_extraction_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let meta: ExtractionMetadata = serde_json::from_reader(BufReader::new(file))?;

        if let Some(n_cells) = meta.n_cells {
            if n_cells != meta.cell_data.len() {
                return Err(EnrichError::DimensionMismatch {
                    expected: n_cells,
                    actual: meta.cell_data.len(),
                });
            }
        }

        let column_names: Vec<String> = meta
            .cell_data
            .iter()
            .flat_map(|record| {
                record
                    .iter()
                    .filter(|(_, v)| v.is_string())
                    .map(|(k, _)| k.clone())
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if column_names.is_empty() {
            return Err(EnrichError::EmptyData(
                "Extraction metadata has no string label fields".to_string(),
            ));
        }

        let columns = column_names
            .iter()
            .map(|name| {
                meta.cell_data
                    .iter()
                    .map(|record| record.get(name).and_then(|v| v.as_str()).and_then(parse_label))
                    .collect()
            })
            .collect();

        Self::from_columns(column_names, columns)
    }

    /// Number of entities.
    pub fn n_entities(&self) -> usize {
        self.n_entities
    }

    /// Label column names.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Check if a column exists.
    pub fn has_column(&self, column: &str) -> bool {
        self.column_names.iter().any(|c| c == column)
    }

    /// All labels of one column, in entity order.
    pub fn column(&self, column: &str) -> Result<&[Option<String>]> {
        self.column_names
            .iter()
            .position(|c| c == column)
            .map(|idx| self.columns[idx].as_slice())
            .ok_or_else(|| EnrichError::MissingColumn(column.to_string()))
    }

    /// Label of one entity in one column.
    pub fn label(&self, entity: usize, column: &str) -> Option<&str> {
        self.column(column)
            .ok()
            .and_then(|col| col.get(entity))
            .and_then(|l| l.as_deref())
    }

    /// All non-missing labels of one entity, keyed by column.
    pub fn labels(&self, entity: usize) -> BTreeMap<String, String> {
        self.column_names
            .iter()
            .zip(&self.columns)
            .filter_map(|(name, col)| {
                col.get(entity)
                    .and_then(|l| l.clone())
                    .map(|l| (name.clone(), l))
            })
            .collect()
    }

    /// Sorted unique levels of a column.
    pub fn levels(&self, column: &str) -> Result<Vec<String>> {
        Ok(self.category_counts(column)?.into_keys().collect())
    }

    /// Number of entities carrying each level of a column.
    pub fn category_counts(&self, column: &str) -> Result<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for label in self.column(column)?.iter().flatten() {
            *counts.entry(label.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
