//! Integration tests for the checkpointed enrichment pipeline.

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};
use sae_enrich::data::write_raw_f32;
use sae_enrich::pipeline::open_unit_files;
use sae_enrich::prelude::*;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

const N_ENTITIES: usize = 20;

/// Entities 0..8 are type A, the rest type B; tissue alternates.
/// The last entity has no positions at all.
fn n_positions_of(entity: usize) -> usize {
    if entity == N_ENTITIES - 1 {
        0
    } else {
        entity % 3 + 1
    }
}

/// Raw 4-dim row of an entity, before centering by 0.5.
///
/// - feature 0: active only on type A (8 entities)
/// - feature 1: active on entities 0..9 (9 entities)
/// - feature 2: active everywhere, value 1 + (entity mod 5)
/// - feature 3: never active
fn raw_row(entity: usize) -> [f32; 4] {
    let f0 = if entity < 8 { 2.0 + 0.1 * entity as f32 } else { 0.0 };
    let f1 = if entity < 9 { 1.0 } else { 0.0 };
    let f2 = 1.0 + (entity % 5) as f32;
    [f0 + 0.5, f1 + 0.5, f2 + 0.5, 0.0]
}

fn write_metadata(dir: &Path) -> PathBuf {
    let path = dir.join("cells.tsv");
    let mut text = String::from("cell_id\tcell_type\ttissue\n");
    // rows out of order on purpose
    for e in (0..N_ENTITIES).rev() {
        let cell_type = if e < 8 { "A" } else { "B" };
        let tissue = if e % 2 == 0 { "lung" } else { "liver" };
        text.push_str(&format!("{}\t{}\t{}\n", e, cell_type, tissue));
    }
    std::fs::write(&path, text).unwrap();
    path
}

fn write_unit(dir: &Path, id: u32) -> UnitSpec {
    let mut flat = Vec::new();
    let mut ids = Vec::new();
    for e in 0..N_ENTITIES {
        for _ in 0..n_positions_of(e) {
            flat.extend_from_slice(&raw_row(e));
            ids.push(e as u32);
        }
    }
    let rows = DMatrix::from_row_slice(ids.len(), 4, &flat);

    let spec = UnitSpec {
        id,
        activations: dir.join(format!("layer{:02}.f32", id)),
        entity_ids: dir.join(format!("layer{:02}.u32", id)),
        encoder: dir.join(format!("sae{:02}.json", id)),
    };
    write_raw_f32(&spec.activations, &rows).unwrap();
    EntityIndex::new(ids, N_ENTITIES)
        .unwrap()
        .write_file(&spec.entity_ids)
        .unwrap();
    TopKSae::new(DMatrix::identity(4, 4), DVector::zeros(4), vec![0.5; 4], 4)
        .unwrap()
        .save(&spec.encoder)
        .unwrap();
    spec
}

struct Fixture {
    dir: TempDir,
    config: RunConfig,
}

fn fixture(unit_ids: &[u32], enrichment: EnrichmentConfig, stream: StreamConfig) -> Fixture {
    let dir = tempdir().unwrap();
    let metadata = write_metadata(dir.path());
    let units = unit_ids.iter().map(|&id| write_unit(dir.path(), id)).collect();
    let config = RunConfig {
        name: "test".to_string(),
        metadata,
        output_dir: dir.path().join("out"),
        checkpoint: None,
        units,
        enrichment,
        stream,
    };
    Fixture { dir, config }
}

fn half_top() -> EnrichmentConfig {
    EnrichmentConfig {
        top_frac: 0.5,
        min_active_entities: 5,
        ..EnrichmentConfig::default()
    }
}

fn small_batches() -> StreamConfig {
    StreamConfig {
        chunk_size: 2,
        checkpoint_every: 3,
    }
}

fn run_to_report(fixture: &Fixture, unit: u32) -> UnitReport {
    let runner = CheckpointedRunner::from_config(fixture.config.clone()).unwrap();
    let outcome = runner.run(&[]).unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    UnitReport::read_json(fixture.config.output_path(unit)).unwrap()
}

/// Source that raises the cancel flag after a number of reads.
struct CancelAfter {
    inner: Box<dyn ActivationSource>,
    reads_left: usize,
    flag: Arc<AtomicBool>,
}

impl ActivationSource for CancelAfter {
    fn n_positions(&self) -> usize {
        self.inner.n_positions()
    }

    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn read(&mut self, range: Range<usize>) -> Result<DMatrix<f32>> {
        let block = self.inner.read(range)?;
        self.reads_left = self.reads_left.saturating_sub(1);
        if self.reads_left == 0 {
            self.flag.store(true, Ordering::SeqCst);
        }
        Ok(block)
    }
}

#[test]
fn test_end_to_end_perfect_separation() {
    let fx = fixture(&[5], half_top(), small_batches());
    let report = run_to_report(&fx, 5);

    assert_eq!(report.unit, 5);
    assert_eq!(report.n_entities, 20);
    assert_eq!(report.n_features, 4);
    assert_eq!(report.n_positions, 37);
    // 15 + 18 + 37 fires over 37 positions
    assert_relative_eq!(report.mean_active_per_position, 70.0 / 37.0, epsilon = 1e-12);
    assert_eq!(report.category_counts["cell_type"]["A"], 8);
    assert_eq!(report.category_counts["cell_type"]["B"], 12);
    assert_eq!(report.category_counts["tissue"]["lung"], 10);

    // feature 3 never fires
    assert_eq!(report.n_features_tested, 3);
    assert!(!report.features.contains_key(&3));

    let f0 = &report.features[&0];
    assert_eq!(f0.n_active_entities, 8);
    assert_eq!(f0.n_selected, 8);

    let cell_type = &f0.enrichments["cell_type"];
    assert_eq!(cell_type.len(), 1);
    let a = &cell_type[0];
    assert_eq!(a.category, "A");
    assert_eq!(a.n_top, 8);
    assert_eq!(a.n_total, 8);
    assert_eq!(a.frac_top, 1.0);
    assert_relative_eq!(a.p_raw, 1.0 / 125_970.0, max_relative = 1e-9);
    assert!(a.p_adj < 0.05);
    assert!(a.odds_ratio > 1e11);
    assert!(f0.enrichments["tissue"].is_empty());

    assert_eq!(f0.top_entities.len(), 8);
    let first = &f0.top_entities[0];
    assert_eq!(first.entity, 7);
    assert_relative_eq!(first.activation, 2.7);
    assert_eq!(first.labels["cell_type"], "A");
    assert_eq!(first.labels["tissue"], "liver");

    // ties at 3.0 pull an 11th entity into the top 10
    assert_eq!(report.features[&2].n_active_entities, 19);
    assert_eq!(report.features[&2].n_selected, 11);

    // feature 1 (A plus one B entity) is enriched too; nothing is tissue-specific
    assert_eq!(report.n_with_enrichment["cell_type"], 2);
    assert_eq!(report.n_with_enrichment["tissue"], 0);

    // progress artifacts are gone after the only unit finished
    assert!(!fx.config.checkpoint_path().exists());
}

#[test]
fn test_min_active_filter() {
    let enrichment = EnrichmentConfig {
        top_frac: 0.1,
        ..EnrichmentConfig::default()
    };
    let fx = fixture(&[0], enrichment, small_batches());
    let report = run_to_report(&fx, 0);

    // feature 0 (8 active) and feature 1 (9 active) fall below 10
    assert_eq!(report.min_active_entities, 10);
    assert_eq!(report.n_features_tested, 1);
    assert_eq!(report.features.keys().copied().collect::<Vec<_>>(), vec![2]);
}

#[test]
fn test_frac_active_metric_with_json_metadata() {
    let mut fx = fixture(
        &[1],
        EnrichmentConfig {
            metric: ActivationMetric::FracActive,
            ..half_top()
        },
        small_batches(),
    );
    let cell_data: Vec<serde_json::Value> = (0..N_ENTITIES)
        .map(|e| {
            let cell_type = if e < 8 { "A" } else { "B" };
            let tissue = if e % 2 == 0 { "lung" } else { "liver" };
            serde_json::json!({
                "cell_type": cell_type,
                "tissue": tissue,
                "n_genes": 1000 + e,
            })
        })
        .collect();
    let json_path = fx.dir.path().join("cell_metadata.json");
    std::fs::write(
        &json_path,
        serde_json::to_string(&serde_json::json!({"n_cells": N_ENTITIES, "cell_data": cell_data})).unwrap(),
    )
    .unwrap();
    fx.config.metadata = json_path;

    let report = run_to_report(&fx, 1);
    assert_eq!(report.metric, ActivationMetric::FracActive);

    // every firing feature fires on every position of its entities
    let f0 = &report.features[&0];
    assert_eq!(f0.top_entities[0].activation, 1.0);
    assert_eq!(f0.top_entities[0].entity, 0);
    assert_eq!(f0.enrichments["cell_type"][0].category, "A");
}

#[test]
fn test_interrupt_and_resume_is_idempotent() {
    let reference = {
        let fx = fixture(&[11], half_top(), small_batches());
        run_to_report(&fx, 11)
    };

    let fx = fixture(&[11], half_top(), small_batches());
    let runner = CheckpointedRunner::from_config(fx.config.clone()).unwrap();
    let flag = runner.cancel_flag();

    // first batch covers entities 0..3 = 6 positions = 3 reads of 2
    let outcome = runner
        .run_with(&[], |spec| {
            let mut inputs = open_unit_files(spec, N_ENTITIES)?;
            inputs.source = Box::new(CancelAfter {
                inner: inputs.source,
                reads_left: 3,
                flag: Arc::clone(&flag),
            });
            Ok(inputs)
        })
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Interrupted {
            unit: 11,
            entities_completed: 3
        }
    );

    let ck_path = fx.config.checkpoint_path();
    let ck = Checkpoint::load(&ck_path).unwrap().unwrap();
    assert_eq!(ck.entities_completed, 3);
    assert_eq!(ck.units_in_progress, vec![11]);
    assert!(!fx.config.output_path(11).exists());
    assert_eq!(
        runner.unit_state(11).unwrap(),
        UnitState::InProgress {
            entities_completed: 3
        }
    );

    // a fresh process picks up from the snapshot
    let resumed = run_to_report(&fx, 11);
    assert_eq!(resumed, reference);
    assert!(!ck_path.exists());
}

#[test]
fn test_existing_output_is_skipped() {
    let mut fx = fixture(&[0, 5], half_top(), small_batches());
    // unit 0 cannot be opened; it must never be touched
    fx.config.units[0].activations = fx.dir.path().join("missing.f32");

    let out0 = fx.config.output_path(0);
    std::fs::create_dir_all(out0.parent().unwrap()).unwrap();
    std::fs::write(&out0, "already here").unwrap();

    let runner = CheckpointedRunner::from_config(fx.config.clone()).unwrap();
    let outcome = runner.run(&[]).unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Completed {
            written: vec![5],
            skipped: vec![0]
        }
    );
    assert_eq!(std::fs::read_to_string(&out0).unwrap(), "already here");
    assert!(fx.config.output_path(5).exists());
    assert!(!fx.config.checkpoint_path().exists());

    // a second run does nothing
    let again = runner.run(&[]).unwrap();
    assert_eq!(
        again,
        RunOutcome::Completed {
            written: vec![],
            skipped: vec![0, 5]
        }
    );
}

#[test]
fn test_missing_input_names_unit_and_stage() {
    let mut fx = fixture(&[17], half_top(), small_batches());
    fx.config.units[0].encoder = fx.dir.path().join("nope.json");

    let runner = CheckpointedRunner::from_config(fx.config.clone()).unwrap();
    let err = runner.run(&[]).unwrap_err();
    assert!(err.to_string().starts_with("unit 17 / open:"));
    assert!(!fx.config.output_path(17).exists());
}

#[test]
fn test_chunk_size_does_not_change_report() {
    let one = fixture(
        &[3],
        half_top(),
        StreamConfig {
            chunk_size: 1,
            checkpoint_every: 1,
        },
    );
    let big = fixture(
        &[3],
        half_top(),
        StreamConfig {
            chunk_size: 10_000,
            checkpoint_every: 200,
        },
    );

    assert_eq!(run_to_report(&one, 3), run_to_report(&big, 3));
}
