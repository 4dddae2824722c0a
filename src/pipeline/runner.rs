//! Checkpointed execution of processing units.
//!
//! Each unit moves `Pending → InProgress → Done`. A unit whose report already
//! exists is `Done` and never recomputed. A unit in progress continues from
//! its accumulator snapshot. Progress is saved after every batch of
//! `stream.checkpoint_every` entities, and once every configured unit has a
//! report the checkpoint and snapshots are deleted.

use super::checkpoint::{remove_if_exists, snapshot_path, AccumulatorSnapshot, Checkpoint};
use super::config::{RunConfig, UnitSpec};
use crate::accumulate::StreamingAccumulator;
use crate::data::{ActivationSource, EntityIndex, EntityTable, Grouping, RawF32Source};
use crate::encode::{SparseEncoder, TopKSae};
use crate::enrich::{build_groupings, run_enrichment};
use crate::error::{EnrichError, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything needed to accumulate one unit.
pub struct UnitInputs {
    pub source: Box<dyn ActivationSource>,
    pub index: EntityIndex,
    pub encoder: Box<dyn SparseEncoder>,
}

/// Open a unit's files: encoder artifact, raw activations and id index.
pub fn open_unit_files(spec: &UnitSpec, n_entities: usize) -> Result<UnitInputs> {
    let encoder = TopKSae::load(&spec.encoder)?;
    let source = RawF32Source::open(&spec.activations, encoder.d_in())?;
    let index = EntityIndex::from_file(&spec.entity_ids, n_entities)?;
    Ok(UnitInputs {
        source: Box::new(source),
        index,
        encoder: Box::new(encoder),
    })
}

/// Where a unit stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    InProgress { entities_completed: usize },
    Done,
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitState::Pending => write!(f, "pending"),
            UnitState::InProgress { entities_completed } => {
                write!(f, "in progress ({} entities done)", entities_completed)
            }
            UnitState::Done => write!(f, "done"),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every selected unit has a report.
    Completed {
        written: Vec<u32>,
        skipped: Vec<u32>,
    },
    /// Cancellation was requested; progress up to the cursor is saved.
    Interrupted { unit: u32, entities_completed: usize },
}

enum Accumulated {
    Finished(StreamingAccumulator),
    Interrupted(usize),
}

/// Drives accumulation, enrichment and persistence for the units of a config.
pub struct CheckpointedRunner {
    config: RunConfig,
    n_entities: usize,
    groupings: Vec<Grouping>,
    cancel: Arc<AtomicBool>,
}

impl CheckpointedRunner {
    /// Validate the config and encode the grouping columns of the metadata.
    pub fn new(config: RunConfig, table: &EntityTable) -> Result<Self> {
        config.validate()?;
        if table.n_entities() == 0 {
            return Err(EnrichError::EmptyData("entity metadata has no rows".to_string()));
        }
        let groupings = build_groupings(table, &config.enrichment)?;
        for g in &groupings {
            info!(
                column = g.column(),
                levels = g.levels().len(),
                "grouping ready"
            );
        }
        Ok(Self {
            config,
            n_entities: table.n_entities(),
            groupings,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Load the metadata named by the config and build a runner.
    pub fn from_config(config: RunConfig) -> Result<Self> {
        let table = EntityTable::load(&config.metadata)?;
        Self::new(config, &table)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Flag checked between checkpoint batches; set it to stop the run.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// State of one unit from the files on disk.
    pub fn unit_state(&self, unit: u32) -> Result<UnitState> {
        let checkpoint = Checkpoint::load(self.config.checkpoint_path())?;
        Ok(self.state_with(unit, checkpoint.as_ref()))
    }

    /// State of every configured unit.
    pub fn status(&self) -> Result<Vec<(u32, UnitState)>> {
        let checkpoint = Checkpoint::load(self.config.checkpoint_path())?;
        Ok(self
            .config
            .units
            .iter()
            .map(|u| (u.id, self.state_with(u.id, checkpoint.as_ref())))
            .collect())
    }

    fn state_with(&self, unit: u32, checkpoint: Option<&Checkpoint>) -> UnitState {
        if self.config.output_path(unit).exists() {
            return UnitState::Done;
        }
        match checkpoint {
            Some(ck) if ck.is_in_progress(unit) => UnitState::InProgress {
                entities_completed: ck.entities_completed,
            },
            _ => UnitState::Pending,
        }
    }

    /// Run the selected units (all when `units` is empty) from their files.
    pub fn run(&self, units: &[u32]) -> Result<RunOutcome> {
        let n_entities = self.n_entities;
        self.run_with(units, |spec| open_unit_files(spec, n_entities))
    }

    /// Run the selected units with a custom input opener.
    pub fn run_with<F>(&self, units: &[u32], mut open: F) -> Result<RunOutcome>
    where
        F: FnMut(&UnitSpec) -> Result<UnitInputs>,
    {
        let checkpoint_path = self.config.checkpoint_path();
        let mut checkpoint = match Checkpoint::load(&checkpoint_path)? {
            Some(ck) => {
                info!(
                    path = %checkpoint_path.display(),
                    completed = ?ck.completed_units,
                    in_progress = ?ck.units_in_progress,
                    "found checkpoint"
                );
                ck
            }
            None => Checkpoint::default(),
        };

        let mut written = Vec::new();
        let mut skipped = Vec::new();

        for spec in self.config.select_units(units)? {
            let output = self.config.output_path(spec.id);
            if output.exists() {
                info!(unit = spec.id, path = %output.display(), "output exists, skipping");
                checkpoint.mark_completed(spec.id);
                skipped.push(spec.id);
                continue;
            }

            let inputs = open(spec).map_err(|e| e.in_stage(spec.id, "open"))?;
            let acc = match self
                .accumulate(spec.id, inputs, &mut checkpoint)
                .map_err(|e| e.in_stage(spec.id, "accumulate"))?
            {
                Accumulated::Finished(acc) => acc,
                Accumulated::Interrupted(cursor) => {
                    checkpoint.save(&checkpoint_path)?;
                    warn!(unit = spec.id, entities_completed = cursor, "interrupted");
                    return Ok(RunOutcome::Interrupted {
                        unit: spec.id,
                        entities_completed: cursor,
                    });
                }
            };

            let report = run_enrichment(spec.id, &acc, &self.groupings, &self.config.enrichment)
                .map_err(|e| e.in_stage(spec.id, "enrich"))?;
            report
                .write_json(&output)
                .map_err(|e| e.in_stage(spec.id, "write"))?;
            info!(
                unit = spec.id,
                path = %output.display(),
                tested = report.n_features_tested,
                "unit done"
            );

            checkpoint.mark_completed(spec.id);
            checkpoint.save(&checkpoint_path)?;
            remove_if_exists(&snapshot_path(&checkpoint_path, spec.id))?;
            written.push(spec.id);
        }

        self.finish(&mut checkpoint, &checkpoint_path)?;
        Ok(RunOutcome::Completed { written, skipped })
    }

    /// Delete the progress artifacts once every configured unit is done,
    /// otherwise persist the checkpoint.
    fn finish(&self, checkpoint: &mut Checkpoint, checkpoint_path: &Path) -> Result<()> {
        let all_done = self
            .config
            .units
            .iter()
            .all(|u| self.config.output_path(u.id).exists());
        if all_done {
            remove_if_exists(checkpoint_path)?;
            for u in &self.config.units {
                remove_if_exists(&snapshot_path(checkpoint_path, u.id))?;
            }
            info!("all units done, checkpoint removed");
        } else {
            checkpoint.save(checkpoint_path)?;
        }
        Ok(())
    }

    fn accumulate(
        &self,
        unit: u32,
        inputs: UnitInputs,
        checkpoint: &mut Checkpoint,
    ) -> Result<Accumulated> {
        let UnitInputs {
            mut source,
            index,
            encoder,
        } = inputs;
        let n_entities = self.n_entities;
        let n_features = encoder.n_features();

        if index.n_entities() != n_entities {
            return Err(EnrichError::DimensionMismatch {
                expected: n_entities,
                actual: index.n_entities(),
            });
        }
        if index.n_positions() != source.n_positions() {
            return Err(EnrichError::DimensionMismatch {
                expected: source.n_positions(),
                actual: index.n_positions(),
            });
        }
        if source.dim() != encoder.d_in() {
            return Err(EnrichError::DimensionMismatch {
                expected: encoder.d_in(),
                actual: source.dim(),
            });
        }

        let checkpoint_path = self.config.checkpoint_path();
        let snap_path = snapshot_path(&checkpoint_path, unit);
        let (mut acc, mut cursor) = match AccumulatorSnapshot::load(&snap_path)? {
            Some(snap)
                if snap.unit == unit
                    && snap.entities_completed <= n_entities
                    && snap.accumulator.n_entities() == n_entities
                    && snap.accumulator.n_features() == n_features =>
            {
                info!(unit, entities_completed = snap.entities_completed, "resuming unit");
                (snap.accumulator, snap.entities_completed)
            }
            Some(_) => {
                warn!(unit, path = %snap_path.display(), "snapshot does not match unit, starting over");
                (StreamingAccumulator::new(n_entities, n_features), 0)
            }
            None => {
                info!(unit, n_entities, n_positions = index.n_positions(), "starting unit");
                (StreamingAccumulator::new(n_entities, n_features), 0)
            }
        };
        checkpoint.mark_in_progress(unit);
        checkpoint.entities_completed = cursor;

        let chunk_size = self.config.stream.chunk_size;
        let every = self.config.stream.checkpoint_every;

        while cursor < n_entities {
            if self.cancel.load(Ordering::SeqCst) {
                return Ok(Accumulated::Interrupted(cursor));
            }

            let started = Instant::now();
            let end = (cursor + every).min(n_entities);
            let span = index.positions_of(cursor..end);

            let mut start = span.start;
            while start < span.end {
                let stop = (start + chunk_size).min(span.end);
                let block = source.read(start..stop)?;
                let encoded = encoder.encode_block(&block)?;
                acc.consume(&encoded, index.ids(start..stop))?;
                start = stop;
            }

            cursor = end;
            AccumulatorSnapshot {
                unit,
                entities_completed: cursor,
                accumulator: acc.clone(),
            }
            .save(&snap_path)?;
            checkpoint.entities_completed = cursor;
            checkpoint.save(&checkpoint_path)?;

            let elapsed = started.elapsed().as_secs_f64();
            debug!(
                unit,
                entities = cursor,
                of = n_entities,
                positions_per_sec = (span.len() as f64 / elapsed.max(1e-9)) as u64,
                "checkpoint"
            );
        }

        info!(
            unit,
            positions = acc.total_positions(),
            mean_active_per_position = acc.mean_active_per_position(),
            "accumulation finished"
        );
        Ok(Accumulated::Finished(acc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemorySource;
    use crate::enrich::GroupingPolicy;
    use crate::pipeline::config::StreamConfig;
    use nalgebra::{DMatrix, DVector};
    use tempfile::tempdir;

    fn table(n: usize) -> EntityTable {
        let cell_type = (0..n)
            .map(|i| Some(if i % 2 == 0 { "even" } else { "odd" }.to_string()))
            .collect();
        EntityTable::from_columns(vec!["cell_type".to_string()], vec![cell_type]).unwrap()
    }

    fn config(dir: &std::path::Path, unit_ids: &[u32]) -> RunConfig {
        let mut config = RunConfig::example();
        config.output_dir = dir.to_path_buf();
        config.units = unit_ids
            .iter()
            .map(|&id| UnitSpec {
                id,
                activations: dir.join("unused.f32"),
                entity_ids: dir.join("unused.u32"),
                encoder: dir.join("unused.json"),
            })
            .collect();
        config.enrichment.min_active_entities = 1;
        config.enrichment.groupings = vec![GroupingPolicy::new("cell_type", 0, None)];
        config.stream = StreamConfig {
            chunk_size: 3,
            checkpoint_every: 2,
        };
        config
    }

    /// Two positions per entity, two features; feature 0 fires on even entities.
    fn inputs(n: usize) -> UnitInputs {
        let rows = DMatrix::from_fn(2 * n, 2, |r, c| {
            let e = r / 2;
            match c {
                0 if e % 2 == 0 => 1.0,
                1 => 0.5,
                _ => 0.0,
            }
        });
        let ids = (0..2 * n as u32).map(|p| p / 2).collect();
        let encoder = TopKSae::new(DMatrix::identity(2, 2), DVector::zeros(2), vec![0.0; 2], 2).unwrap();
        UnitInputs {
            source: Box::new(InMemorySource::new(rows)),
            index: EntityIndex::new(ids, n).unwrap(),
            encoder: Box::new(encoder),
        }
    }

    #[test]
    fn test_run_writes_and_cleans_up() {
        let dir = tempdir().unwrap();
        let runner = CheckpointedRunner::new(config(dir.path(), &[1, 2]), &table(6)).unwrap();

        let outcome = runner.run_with(&[], |_| Ok(inputs(6))).unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                written: vec![1, 2],
                skipped: vec![]
            }
        );
        assert!(dir.path().join("enrichment_layer01.json").exists());
        assert!(dir.path().join("enrichment_layer02.json").exists());
        assert!(!runner.config().checkpoint_path().exists());
        assert_eq!(runner.unit_state(1).unwrap(), UnitState::Done);
    }

    #[test]
    fn test_subset_keeps_checkpoint() {
        let dir = tempdir().unwrap();
        let runner = CheckpointedRunner::new(config(dir.path(), &[1, 2]), &table(6)).unwrap();

        runner.run_with(&[2], |_| Ok(inputs(6))).unwrap();

        let ck = Checkpoint::load(runner.config().checkpoint_path()).unwrap().unwrap();
        assert_eq!(ck.completed_units, vec![2]);
        let status = runner.status().unwrap();
        assert_eq!(status, vec![(1, UnitState::Pending), (2, UnitState::Done)]);
    }

    #[test]
    fn test_cancel_before_start() {
        let dir = tempdir().unwrap();
        let runner = CheckpointedRunner::new(config(dir.path(), &[3]), &table(6)).unwrap();
        runner.cancel_flag().store(true, Ordering::SeqCst);

        let outcome = runner.run_with(&[], |_| Ok(inputs(6))).unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Interrupted {
                unit: 3,
                entities_completed: 0
            }
        );
        assert!(!dir.path().join("enrichment_layer03.json").exists());
        assert_eq!(
            runner.unit_state(3).unwrap(),
            UnitState::InProgress {
                entities_completed: 0
            }
        );
    }

    #[test]
    fn test_dimension_mismatch_names_unit_and_stage() {
        let dir = tempdir().unwrap();
        let runner = CheckpointedRunner::new(config(dir.path(), &[7]), &table(6)).unwrap();

        let err = runner.run_with(&[], |_| Ok(inputs(5))).unwrap_err();
        assert!(err.to_string().starts_with("unit 7 / accumulate:"));
        match err {
            EnrichError::Pipeline { unit, stage, .. } => {
                assert_eq!(unit, 7);
                assert_eq!(stage, "accumulate");
            }
            other => panic!("expected Pipeline error, got {:?}", other),
        }
    }

    #[test]
    fn test_report_content() {
        let dir = tempdir().unwrap();
        let runner = CheckpointedRunner::new(config(dir.path(), &[1]), &table(6)).unwrap();
        runner.run_with(&[], |_| Ok(inputs(6))).unwrap();

        let report = crate::data::UnitReport::read_json(dir.path().join("enrichment_layer01.json")).unwrap();
        assert_eq!(report.n_entities, 6);
        assert_eq!(report.n_positions, 12);
        // feature 0 on half the positions, feature 1 on all
        assert_eq!(report.mean_active_per_position, 1.5);
        assert_eq!(report.features[&0].n_active_entities, 3);
        assert_eq!(report.category_counts["cell_type"]["even"], 3);
    }
}
