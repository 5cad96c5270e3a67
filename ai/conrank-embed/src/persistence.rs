//! Checkpoint management and report export
//!
//! Checkpoints are JSON snapshots of a model's trainable state, one file per
//! global step (`checkpoint_step_{N}.json`). The manager prunes old files
//! beyond its retention limit and finds the restore candidate by the highest
//! step number in the directory. Restoring a checkpoint whose schema no
//! longer matches the model is handled inside the model's `load`: the
//! recognizable fields are applied and each missing variable group is
//! warned about, never fatal.

use crate::evaluation::{EvaluationReport, RelationMetrics, REPORT_COLUMNS};
use crate::EmbeddingModel;
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CHECKPOINT_PREFIX: &str = "checkpoint_step_";
const CHECKPOINT_SUFFIX: &str = ".json";

/// Writes step-stamped checkpoints and keeps only the newest few
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P, max_checkpoints: usize) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        fs::create_dir_all(&checkpoint_dir)
            .with_context(|| format!("creating {}", checkpoint_dir.display()))?;
        Ok(Self {
            checkpoint_dir,
            max_checkpoints: max_checkpoints.max(1),
        })
    }

    /// Save the model's trainable state for `step` and prune old files
    pub fn save_checkpoint(&self, model: &dyn EmbeddingModel, step: u64) -> Result<PathBuf> {
        let path = self
            .checkpoint_dir
            .join(format!("{CHECKPOINT_PREFIX}{step}{CHECKPOINT_SUFFIX}"));
        model.save(path.to_string_lossy().as_ref())?;
        self.cleanup_old_checkpoints()?;
        debug!("saved checkpoint {}", path.display());
        Ok(path)
    }

    /// Restore the newest checkpoint into the model, if one exists.
    /// Returns the restored path, or None when the directory has no
    /// checkpoints yet.
    pub fn restore_latest(&self, model: &mut dyn EmbeddingModel) -> Result<Option<PathBuf>> {
        match self.latest_checkpoint()? {
            Some(path) => {
                model.load(path.to_string_lossy().as_ref())?;
                info!("restored checkpoint {}", path.display());
                Ok(Some(path))
            }
            None => {
                warn!(
                    "no checkpoint found in {}, starting from fresh initialization",
                    self.checkpoint_dir.display()
                );
                Ok(None)
            }
        }
    }

    /// All checkpoint files, ascending by step
    pub fn list_checkpoints(&self) -> Result<Vec<PathBuf>> {
        let mut checkpoints: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.checkpoint_dir)
            .with_context(|| format!("reading {}", self.checkpoint_dir.display()))?
        {
            let path = entry?.path();
            if let Some(step) = parse_step(&path) {
                checkpoints.push((step, path));
            }
        }
        checkpoints.sort_by_key(|(step, _)| *step);
        Ok(checkpoints.into_iter().map(|(_, path)| path).collect())
    }

    /// The checkpoint with the highest step, the restore candidate
    pub fn latest_checkpoint(&self) -> Result<Option<PathBuf>> {
        Ok(self.list_checkpoints()?.into_iter().last())
    }

    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let checkpoints = self.list_checkpoints()?;
        if checkpoints.len() > self.max_checkpoints {
            let to_remove = checkpoints.len() - self.max_checkpoints;
            for path in checkpoints.iter().take(to_remove) {
                fs::remove_file(path)
                    .with_context(|| format!("removing {}", path.display()))?;
                debug!("removed old checkpoint {}", path.display());
            }
        }
        Ok(())
    }
}

fn parse_step(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(CHECKPOINT_PREFIX)?
        .strip_suffix(CHECKPOINT_SUFFIX)?
        .parse()
        .ok()
}

/// Writes the evaluation report as CSV
pub struct ReportExporter;

impl ReportExporter {
    pub fn export_to_csv(report: &EvaluationReport, output_path: &str) -> Result<()> {
        let file = fs::File::create(output_path)
            .with_context(|| format!("creating {output_path}"))?;
        Self::write_csv(report, &mut std::io::BufWriter::new(file))?;
        info!("wrote metrics report to {}", output_path);
        Ok(())
    }

    pub fn write_csv<W: Write>(report: &EvaluationReport, out: &mut W) -> Result<()> {
        writeln!(out, "{}", REPORT_COLUMNS.join(","))?;
        for row in &report.rows {
            write_row(out, row)?;
        }
        write_row(out, &report.overall)?;
        Ok(())
    }
}

fn write_row<W: Write>(out: &mut W, row: &RelationMetrics) -> Result<()> {
    writeln!(
        out,
        "{},{:.4},{:.6},{:.6},{:.4},{:.6},{:.6},{},{},{}",
        row.relationship,
        row.mean_rank,
        row.mrr,
        row.mrr_per_triple,
        row.rand_mean_rank,
        row.rand_mrr,
        row.rand_mrr_per_triple,
        row.miss,
        row.triples,
        row.targets
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::conmask::tests::tiny_model;
    use tempfile::TempDir;

    #[test]
    fn test_save_prune_and_latest() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3).unwrap();
        let model = tiny_model();

        for step in [100, 200, 300, 400, 500] {
            manager.save_checkpoint(&model, step).unwrap();
        }

        let checkpoints = manager.list_checkpoints().unwrap();
        assert_eq!(checkpoints.len(), 3);
        // Oldest steps pruned, newest kept in ascending order
        let names: Vec<String> = checkpoints
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "checkpoint_step_300.json",
                "checkpoint_step_400.json",
                "checkpoint_step_500.json"
            ]
        );
        let latest = manager.latest_checkpoint().unwrap().unwrap();
        assert!(latest.ends_with("checkpoint_step_500.json"));
    }

    #[test]
    fn test_latest_sorts_by_step_not_name() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 10).unwrap();
        let model = tiny_model();

        // Lexicographic order would put step 900 after step 1000
        manager.save_checkpoint(&model, 900).unwrap();
        manager.save_checkpoint(&model, 1000).unwrap();
        let latest = manager.latest_checkpoint().unwrap().unwrap();
        assert!(latest.ends_with("checkpoint_step_1000.json"));
    }

    #[test]
    fn test_restore_latest_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3).unwrap();

        let mut model = tiny_model();
        model.predict_weight = [2.0, 1.0, 1.0, 0.5];
        model.base.global_step = 42;
        manager.save_checkpoint(&model, 42).unwrap();

        let mut restored = tiny_model();
        let path = manager.restore_latest(&mut restored).unwrap();
        assert!(path.is_some());
        assert_eq!(*restored.predict_weight(), [2.0, 1.0, 1.0, 0.5]);
        assert_eq!(restored.global_step(), 42);
    }

    #[test]
    fn test_restore_latest_without_checkpoints() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3).unwrap();
        let mut model = tiny_model();
        let path = manager.restore_latest(&mut model).unwrap();
        assert!(path.is_none());
        assert_eq!(model.global_step(), 0);
    }

    #[test]
    fn test_report_csv_columns_and_rows() {
        let row = RelationMetrics {
            relationship: "born_in".to_string(),
            mean_rank: 3.5,
            mrr: 0.52,
            mrr_per_triple: 0.61,
            rand_mean_rank: 48.2,
            rand_mrr: 0.04,
            rand_mrr_per_triple: 0.05,
            miss: 2,
            triples: 20,
            targets: 96,
        };
        let overall = RelationMetrics {
            relationship: "OVERALL".to_string(),
            targets: -1,
            ..row.clone()
        };
        let report = EvaluationReport {
            rows: vec![row],
            overall,
        };

        let mut buf = Vec::new();
        ReportExporter::write_csv(&report, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "relationship,mean_rank,mrr,mrr_per_triple,rand_mean_rank,rand_mrr,rand_mrr_per_triple,miss,triples,targets"
        );
        let first = lines.next().unwrap();
        assert!(first.starts_with("born_in,3.5000,0.520000,"));
        assert!(first.ends_with(",2,20,96"));
        let last = lines.next().unwrap();
        assert!(last.starts_with("OVERALL,"));
        assert!(last.ends_with(",-1"));
    }
}
