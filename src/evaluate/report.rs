use crate::error::Result;
use crate::evaluate::{ClassificationMetrics, Evaluation};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Files written for one evaluated run
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub samples: PathBuf,
    pub roc: PathBuf,
    pub groups: PathBuf,
    pub summary: PathBuf,
}

#[derive(Serialize)]
struct Summary<'a> {
    run: &'a str,
    samples: usize,
    auc: f64,
    threshold: f64,
    #[serde(flatten)]
    metrics: &'a ClassificationMetrics,
}

/// Writes evaluation tables under one directory
pub struct ReportWriter {
    output_dir: PathBuf,
}

impl ReportWriter {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    /// Write `{stem}.samples.csv`, `{stem}.roc.csv`, `{stem}.groups.csv` and
    /// `{stem}.summary.json`.
    ///
    /// Every table is rendered and staged as `.partial` first, so a failure
    /// leaves no partial report behind.
    pub fn write(&self, stem: &str, evaluation: &Evaluation) -> Result<ReportPaths> {
        let samples = self.render_samples(evaluation)?;
        let roc = self.render_roc(evaluation)?;
        let groups = self.render_groups(evaluation)?;
        let summary = serde_json::to_string_pretty(&Summary {
            run: stem,
            samples: evaluation.samples.len(),
            auc: evaluation.auc,
            threshold: evaluation.threshold,
            metrics: &evaluation.metrics,
        })?;

        fs::create_dir_all(&self.output_dir)?;
        let paths = ReportPaths {
            samples: self.output_dir.join(format!("{}.samples.csv", stem)),
            roc: self.output_dir.join(format!("{}.roc.csv", stem)),
            groups: self.output_dir.join(format!("{}.groups.csv", stem)),
            summary: self.output_dir.join(format!("{}.summary.json", stem)),
        };
        let tables = [
            (&paths.samples, samples),
            (&paths.roc, roc),
            (&paths.groups, groups),
            (&paths.summary, summary.into_bytes()),
        ];

        // stage every table before any report file appears
        let mut staged = Vec::with_capacity(tables.len());
        for (path, bytes) in &tables {
            let partial = partial_path(path.as_path());
            if let Err(e) = fs::write(&partial, bytes) {
                discard(&staged);
                return Err(e.into());
            }
            staged.push(partial);
        }
        for (partial, (path, _)) in staged.iter().zip(&tables) {
            fs::rename(partial, path)?;
        }

        info!("Wrote report {} to {:?}", stem, self.output_dir);
        Ok(paths)
    }

    fn render_samples(&self, evaluation: &Evaluation) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["test_index", "label", "prob", "pred", "outcome"])?;
        for sample in &evaluation.samples {
            writer.write_record([
                sample.test_index.to_string(),
                sample.label.to_string(),
                sample.score.to_string(),
                sample.prediction.to_string(),
                sample.outcome.to_string(),
            ])?;
        }
        into_bytes(writer)
    }

    fn render_roc(&self, evaluation: &Evaluation) -> Result<Vec<u8>> {
        let roc = &evaluation.roc;
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["fpr", "tpr", "threshold"])?;
        for i in 0..roc.len() {
            writer.write_record([
                roc.fpr[i].to_string(),
                roc.tpr[i].to_string(),
                roc.thresholds[i].to_string(),
            ])?;
        }
        into_bytes(writer)
    }

    fn render_groups(&self, evaluation: &Evaluation) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["outcome", "test_index"])?;
        for (outcome, members) in evaluation.groups() {
            for index in members {
                writer.write_record([outcome.to_string(), index.to_string()])?;
            }
        }
        into_bytes(writer)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

fn discard(staged: &[PathBuf]) {
    for partial in staged {
        if let Err(e) = fs::remove_file(partial) {
            warn!("Could not remove {:?}: {}", partial, e);
        }
    }
}

fn into_bytes(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|e| crate::error::ExperimentError::Io(e.into_error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::evaluate;
    use tempfile::TempDir;

    #[test]
    fn test_report_files() {
        let dir = TempDir::new().unwrap();
        let evaluation = evaluate(&[0, 1, 2, 3], &[0, 0, 1, 1], &[0.1, 0.4, 0.35, 0.8]).unwrap();
        let paths = ReportWriter::new(dir.path()).write("bi_lstm", &evaluation).unwrap();

        let samples = fs::read_to_string(&paths.samples).unwrap();
        let lines: Vec<&str> = samples.lines().collect();
        assert_eq!(lines[0], "test_index,label,prob,pred,outcome");
        assert_eq!(lines.len(), 5);
        assert!(lines[3].ends_with(",0,FN"));

        let roc = fs::read_to_string(&paths.roc).unwrap();
        assert_eq!(roc.lines().count(), 6);

        let groups = fs::read_to_string(&paths.groups).unwrap();
        assert!(groups.lines().nth(1).unwrap().starts_with("TN,"));

        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.summary).unwrap()).unwrap();
        assert_eq!(summary["samples"], 4);
        assert_eq!(summary["auc"], 0.75);
        assert_eq!(summary["precision"], 1.0);
        assert_eq!(summary["counts"]["true_positive"], 1);
    }

    #[test]
    fn test_failed_write_leaves_no_report() {
        let dir = TempDir::new().unwrap();
        let evaluation = evaluate(&[0, 1, 2, 3], &[0, 0, 1, 1], &[0.1, 0.4, 0.35, 0.8]).unwrap();
        // a directory where the roc table is staged makes that write fail
        fs::create_dir(dir.path().join("logistic.roc.csv.partial")).unwrap();

        let result = ReportWriter::new(dir.path()).write("logistic", &evaluation);
        assert!(result.is_err());
        assert!(!dir.path().join("logistic.samples.csv").exists());
        assert!(!dir.path().join("logistic.samples.csv.partial").exists());
        assert!(!dir.path().join("logistic.summary.json").exists());
    }

    #[test]
    fn test_successful_write_removes_staging_files() {
        let dir = TempDir::new().unwrap();
        let evaluation = evaluate(&[0, 1, 2, 3], &[0, 0, 1, 1], &[0.1, 0.4, 0.35, 0.8]).unwrap();
        ReportWriter::new(dir.path()).write("logistic", &evaluation).unwrap();

        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".partial"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
