//! Typed hand-off between staging stages.
//!
//! Every stage names the artifacts it reads and writes. Running a stage before
//! its inputs exist fails with `MissingArtifact`. Each artifact carries a
//! provenance record (producing stage, its settings, the revisions of its
//! inputs); reading an artifact whose inputs were re-produced since fails with
//! `StaleArtifact`. Arrays are stored with bincode, so a reload is bit-identical.

use crate::error::{ExperimentError, Result};
use crate::staging::kmeans::KMeansConfig;
use crate::staging::{
    assign_from_bins, assign_stages, cluster_weights, compute_breakpoints, stage_outcomes, BreakpointTable,
    StageReport,
};
use ndarray::{Array2, Array3, Axis};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name and value type of one stored artifact
#[derive(Debug, Clone)]
pub struct ArtifactKey<T> {
    name: Cow<'static, str>,
    _value: PhantomData<fn() -> T>,
}

impl<T> ArtifactKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            _value: PhantomData,
        }
    }

    pub fn named(name: String) -> Self {
        Self {
            name: Cow::Owned(name),
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Attention weights of one experiment run `[patients, visits, features]`
pub fn attention_weights(run: &str) -> ArtifactKey<Array3<f32>> {
    ArtifactKey::named(format!("attention_weights_{}", run))
}

pub const AVERAGE_WEIGHTS: ArtifactKey<Array3<f32>> = ArtifactKey::new("average_weight");
/// Outcome label per evaluated visit `[patients, visits]`
pub const OUTCOME_LABELS: ArtifactKey<Array2<u8>> = ArtifactKey::new("outcome_labels");
pub const BREAKPOINTS: ArtifactKey<Array2<f32>> = ArtifactKey::new("breakpoints");
pub const CLUSTER_LABELS: ArtifactKey<Array3<u8>> = ArtifactKey::new("cluster_labels");
pub const CLUSTER_CENTROIDS: ArtifactKey<Array2<f32>> = ArtifactKey::new("cluster_centroids");
pub const CLUSTER_BREAKPOINTS: ArtifactKey<Array2<f32>> = ArtifactKey::new("cluster_breakpoints");
pub const STAGES: ArtifactKey<Array2<u8>> = ArtifactKey::new("stages");
/// Summed weight per stage bin `[patients, visits, K]`
pub const STAGE_SCORES: ArtifactKey<Array3<f32>> = ArtifactKey::new("stage_scores");
pub const STAGE_REPORT: ArtifactKey<StageReport> = ArtifactKey::new("stage_report");

/// Origin of one stored artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Stage that wrote it, `external` when saved outside a stage
    pub stage: String,
    #[serde(default)]
    pub settings: Value,
    /// Bumped on every save
    pub revision: u64,
    /// Revision of every input at the time it was produced
    #[serde(default)]
    pub inputs: BTreeMap<String, u64>,
}

const EXTERNAL: &str = "external";

/// Directory of bincode artifacts
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path<T>(&self, key: &ArtifactKey<T>) -> PathBuf {
        self.path_of(key.name())
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.bin", name))
    }

    fn provenance_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.provenance.json", name))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    pub fn contains<T>(&self, key: &ArtifactKey<T>) -> bool {
        self.contains_name(key.name())
    }

    /// Write `value`, replacing any earlier version only once fully written
    pub fn save<T: Serialize>(&self, key: &ArtifactKey<T>, value: &T) -> Result<PathBuf> {
        let path = self.path(key);
        let partial = path.with_extension("bin.partial");
        {
            let mut writer = BufWriter::new(File::create(&partial)?);
            bincode::serialize_into(&mut writer, value)?;
            writer.flush()?;
        }
        fs::rename(&partial, &path)?;
        let revision = self.revision(key.name())? + 1;
        self.record(
            key.name(),
            &Provenance {
                stage: EXTERNAL.to_string(),
                settings: Value::Null,
                revision,
                inputs: BTreeMap::new(),
            },
        )?;
        debug!("Saved artifact {} (revision {}) to {:?}", key.name(), revision, path);
        Ok(path)
    }

    /// Provenance of `name`, if it was saved through this store
    pub fn provenance(&self, name: &str) -> Result<Option<Provenance>> {
        let path = self.provenance_path(name);
        if !path.is_file() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&path)?);
        Ok(Some(serde_json::from_reader(reader)?))
    }

    /// Current revision of `name`; 0 when absent or saved without provenance
    pub fn revision(&self, name: &str) -> Result<u64> {
        Ok(self.provenance(name)?.map(|p| p.revision).unwrap_or(0))
    }

    fn record(&self, name: &str, provenance: &Provenance) -> Result<()> {
        let path = self.provenance_path(name);
        let partial = path.with_extension("json.partial");
        fs::write(&partial, serde_json::to_vec_pretty(provenance)?)?;
        fs::rename(&partial, &path)?;
        Ok(())
    }

    /// Fail when `artifact` was derived from an input that has been re-produced since
    fn check_fresh(&self, artifact: &str, stage: &str) -> Result<()> {
        let Some(provenance) = self.provenance(artifact)? else {
            return Ok(());
        };
        for (input, recorded) in &provenance.inputs {
            if self.revision(input)? != *recorded {
                return Err(ExperimentError::StaleArtifact {
                    artifact: artifact.to_string(),
                    input: input.clone(),
                    stage: stage.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn load<T: DeserializeOwned>(&self, key: &ArtifactKey<T>) -> Result<T> {
        let path = self.path(key);
        let reader = BufReader::new(File::open(&path)?);
        Ok(bincode::deserialize_from(reader)?)
    }
}

/// One step of the staging pipeline
pub trait Stage {
    fn name(&self) -> &'static str;

    /// Artifacts read by `run`
    fn requires(&self) -> Vec<String>;

    /// Artifacts written by `run`
    fn produces(&self) -> Vec<String>;

    /// Settings recorded in the provenance of every produced artifact
    fn settings(&self) -> Value {
        Value::Null
    }

    fn run(&self, store: &ArtifactStore) -> Result<()>;
}

/// Run `stage` after checking that its inputs exist and are current, then
/// record the provenance of what it produced
pub fn run_stage(stage: &dyn Stage, store: &ArtifactStore) -> Result<()> {
    let mut inputs = BTreeMap::new();
    for artifact in stage.requires() {
        if !store.contains_name(&artifact) {
            return Err(ExperimentError::MissingArtifact {
                artifact,
                stage: stage.name().to_string(),
            });
        }
        store.check_fresh(&artifact, stage.name())?;
        let revision = store.revision(&artifact)?;
        inputs.insert(artifact, revision);
    }

    let settings = stage.settings();
    for artifact in stage.produces() {
        if let Some(previous) = store.provenance(&artifact)? {
            if previous.stage == stage.name() && previous.settings != settings {
                warn!(
                    "Replacing {} built with settings {} by one built with {}",
                    artifact, previous.settings, settings
                );
            }
        }
    }

    info!("Running stage {}", stage.name());
    stage.run(store)?;
    for artifact in stage.produces() {
        let revision = store.revision(&artifact)?;
        store.record(
            &artifact,
            &Provenance {
                stage: stage.name().to_string(),
                settings: settings.clone(),
                revision,
                inputs: inputs.clone(),
            },
        )?;
    }
    info!("Stage {} produced {}", stage.name(), stage.produces().join(", "));
    Ok(())
}

/// Element-wise mean of several runs' attention tensors
pub fn average_weights(runs: &[Array3<f32>]) -> Result<Array3<f32>> {
    let first = runs
        .first()
        .ok_or_else(|| ExperimentError::config("averaging needs at least one run"))?;
    let mut sum = Array3::<f64>::zeros(first.dim());
    for (i, run) in runs.iter().enumerate() {
        if run.dim() != first.dim() {
            return Err(ExperimentError::shape(format!(
                "run {} has shape {:?}, expected {:?}",
                i,
                run.shape(),
                first.shape()
            )));
        }
        sum.zip_mut_with(run, |s, &w| *s += w as f64);
    }
    let n = runs.len() as f64;
    Ok(sum.mapv(|s| (s / n) as f32))
}

/// Average the attention weights of several runs
pub struct AverageWeights {
    pub runs: Vec<String>,
}

impl Stage for AverageWeights {
    fn name(&self) -> &'static str {
        "average_weights"
    }

    fn requires(&self) -> Vec<String> {
        self.runs.iter().map(|run| attention_weights(run).name().to_string()).collect()
    }

    fn produces(&self) -> Vec<String> {
        vec![AVERAGE_WEIGHTS.name().to_string()]
    }

    fn settings(&self) -> Value {
        json!({ "runs": self.runs })
    }

    fn run(&self, store: &ArtifactStore) -> Result<()> {
        let runs = self
            .runs
            .iter()
            .map(|run| store.load(&attention_weights(run)))
            .collect::<Result<Vec<_>>>()?;
        let average = average_weights(&runs)?;
        store.save(&AVERAGE_WEIGHTS, &average)?;
        Ok(())
    }
}

/// Natural-breaks boundaries per feature
pub struct ComputeBreakpoints {
    pub classes: usize,
}

impl Stage for ComputeBreakpoints {
    fn name(&self) -> &'static str {
        "compute_breakpoints"
    }

    fn requires(&self) -> Vec<String> {
        vec![AVERAGE_WEIGHTS.name().to_string()]
    }

    fn produces(&self) -> Vec<String> {
        vec![BREAKPOINTS.name().to_string()]
    }

    fn settings(&self) -> Value {
        json!({ "classes": self.classes })
    }

    fn run(&self, store: &ArtifactStore) -> Result<()> {
        let weights = store.load(&AVERAGE_WEIGHTS)?;
        let table = compute_breakpoints(&weights, self.classes)?;
        store.save(&BREAKPOINTS, table.breaks())?;
        Ok(())
    }
}

/// Per-feature k-means labels of the averaged weights
pub struct ClusterWeights {
    pub config: KMeansConfig,
}

impl Stage for ClusterWeights {
    fn name(&self) -> &'static str {
        "cluster_weights"
    }

    fn requires(&self) -> Vec<String> {
        vec![AVERAGE_WEIGHTS.name().to_string()]
    }

    fn produces(&self) -> Vec<String> {
        vec![
            CLUSTER_LABELS.name().to_string(),
            CLUSTER_CENTROIDS.name().to_string(),
            CLUSTER_BREAKPOINTS.name().to_string(),
        ]
    }

    fn settings(&self) -> Value {
        json!({
            "clusters": self.config.clusters,
            "max_iter": self.config.max_iter,
            "tol": self.config.tol,
            "seed": self.config.seed,
        })
    }

    fn run(&self, store: &ArtifactStore) -> Result<()> {
        let weights = store.load(&AVERAGE_WEIGHTS)?;
        let clusters = cluster_weights(&weights, &self.config)?;
        store.save(&CLUSTER_LABELS, &clusters.labels)?;
        store.save(&CLUSTER_CENTROIDS, &clusters.centroids)?;
        store.save(&CLUSTER_BREAKPOINTS, clusters.breakpoints.breaks())?;
        Ok(())
    }
}

/// Where per-weight bins come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSource {
    /// Natural-breaks table
    Breakpoints,
    /// k-means cluster labels
    Clusters,
}

/// Dominant-bin stage of every visit
pub struct AssignStages {
    pub source: StageSource,
}

impl Stage for AssignStages {
    fn name(&self) -> &'static str {
        "assign_stages"
    }

    fn requires(&self) -> Vec<String> {
        let mut required = vec![AVERAGE_WEIGHTS.name().to_string()];
        match self.source {
            StageSource::Breakpoints => required.push(BREAKPOINTS.name().to_string()),
            StageSource::Clusters => {
                required.push(CLUSTER_LABELS.name().to_string());
                required.push(CLUSTER_CENTROIDS.name().to_string());
            }
        }
        required
    }

    fn produces(&self) -> Vec<String> {
        vec![STAGES.name().to_string(), STAGE_SCORES.name().to_string()]
    }

    fn settings(&self) -> Value {
        let source = match self.source {
            StageSource::Breakpoints => "breakpoints",
            StageSource::Clusters => "clusters",
        };
        json!({ "source": source })
    }

    fn run(&self, store: &ArtifactStore) -> Result<()> {
        let weights = store.load(&AVERAGE_WEIGHTS)?;
        let assignment = match self.source {
            StageSource::Breakpoints => {
                let table = BreakpointTable::new(store.load(&BREAKPOINTS)?)?;
                assign_stages(&weights, &table)?
            }
            StageSource::Clusters => {
                let labels = store.load(&CLUSTER_LABELS)?;
                let clusters = store.load(&CLUSTER_CENTROIDS)?.len_of(Axis(1));
                assign_from_bins(&weights, &labels, clusters)?
            }
        };
        store.save(&STAGES, &assignment.stages)?;
        store.save(&STAGE_SCORES, &assignment.scores)?;
        Ok(())
    }
}

/// Stage-conditional event rates and weight profiles
pub struct StageOutcomes;

impl StageOutcomes {
    /// Human-readable copies of the report next to the artifacts
    pub fn report_paths(store: &ArtifactStore) -> (PathBuf, PathBuf) {
        (
            store.root().join("stage_outcomes.json"),
            store.root().join("stage_weights.csv"),
        )
    }
}

impl Stage for StageOutcomes {
    fn name(&self) -> &'static str {
        "stage_outcomes"
    }

    fn requires(&self) -> Vec<String> {
        vec![
            STAGES.name().to_string(),
            STAGE_SCORES.name().to_string(),
            AVERAGE_WEIGHTS.name().to_string(),
            OUTCOME_LABELS.name().to_string(),
        ]
    }

    fn produces(&self) -> Vec<String> {
        vec![STAGE_REPORT.name().to_string()]
    }

    fn run(&self, store: &ArtifactStore) -> Result<()> {
        let stages = store.load(&STAGES)?;
        let classes = store.load(&STAGE_SCORES)?.len_of(Axis(2));
        let weights = store.load(&AVERAGE_WEIGHTS)?;
        let labels = store.load(&OUTCOME_LABELS)?;
        let report = stage_outcomes(&stages, &labels, &weights, classes)?;

        let json = serde_json::to_string_pretty(&report)?;
        let profiles = render_profiles(&report, weights.len_of(Axis(2)))?;
        let (json_path, csv_path) = Self::report_paths(store);
        store.save(&STAGE_REPORT, &report)?;
        fs::write(json_path, json)?;
        fs::write(csv_path, profiles)?;
        Ok(())
    }
}

/// One row per feature, one column per stage; empty cells for empty stages
fn render_profiles(report: &StageReport, num_features: usize) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(report.stages.iter().map(|s| format!("stage{}", s.stage)))?;
    for feature in 0..num_features {
        writer.write_record(report.stages.iter().map(|s| {
            s.profile
                .as_ref()
                .map(|p| p[feature].to_string())
                .unwrap_or_default()
        }))?;
    }
    writer
        .into_inner()
        .map_err(|e| ExperimentError::Io(e.into_error()))
}

/// Ordered list of stages run against one store
pub struct StagingPipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl StagingPipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn then(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Average, natural breaks, stages, outcomes
    pub fn breakpoint_staging(runs: Vec<String>, classes: usize) -> Self {
        Self::new()
            .then(AverageWeights { runs })
            .then(ComputeBreakpoints { classes })
            .then(AssignStages {
                source: StageSource::Breakpoints,
            })
            .then(StageOutcomes)
    }

    /// Average, k-means labels, stages, outcomes
    pub fn cluster_staging(runs: Vec<String>, config: KMeansConfig) -> Self {
        Self::new()
            .then(AverageWeights { runs })
            .then(ClusterWeights { config })
            .then(AssignStages {
                source: StageSource::Clusters,
            })
            .then(StageOutcomes)
    }

    pub fn run(&self, store: &ArtifactStore) -> Result<()> {
        for stage in &self.stages {
            run_stage(stage.as_ref(), store)?;
        }
        Ok(())
    }
}

impl Default for StagingPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::staging::StageRate;
    use ndarray::array;
    use tempfile::TempDir;

    fn weights(offset: f32) -> Array3<f32> {
        Array3::from_shape_fn((6, 5, 3), |(p, v, f)| ((p * 7 + v * 3 + f) % 11) as f32 * 0.05 + offset)
    }

    #[test]
    fn test_round_trip_is_bit_identical() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let mut original = weights(0.0);
        original[[0, 0, 0]] = -0.0;
        original[[1, 1, 1]] = f32::MIN_POSITIVE / 3.0;
        original[[2, 2, 2]] = f32::NAN;

        store.save(&AVERAGE_WEIGHTS, &original).unwrap();
        let loaded = store.load(&AVERAGE_WEIGHTS).unwrap();
        assert_eq!(loaded.dim(), original.dim());
        assert!(loaded.iter().zip(original.iter()).all(|(a, b)| a.to_bits() == b.to_bits()));
    }

    #[test]
    fn test_average_weights() {
        let average = average_weights(&[weights(0.0), weights(1.0)]).unwrap();
        let expected = weights(0.5);
        assert_eq!(average.dim(), expected.dim());
        for (a, b) in average.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
        assert!(average_weights(&[weights(0.0), Array3::zeros((2, 5, 3))]).is_err());
        assert!(average_weights(&[]).is_err());
    }

    #[test]
    fn test_stage_before_producer_fails() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let err = run_stage(&ComputeBreakpoints { classes: 3 }, &store).unwrap_err();
        match err {
            ExperimentError::MissingArtifact { artifact, stage } => {
                assert_eq!(artifact, "average_weight");
                assert_eq!(stage, "compute_breakpoints");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!store.contains(&BREAKPOINTS));
    }

    #[test]
    fn test_breakpoint_pipeline_end_to_end() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        store.save(&attention_weights("a"), &weights(0.0)).unwrap();
        store.save(&attention_weights("b"), &weights(0.1)).unwrap();
        let labels = Array2::from_shape_fn((6, 5), |(p, v)| ((p + v) % 4 == 0) as u8);
        store.save(&OUTCOME_LABELS, &labels).unwrap();

        StagingPipeline::breakpoint_staging(vec!["a".into(), "b".into()], 3)
            .run(&store)
            .unwrap();

        let stages = store.load(&STAGES).unwrap();
        assert_eq!(stages.dim(), (6, 5));
        assert!(stages.iter().all(|&s| s < 3));
        let report = store.load(&STAGE_REPORT).unwrap();
        assert_eq!(report.stages.len(), 3);
        let counted: usize = report.stages.iter().map(|s| s.samples).sum();
        assert_eq!(counted, 30);

        let (json_path, csv_path) = StageOutcomes::report_paths(&store);
        assert!(json_path.exists());
        let csv = fs::read_to_string(csv_path).unwrap();
        assert_eq!(csv.lines().next().unwrap(), "stage0,stage1,stage2");
        assert_eq!(csv.lines().count(), 4);
    }

    #[test]
    fn test_cluster_staging_uses_cluster_count() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        store.save(&AVERAGE_WEIGHTS, &weights(0.0)).unwrap();
        store
            .save(&OUTCOME_LABELS, &Array2::from_elem((6, 5), 1u8))
            .unwrap();

        run_stage(&ClusterWeights { config: KMeansConfig::default() }, &store).unwrap();
        run_stage(&AssignStages { source: StageSource::Clusters }, &store).unwrap();
        run_stage(&StageOutcomes, &store).unwrap();

        assert_eq!(store.load(&STAGE_SCORES).unwrap().dim(), (6, 5, 3));
        let report = store.load(&STAGE_REPORT).unwrap();
        for stage in &report.stages {
            if stage.samples > 0 {
                assert_eq!(stage.rate, StageRate::Rate(1.0));
            }
        }
    }

    #[test]
    fn test_assign_needs_breakpoints() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        store.save(&AVERAGE_WEIGHTS, &array![[[0.1f32, 0.2]]]).unwrap();
        let err = run_stage(&AssignStages { source: StageSource::Breakpoints }, &store).unwrap_err();
        assert!(matches!(err, ExperimentError::MissingArtifact { .. }));
    }

    fn seeded_store(dir: &TempDir) -> ArtifactStore {
        let store = ArtifactStore::open(dir.path()).unwrap();
        store.save(&AVERAGE_WEIGHTS, &weights(0.0)).unwrap();
        let labels = Array2::from_shape_fn((6, 5), |(p, v)| ((p + v) % 3 == 0) as u8);
        store.save(&OUTCOME_LABELS, &labels).unwrap();
        store
    }

    #[test]
    fn test_stage_records_provenance() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        run_stage(&ComputeBreakpoints { classes: 3 }, &store).unwrap();

        let provenance = store.provenance(BREAKPOINTS.name()).unwrap().unwrap();
        assert_eq!(provenance.stage, "compute_breakpoints");
        assert_eq!(provenance.settings["classes"], 3);
        assert_eq!(provenance.revision, 1);
        assert_eq!(provenance.inputs.get("average_weight"), Some(&1));

        run_stage(&ComputeBreakpoints { classes: 4 }, &store).unwrap();
        let provenance = store.provenance(BREAKPOINTS.name()).unwrap().unwrap();
        assert_eq!(provenance.settings["classes"], 4);
        assert_eq!(provenance.revision, 2);
    }

    #[test]
    fn test_recomputed_breakpoints_invalidate_stages() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let assign = AssignStages {
            source: StageSource::Breakpoints,
        };
        run_stage(&ComputeBreakpoints { classes: 3 }, &store).unwrap();
        run_stage(&assign, &store).unwrap();

        // stages still reflect three classes
        run_stage(&ComputeBreakpoints { classes: 4 }, &store).unwrap();
        let err = run_stage(&StageOutcomes, &store).unwrap_err();
        match err {
            ExperimentError::StaleArtifact { artifact, input, stage } => {
                assert_eq!(artifact, "stages");
                assert_eq!(input, "breakpoints");
                assert_eq!(stage, "stage_outcomes");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!store.contains(&STAGE_REPORT));

        run_stage(&assign, &store).unwrap();
        run_stage(&StageOutcomes, &store).unwrap();
        assert_eq!(store.load(&STAGE_REPORT).unwrap().stages.len(), 4);
    }

    #[test]
    fn test_replaced_external_input_invalidates_average() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        store.save(&attention_weights("a"), &weights(0.0)).unwrap();
        run_stage(&AverageWeights { runs: vec!["a".into()] }, &store).unwrap();

        store.save(&attention_weights("a"), &weights(0.2)).unwrap();
        let err = run_stage(&ComputeBreakpoints { classes: 3 }, &store).unwrap_err();
        assert!(matches!(err, ExperimentError::StaleArtifact { .. }));
    }
}
