pub mod folds;
pub mod loader;
pub mod resample;

use crate::error::{ExperimentError, Result};
use ndarray::{Array, Array1, Array2, Array3, Axis, Dimension, Ix2, Ix3, RemoveAxis};
use serde::{Deserialize, Serialize};

/// Number of visits kept per patient in the reference cohort
pub const DEFAULT_VISITS: usize = 5;

/// Number of per-visit features in the reference cohort
pub const DEFAULT_FEATURES: usize = 92;

/// Longitudinal cohort with a fixed number of visits per patient
#[derive(Debug, Clone, PartialEq)]
pub struct Cohort {
    /// Visit features `[patients, visits, features]`
    pub features: Array3<f32>,
    /// Binary outcome per visit `[patients, visits]`
    pub labels: Array2<u8>,
}

impl Cohort {
    /// Create a cohort, checking that labels line up with feature rows
    pub fn new(features: Array3<f32>, labels: Array2<u8>) -> Result<Self> {
        let (patients, visits, _) = features.dim();
        if labels.dim() != (patients, visits) {
            return Err(ExperimentError::shape(format!(
                "labels {:?} do not match features {:?}",
                labels.shape(),
                features.shape()
            )));
        }
        check_binary(labels.iter())?;
        Ok(Self { features, labels })
    }

    pub fn num_patients(&self) -> usize {
        self.features.len_of(Axis(0))
    }

    pub fn num_visits(&self) -> usize {
        self.features.len_of(Axis(1))
    }

    pub fn num_features(&self) -> usize {
        self.features.len_of(Axis(2))
    }

    /// Count of positive-outcome visits
    pub fn positive_count(&self) -> usize {
        self.labels.iter().filter(|&&l| l == 1).count()
    }
}

/// Sample layout a model consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    /// One row per visit, `[patients * visits, features]`
    Flat,
    /// One sequence per patient, `[patients, visits, features]`
    Sequence,
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layout::Flat => write!(f, "flat"),
            Layout::Sequence => write!(f, "sequence"),
        }
    }
}

/// Features and labels handed to a model.
///
/// Labels have the shape of the features without the trailing feature axis, so a
/// flat set pairs `[rows, F]` with `[rows]` and a sequence set pairs `[n, V, F]`
/// with `[n, V]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSet<D: Dimension> {
    pub features: Array<f32, D>,
    pub labels: Array<u8, D::Smaller>,
}

pub type FlatDataSet = DataSet<Ix2>;
pub type SequenceDataSet = DataSet<Ix3>;

impl<D: Dimension> DataSet<D> {
    /// Create a data set, checking label alignment
    pub fn new(features: Array<f32, D>, labels: Array<u8, D::Smaller>) -> Result<Self> {
        let feature_shape = features.shape();
        let leading = &feature_shape[..feature_shape.len() - 1];
        if leading != labels.shape() {
            return Err(ExperimentError::shape(format!(
                "labels {:?} do not align with features {:?}",
                labels.shape(),
                feature_shape
            )));
        }
        check_binary(labels.iter())?;
        Ok(Self { features, labels })
    }

    /// Number of samples along the leading axis
    pub fn len(&self) -> usize {
        self.features.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of features per visit
    pub fn num_features(&self) -> usize {
        let ndim = self.features.ndim();
        self.features.len_of(Axis(ndim - 1))
    }

    pub fn positive_count(&self) -> usize {
        self.labels.iter().filter(|&&l| l == 1).count()
    }

    pub fn negative_count(&self) -> usize {
        self.labels.iter().filter(|&&l| l == 0).count()
    }
}

/// Reshape behaviour that distinguishes the flat and sequence layouts.
///
/// Partitioning is identical for both; only the way patient blocks become model
/// input differs.
pub trait SampleLayout: RemoveAxis {
    const LAYOUT: Layout;

    /// Shape a block of whole patients into this layout
    fn from_patients(features: Array3<f32>, labels: Array2<u8>) -> Result<DataSet<Self>>;

    /// Visits covered by one sample along the leading axis
    fn visits_per_sample(data: &DataSet<Self>) -> usize;

    /// Flatten to one row per visit
    fn to_rows(data: &DataSet<Self>) -> Result<(Array2<f32>, Array1<u8>)>;

    /// Rebuild from visit rows; `rows` must be a multiple of `visits`
    fn from_rows(features: Array2<f32>, labels: Array1<u8>, visits: usize) -> Result<DataSet<Self>>;

    /// Sequence view fed to the networks, `[samples, steps, features]`
    fn to_steps(features: &Array<f32, Self>) -> Array3<f32>;

    /// Per-step scores `[samples, steps]` back in label shape
    fn scores_from_steps(scores: Array2<f32>) -> Result<Array<f32, <Self as Dimension>::Smaller>>;
}

impl SampleLayout for Ix2 {
    const LAYOUT: Layout = Layout::Flat;

    fn from_patients(features: Array3<f32>, labels: Array2<u8>) -> Result<DataSet<Ix2>> {
        let (patients, visits, num_features) = features.dim();
        let rows = flatten_rows(&features, patients * visits, num_features)?;
        let labels = Array1::from_iter(labels.iter().copied());
        DataSet::new(rows, labels)
    }

    fn visits_per_sample(_data: &DataSet<Ix2>) -> usize {
        1
    }

    fn to_rows(data: &DataSet<Ix2>) -> Result<(Array2<f32>, Array1<u8>)> {
        Ok((data.features.clone(), data.labels.clone()))
    }

    fn from_rows(features: Array2<f32>, labels: Array1<u8>, _visits: usize) -> Result<DataSet<Ix2>> {
        DataSet::new(features, labels)
    }

    fn to_steps(features: &Array2<f32>) -> Array3<f32> {
        let (rows, num_features) = features.dim();
        Array3::from_shape_fn((rows, 1, num_features), |(r, _, f)| features[[r, f]])
    }

    fn scores_from_steps(scores: Array2<f32>) -> Result<Array1<f32>> {
        if scores.ncols() != 1 {
            return Err(ExperimentError::shape(format!(
                "flat scores must have one step, got {}",
                scores.ncols()
            )));
        }
        Ok(scores.column(0).to_owned())
    }
}

impl SampleLayout for Ix3 {
    const LAYOUT: Layout = Layout::Sequence;

    fn from_patients(features: Array3<f32>, labels: Array2<u8>) -> Result<DataSet<Ix3>> {
        DataSet::new(features, labels)
    }

    fn visits_per_sample(data: &DataSet<Ix3>) -> usize {
        data.features.len_of(Axis(1))
    }

    fn to_rows(data: &DataSet<Ix3>) -> Result<(Array2<f32>, Array1<u8>)> {
        let (n, visits, num_features) = data.features.dim();
        if data.labels.dim() != (n, visits) {
            return Err(ExperimentError::shape(format!(
                "labels {:?} do not match {} patients with {} visits",
                data.labels.dim(),
                n,
                visits
            )));
        }
        let rows = flatten_rows(&data.features, n * visits, num_features)?;
        let labels = Array1::from_iter(data.labels.iter().copied());
        Ok((rows, labels))
    }

    fn from_rows(features: Array2<f32>, labels: Array1<u8>, visits: usize) -> Result<DataSet<Ix3>> {
        let (rows, num_features) = features.dim();
        if visits == 0 || rows % visits != 0 || labels.len() != rows {
            return Err(ExperimentError::shape(format!(
                "{} rows ({} labels) cannot be regrouped into sequences of {} visits",
                rows,
                labels.len(),
                visits
            )));
        }
        let n = rows / visits;
        let features = Array3::from_shape_vec((n, visits, num_features), features.iter().copied().collect())
            .map_err(|e| ExperimentError::shape(e.to_string()))?;
        let labels = Array2::from_shape_vec((n, visits), labels.iter().copied().collect())
            .map_err(|e| ExperimentError::shape(e.to_string()))?;
        DataSet::new(features, labels)
    }

    fn to_steps(features: &Array3<f32>) -> Array3<f32> {
        features.clone()
    }

    fn scores_from_steps(scores: Array2<f32>) -> Result<Array2<f32>> {
        Ok(scores)
    }
}

fn flatten_rows(features: &Array3<f32>, rows: usize, num_features: usize) -> Result<Array2<f32>> {
    Array2::from_shape_vec((rows, num_features), features.iter().copied().collect())
        .map_err(|e| ExperimentError::shape(e.to_string()))
}

fn check_binary<'a>(mut labels: impl Iterator<Item = &'a u8>) -> Result<()> {
    match labels.find(|&&l| l > 1) {
        Some(l) => Err(ExperimentError::shape(format!("label {} is not binary", l))),
        None => Ok(()),
    }
}
