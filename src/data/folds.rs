//! Patient-level k-fold partitioning.
//!
//! Test folds are contiguous blocks of `floor(N / k)` patients taken in cohort
//! order. Trailing remainder patients never appear in a test fold but are part of
//! every training fold. Test folds concatenated in fold order reproduce the first
//! `k * floor(N / k)` patients in their original order, which is what makes pooled
//! predictions traceable back to cohort rows.

use crate::data::{Cohort, DataSet, SampleLayout};
use crate::error::{ExperimentError, Result};
use ndarray::{Array, Axis, RemoveAxis};
use std::ops::Range;
use tracing::debug;

/// Fold count used throughout the experiments
pub const DEFAULT_FOLDS: usize = 5;

/// Contiguous partition of a cohort's patients into test folds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldPlan {
    patients: usize,
    folds: usize,
    fold_size: usize,
}

/// One fold's train/test split in a concrete layout
#[derive(Debug, Clone)]
pub struct FoldSplit<L: SampleLayout> {
    pub fold: usize,
    pub train: DataSet<L>,
    pub test: DataSet<L>,
}

impl FoldPlan {
    /// Partition `patients` into `folds` test folds
    pub fn new(patients: usize, folds: usize) -> Result<Self> {
        if folds < 2 {
            return Err(ExperimentError::config(format!(
                "cross-validation needs at least 2 folds, got {}",
                folds
            )));
        }
        let fold_size = patients / folds;
        if fold_size == 0 {
            return Err(ExperimentError::TooFewPatients { patients, folds });
        }
        Ok(Self {
            patients,
            folds,
            fold_size,
        })
    }

    /// Standard five-fold plan
    pub fn five_fold(patients: usize) -> Result<Self> {
        Self::new(patients, DEFAULT_FOLDS)
    }

    pub fn patients(&self) -> usize {
        self.patients
    }

    pub fn folds(&self) -> usize {
        self.folds
    }

    pub fn fold_size(&self) -> usize {
        self.fold_size
    }

    /// Patients that land in some test fold
    pub fn evaluated_patients(&self) -> usize {
        self.fold_size * self.folds
    }

    /// Trailing patients never used for testing
    pub fn untested(&self) -> Range<usize> {
        self.evaluated_patients()..self.patients
    }

    /// Patient range held out by `fold`
    pub fn test_range(&self, fold: usize) -> Result<Range<usize>> {
        if fold >= self.folds {
            return Err(ExperimentError::config(format!(
                "fold {} out of range for a {}-fold plan",
                fold, self.folds
            )));
        }
        Ok(fold * self.fold_size..(fold + 1) * self.fold_size)
    }

    pub fn test_indices(&self, fold: usize) -> Result<Vec<usize>> {
        Ok(self.test_range(fold)?.collect())
    }

    /// Every patient outside the test fold, ascending
    pub fn train_indices(&self, fold: usize) -> Result<Vec<usize>> {
        let test = self.test_range(fold)?;
        Ok((0..self.patients).filter(|p| !test.contains(p)).collect())
    }

    /// Select the test rows of any array whose leading axis is the patient axis
    pub fn select_test<A: Clone, D: RemoveAxis>(
        &self,
        array: &Array<A, D>,
        fold: usize,
    ) -> Result<Array<A, D>> {
        self.check_leading(array.len_of(Axis(0)))?;
        Ok(array.select(Axis(0), &self.test_indices(fold)?))
    }

    /// Select the training rows of any array whose leading axis is the patient axis
    pub fn select_train<A: Clone, D: RemoveAxis>(
        &self,
        array: &Array<A, D>,
        fold: usize,
    ) -> Result<Array<A, D>> {
        self.check_leading(array.len_of(Axis(0)))?;
        Ok(array.select(Axis(0), &self.train_indices(fold)?))
    }

    /// Build the train/test split of one fold in layout `L`
    pub fn split_fold<L: SampleLayout>(&self, cohort: &Cohort, fold: usize) -> Result<FoldSplit<L>> {
        let train = L::from_patients(
            self.select_train(&cohort.features, fold)?,
            self.select_train(&cohort.labels, fold)?,
        )?;
        let test = L::from_patients(
            self.select_test(&cohort.features, fold)?,
            self.select_test(&cohort.labels, fold)?,
        )?;
        debug!(
            "Fold {}: {} train / {} test samples ({} layout)",
            fold,
            train.len(),
            test.len(),
            L::LAYOUT
        );
        Ok(FoldSplit { fold, train, test })
    }

    /// All folds in ascending order
    pub fn split<L: SampleLayout>(&self, cohort: &Cohort) -> Result<Vec<FoldSplit<L>>> {
        (0..self.folds).map(|fold| self.split_fold(cohort, fold)).collect()
    }

    /// Flat `(patient, visit)` row indices in pooled prediction order
    pub fn pooled_row_indices(&self, visits: usize) -> Vec<usize> {
        (0..self.evaluated_patients() * visits).collect()
    }

    fn check_leading(&self, len: usize) -> Result<()> {
        if len != self.patients {
            return Err(ExperimentError::shape(format!(
                "array has {} patients but the fold plan covers {}",
                len, self.patients
            )));
        }
        Ok(())
    }
}
