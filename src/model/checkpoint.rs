use crate::error::{ExperimentError, Result};
use crate::training::ExperimentSetup;
use burn::prelude::*;
use burn::record::CompactRecorder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Checkpoint metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Model variant name
    pub model: String,
    /// Fold the network was fitted on
    pub fold: usize,
    /// Epochs actually run
    pub epochs: usize,
    /// Mean training loss of the last epoch
    pub final_loss: Option<f64>,
    /// Network input width
    pub num_features: usize,
    /// Hyperparameters of the fit
    pub setup: ExperimentSetup,
}

/// Per-fold checkpoints of one model, `<dir>/<name>-fold<k>.mpk`
#[derive(Debug, Clone)]
pub struct FoldCheckpoints {
    checkpoint_dir: PathBuf,
    name: String,
}

impl FoldCheckpoints {
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P, name: impl Into<String>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.as_ref().to_path_buf(),
            name: name.into(),
        }
    }

    /// Weights file of `fold`
    pub fn path(&self, fold: usize) -> PathBuf {
        self.checkpoint_dir.join(format!("{}-fold{}.mpk", self.name, fold))
    }

    /// Save a fitted network and its metadata
    pub fn save<B: Backend, M: Module<B>>(&self, net: M, metadata: &CheckpointMetadata) -> Result<PathBuf> {
        fs::create_dir_all(&self.checkpoint_dir)?;
        let path = self.path(metadata.fold);
        net.save_file(path.clone(), &CompactRecorder::new())
            .map_err(|e| ExperimentError::model(format!("failed to save checkpoint {:?}: {:?}", path, e)))?;

        let metadata_json = serde_json::to_string_pretty(metadata)?;
        fs::write(path.with_extension("json"), metadata_json)?;

        info!("Saved checkpoint: {:?}", path);
        Ok(path)
    }

    /// Checkpoints present on disk, by fold
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut checkpoints = Vec::new();
        if !self.checkpoint_dir.exists() {
            return Ok(checkpoints);
        }
        let prefix = format!("{}-fold", self.name);
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "mpk").unwrap_or(false) {
                let fold = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.strip_prefix(&prefix))
                    .and_then(|s| s.parse::<usize>().ok());
                if let Some(fold) = fold {
                    checkpoints.push((fold, path));
                }
            }
        }
        checkpoints.sort_by_key(|(fold, _)| *fold);
        Ok(checkpoints)
    }
}

/// Load weights from `path` into a freshly initialised network
pub fn load_weights<B: Backend, M: Module<B>>(net: M, path: &Path, device: &B::Device) -> Result<M> {
    if !path.exists() {
        return Err(ExperimentError::model(format!("checkpoint {:?} does not exist", path)));
    }
    debug!("Loading checkpoint from {:?}", path);
    net.load_file(path.to_path_buf(), &CompactRecorder::new(), device)
        .map_err(|e| ExperimentError::model(format!("failed to load checkpoint {:?}: {:?}", path, e)))
}

/// Metadata written next to a checkpoint
pub fn load_metadata(path: &Path) -> Result<CheckpointMetadata> {
    let text = fs::read_to_string(path.with_extension("json"))?;
    Ok(serde_json::from_str(&text)?)
}
