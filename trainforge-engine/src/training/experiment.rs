//! Run directory layout and run status.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lifecycle status of a run or sweep trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Pending,
    Running,
    Completed,
    /// Ended early through a controlled stop.
    Stopped,
    Failed,
}

/// File name of the default final weights.
pub const DEFAULT_WEIGHTS: &str = "weight.ckpt";

/// Where a run writes.
///
/// Runs are isolated by version: `<model_dir>/<model_version>/<dataset_version>`
/// holds checkpoints and logs, the matching path under `cache_dir` holds
/// scratch output such as visualisations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub work_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl RunLayout {
    pub fn new(model_dir: &Path, cache_dir: &Path, model_version: &str, dataset_version: &str) -> Self {
        Self {
            work_dir: model_dir.join(model_version).join(dataset_version),
            cache_dir: cache_dir.join(model_version).join(dataset_version),
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.work_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }

    pub fn default_weights(&self) -> PathBuf {
        self.work_dir.join(DEFAULT_WEIGHTS)
    }

    pub fn environment_file(&self) -> PathBuf {
        self.work_dir.join("environment.json")
    }

    pub fn vis_dir(&self) -> PathBuf {
        self.cache_dir.join("vis")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = RunLayout::new(Path::new("model_data"), Path::new("cache_data"), "resnet", "cifar/lr=0.1");
        assert_eq!(layout.work_dir, PathBuf::from("model_data/resnet/cifar/lr=0.1"));
        assert_eq!(layout.default_weights(), PathBuf::from("model_data/resnet/cifar/lr=0.1/weight.ckpt"));
        assert_eq!(layout.vis_dir(), PathBuf::from("cache_data/resnet/cifar/lr=0.1/vis"));
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&TrainingStatus::Stopped).unwrap();
        assert_eq!(json, "\"stopped\"");
    }
}
