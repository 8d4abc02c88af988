//! Runner and fit configuration.

use crate::data::LoaderOptions;
use crate::error::Result;
use crate::eval::pipeline::PredictOptions;
use crate::training::callbacks::EarlyStopConfig;
use crate::training::checkpoint::SaveKind;
use crate::training::counters::crosses_boundary;
use crate::training::ema::EmaConfig;
use crate::training::optim::OptimizerConfig;
use crate::training::scaler::ScalerConfig;
use crate::training::scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything a [`crate::training::TrainingRunner`] is constructed from.
///
/// Optional components are switched on by the `use_*` flags and resolved once,
/// at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Tracker project name.
    pub project: String,
    pub model_version: String,
    pub dataset_version: String,
    pub model_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub seed: u64,
    pub loader: LoaderOptions,
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerConfig,
    pub scaler: ScalerConfig,
    pub ema: EmaConfig,
    pub early_stop: EarlyStopConfig,
    pub use_scaler: bool,
    pub use_ema: bool,
    pub use_early_stop: bool,
    /// Global gradient-norm clip applied before each optimizer step.
    pub max_grad_norm: Option<f64>,
    /// Capacity of the numbered snapshot series; 0 keeps only `last`/`best`.
    pub max_numbered: usize,
    /// Write `tracking.jsonl` into the work dir.
    pub track: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            project: "trainforge".to_string(),
            model_version: "model".to_string(),
            dataset_version: "dataset".to_string(),
            model_dir: PathBuf::from("model_data"),
            cache_dir: PathBuf::from("cache_data"),
            seed: 42,
            loader: LoaderOptions::default(),
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            scaler: ScalerConfig::default(),
            ema: EmaConfig::default(),
            early_stop: EarlyStopConfig::default(),
            use_scaler: false,
            use_ema: false,
            use_early_stop: true,
            max_grad_norm: Some(10.0),
            max_numbered: 0,
            track: true,
        }
    }
}

impl RunnerConfig {
    /// Defaults, then `<workspace>/trainforge.toml`, then `TRAINFORGE_*`
    /// environment variables.
    pub fn load(workspace: Option<&Path>) -> Result<Self> {
        Ok(trainforge_core::load_layered(workspace, None)?)
    }
}

/// Unit of the checkpoint cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Every `period` samples.
    Step,
    /// Every `period` epochs.
    #[default]
    Epoch,
}

impl Cadence {
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Step => "step",
            Self::Epoch => "epoch",
        }
    }
}

/// When the checkpoint-and-metric routine runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckSchedule {
    pub cadence: Cadence,
    /// Epochs, or samples, between checkpoints. 0 checks at every
    /// opportunity: after every batch, or after every epoch.
    pub period: u64,
    /// Run the metric on every n-th checkpoint; `None` never does.
    pub metric_every: Option<u64>,
}

impl Default for CheckSchedule {
    fn default() -> Self {
        Self {
            cadence: Cadence::Epoch,
            period: 1,
            metric_every: Some(1),
        }
    }
}

impl CheckSchedule {
    /// Step cadence: the batch that brought the sample count to `seen`
    /// crossed a multiple of `period`.
    pub fn step_due(&self, seen: u64, batch_len: u64) -> bool {
        self.cadence == Cadence::Step && crosses_boundary(seen, batch_len, self.period)
    }

    /// Epoch cadence: `epoch` completed epochs land on the period.
    pub fn epoch_due(&self, epoch: u64) -> bool {
        self.cadence == Cadence::Epoch && (self.period == 0 || epoch % self.period == 0)
    }

    pub fn metric_due(&self, check_count: u64) -> bool {
        matches!(self.metric_every, Some(every) if every > 0 && check_count % every == 0)
    }
}

/// Options of one `fit` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub max_epoch: u64,
    /// Overrides the configured loader batch size.
    pub batch_size: Option<usize>,
    /// Accumulation window in samples; `None` steps on every batch.
    pub accumulate: Option<u64>,
    pub check: CheckSchedule,
    /// Build a validation loader and score at metric checkpoints.
    pub validate: bool,
    pub predict: PredictOptions,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_epoch: 100,
            batch_size: None,
            accumulate: None,
            check: CheckSchedule::default(),
            validate: true,
            predict: PredictOptions::default(),
        }
    }
}

/// Options of the one-call lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub fit: FitOptions,
    /// Format of the final weights file.
    pub save_kind: SaveKind,
    /// Score the final model on the validation set.
    pub final_metric: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            fit: FitOptions::default(),
            save_kind: SaveKind::default(),
            final_metric: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optim::OptimizerKind;
    use crate::training::scheduler::{LrLambda, SchedulerMode};
    use figment::Jail;

    #[test]
    fn test_metric_due() {
        let schedule = CheckSchedule {
            metric_every: Some(3),
            ..CheckSchedule::default()
        };
        assert!(!schedule.metric_due(1));
        assert!(schedule.metric_due(3));
        assert!(schedule.metric_due(6));

        let never = CheckSchedule {
            metric_every: None,
            ..CheckSchedule::default()
        };
        assert!(!never.metric_due(1));
    }

    #[test]
    fn test_zero_period_checks_every_unit() {
        let per_batch = CheckSchedule {
            cadence: Cadence::Step,
            period: 0,
            ..CheckSchedule::default()
        };
        assert!(per_batch.step_due(3, 3));
        assert!(per_batch.step_due(5, 2));
        assert!(!per_batch.epoch_due(1));

        let per_epoch = CheckSchedule {
            period: 0,
            ..CheckSchedule::default()
        };
        assert!((1..=4).all(|epoch| per_epoch.epoch_due(epoch)));
        assert!(!per_epoch.step_due(3, 3));
    }

    #[test]
    fn test_period_cadence() {
        let every_other = CheckSchedule {
            period: 2,
            ..CheckSchedule::default()
        };
        assert!(!every_other.epoch_due(1));
        assert!(every_other.epoch_due(2));

        let every_ten = CheckSchedule {
            cadence: Cadence::Step,
            period: 10,
            ..CheckSchedule::default()
        };
        assert!(!every_ten.step_due(8, 4));
        assert!(every_ten.step_due(12, 4));
    }

    #[test]
    fn test_config_survives_serde() {
        let config = RunnerConfig {
            loader: LoaderOptions {
                batch_size: 64,
                shuffle: true,
                ..LoaderOptions::default()
            },
            ..RunnerConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: RunnerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert_ne!(back.loader, LoaderOptions::default());
    }

    #[test]
    fn test_load_from_toml_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "trainforge.toml",
                r#"
                model_version = "resnet18"
                use_ema = true

                [optimizer]
                kind = "sgd"
                lr = 0.01

                [scheduler]
                mode = "per_step"
                lambda = { kind = "linear", lrf = 0.1 }
                "#,
            )?;
            jail.set_env("TRAINFORGE_SEED", "7");

            let config = RunnerConfig::load(Some(jail.directory())).expect("config loads");
            assert_eq!(config.model_version, "resnet18");
            assert!(config.use_ema);
            assert_eq!(config.seed, 7);
            assert_eq!(config.optimizer.kind, OptimizerKind::Sgd);
            assert_eq!(config.optimizer.lr, 0.01);
            assert_eq!(config.scheduler.mode, SchedulerMode::PerStep);
            assert_eq!(config.scheduler.lambda, LrLambda::Linear { lrf: 0.1 });
            assert_eq!(config.max_grad_norm, Some(10.0));
            Ok(())
        });
    }
}
