//! Training infrastructure: the loop controller and everything it owns.

pub mod callbacks;
pub mod checkpoint;
pub mod config;
pub mod counters;
pub mod ema;
pub mod experiment;
pub mod metrics;
pub mod optim;
pub mod reproducibility;
pub mod runner;
pub mod scaler;
pub mod scheduler;
pub mod sweep;

pub use callbacks::{EarlyStopping, StopReason};
pub use checkpoint::{CheckpointRecord, CheckpointStore, SaveKind};
pub use config::{Cadence, CheckSchedule, FitOptions, RunOptions, RunnerConfig};
pub use counters::Counters;
pub use experiment::{RunLayout, TrainingStatus};
pub use metrics::TrainingMetrics;
pub use runner::{FitSummary, RunSummary, TrainingRunner};
pub use sweep::{HyperparamSweep, SearchComponent, SearchSpace, SweepTrial, Trial};
