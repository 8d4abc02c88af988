//! # trainforge-engine: training and inference orchestration
//!
//! The engine drives a model through its lifecycle without knowing anything
//! about the model itself:
//!
//! - [`training::TrainingRunner`] runs the epoch/step loop, gradient
//!   accumulation, loss scaling, LR scheduling, EMA, periodic checkpoints and
//!   early stopping.
//! - [`eval::Predictor`] evaluates, scores and serves predictions, including
//!   tiled inference for oversized inputs.
//! - [`training::HyperparamSweep`] expands a search space and trains one
//!   isolated run per combination.
//!
//! Model families plug in through [`hooks::ModelHooks`] and datasets through
//! [`data::DataSource`].

// Foundation
pub mod error;
pub mod model;
pub mod tensor;

// Collaborator contracts
pub mod data;
pub mod hooks;
pub mod tracking;

// Lifecycle
pub mod eval;
pub mod training;

// Linear-regression model, hooks and data source for tests and demos
pub mod mock;

pub use error::{EngineError, Result};
pub use hooks::{EvalContainer, MetricReport, ModelHooks, TrainOutput};
pub use model::Model;
pub use tensor::{ParamSet, StateDict, Tensor};
