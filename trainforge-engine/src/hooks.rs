//! Model-specific hook surface.
//!
//! Everything that varies per model family (building the model, the forward
//! pass and its loss, turning a validation batch into predictions, scoring)
//! lives behind [`ModelHooks`]. The training loop and the prediction pipeline
//! only sequence these calls.

use crate::error::{EngineError, Result};
use crate::model::Model;
use crate::tensor::StateDict;
use crate::training::optim::{Optimizer, OptimizerConfig};
use crate::training::reproducibility::SeedManager;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Key every train step must report.
pub const LOSS_KEY: &str = "loss";

/// Key the primary model's metric entry must carry.
pub const SCORE_KEY: &str = "score";

/// Name under which the EMA shadow weights reach validation hooks.
pub const EMA_MODEL: &str = "ema";

/// Per-model predictions for one batch, one entry per record.
pub type ModelResults<P> = BTreeMap<String, Vec<P>>;

/// `model name -> score name -> value`.
pub type MetricReport = BTreeMap<String, BTreeMap<String, f64>>;

/// Result of one forward pass.
#[derive(Debug, Clone, Default)]
pub struct TrainOutput {
    /// `loss` plus any `loss.*` components, averaged over the batch.
    pub losses: BTreeMap<String, f64>,
    /// Per-parameter gradients of the batch loss.
    pub grads: StateDict,
}

impl TrainOutput {
    pub fn new(loss: f64) -> Self {
        let mut losses = BTreeMap::new();
        losses.insert(LOSS_KEY.to_string(), loss);
        Self {
            losses,
            grads: StateDict::new(),
        }
    }

    /// Add a named loss component, logged as `loss.<name>`.
    pub fn with_component(mut self, name: &str, value: f64) -> Self {
        self.losses.insert(format!("{LOSS_KEY}.{name}"), value);
        self
    }

    pub fn with_grads(mut self, grads: StateDict) -> Self {
        self.grads = grads;
        self
    }

    pub fn loss(&self) -> Result<f64> {
        self.losses
            .get(LOSS_KEY)
            .copied()
            .ok_or(EngineError::MissingLoss)
    }
}

/// Read-only view of the loop position handed to train-step hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepContext {
    pub epoch: u64,
    /// Batches processed before this one.
    pub total_batches: u64,
    pub total_steps: u64,
    pub total_samples_seen: u64,
}

/// Evaluation-time context: visualisation budget, output location and any
/// auxiliary weight sets to evaluate next to the primary model.
#[derive(Debug, Clone, Default)]
pub struct ValContext {
    pub epoch: u64,
    pub vis_count: usize,
    pub max_vis_num: usize,
    pub vis_dir: Option<PathBuf>,
    /// Extra weight sets keyed by result name, such as [`EMA_MODEL`]. A hook
    /// that evaluates one reports its predictions under the same name.
    pub aux_states: BTreeMap<String, Arc<StateDict>>,
}

impl ValContext {
    pub fn aux_state(&self, name: &str) -> Option<&StateDict> {
        self.aux_states.get(name).map(Arc::as_ref)
    }
}

/// Aggregate of one evaluation pass.
#[derive(Debug, Clone)]
pub struct EvalContainer<R, P> {
    /// Restored ground-truth records, in loader order.
    pub trues: Vec<R>,
    /// Predictions per model name, aligned with `trues`.
    pub preds: BTreeMap<String, Vec<P>>,
}

impl<R, P> Default for EvalContainer<R, P> {
    fn default() -> Self {
        Self {
            trues: Vec::new(),
            preds: BTreeMap::new(),
        }
    }
}

impl<R, P> EvalContainer<R, P> {
    pub fn len(&self) -> usize {
        self.trues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trues.is_empty()
    }
}

/// The `score` of `model` in `report`; absent means the metric hook broke its
/// contract.
pub fn primary_score(report: &MetricReport, model: &str) -> Result<f64> {
    report
        .get(model)
        .and_then(|scores| scores.get(SCORE_KEY))
        .copied()
        .ok_or_else(|| EngineError::MissingScore {
            model: model.to_string(),
        })
}

/// Per-model-family behaviour consumed by the engine.
pub trait ModelHooks {
    type Model: Model;
    type Record: Clone + Send + 'static;
    /// Raw input accepted by ad hoc prediction.
    type Input;
    type Prediction: Clone;

    /// Name of the primary model in validation results and metric reports.
    fn model_name(&self) -> &str {
        "model"
    }

    /// Build the model. Random initialisation must draw from `seeds`.
    fn set_model(&mut self, seeds: &mut SeedManager) -> Result<Self::Model>;

    fn set_optimizer(&self, model: &Self::Model, config: &OptimizerConfig) -> Result<Box<dyn Optimizer>> {
        let _ = model;
        Ok(config.build())
    }

    fn on_train_step_start(&mut self, batch: &[Self::Record], ctx: &StepContext) -> Result<()> {
        let _ = (batch, ctx);
        Ok(())
    }

    /// Forward pass. The returned losses must contain `loss`.
    fn on_train_step(
        &mut self,
        model: &mut Self::Model,
        batch: &[Self::Record],
        ctx: &StepContext,
    ) -> Result<TrainOutput>;

    /// Accumulate the batch gradients, multiplied by `loss_scale`.
    fn on_backward(&mut self, model: &mut Self::Model, output: &TrainOutput, loss_scale: f32) -> Result<()> {
        let params = model.params_mut();
        for (name, grad) in &output.grads {
            let mut grad = grad.clone();
            if loss_scale != 1.0 {
                grad.scale(loss_scale);
            }
            params.accumulate_grad(name, &grad)?;
        }
        Ok(())
    }

    fn on_train_step_end(&mut self, output: &TrainOutput, ctx: &StepContext) -> Result<()> {
        let _ = (output, ctx);
        Ok(())
    }

    fn on_val_step_start(&mut self, batch: &[Self::Record], ctx: &ValContext) -> Result<()> {
        let _ = (batch, ctx);
        Ok(())
    }

    /// Predictions for every model under evaluation, one per record.
    fn on_val_step(
        &mut self,
        model: &Self::Model,
        batch: &[Self::Record],
        ctx: &ValContext,
    ) -> Result<ModelResults<Self::Prediction>>;

    /// Fold one batch into the running aggregate.
    fn on_val_reprocess(
        &mut self,
        batch: &[Self::Record],
        results: &ModelResults<Self::Prediction>,
        container: &mut EvalContainer<Self::Record, Self::Prediction>,
    ) -> Result<()> {
        container.trues.extend_from_slice(batch);
        for (name, preds) in results {
            container
                .preds
                .entry(name.clone())
                .or_default()
                .extend_from_slice(preds);
        }
        Ok(())
    }

    /// Render the first `n` samples of the batch.
    fn visualize(
        &mut self,
        batch: &[Self::Record],
        results: &ModelResults<Self::Prediction>,
        n: usize,
        ctx: &ValContext,
    ) -> Result<()> {
        let _ = (batch, results, n, ctx);
        Ok(())
    }

    fn on_val_end(
        &mut self,
        container: &mut EvalContainer<Self::Record, Self::Prediction>,
        ctx: &ValContext,
    ) -> Result<()> {
        let _ = (container, ctx);
        Ok(())
    }

    /// Reduce an evaluation pass to scores. The primary model's entry must
    /// contain `score`.
    fn metric(&mut self, container: &EvalContainer<Self::Record, Self::Prediction>) -> Result<MetricReport>;

    fn input_to_record(&self, input: Self::Input) -> Result<Self::Record>;

    /// Map a prediction made on an augmented record back to input space.
    fn restore_prediction(&self, record: &Self::Record, prediction: Self::Prediction) -> Self::Prediction {
        let _ = record;
        prediction
    }
}
