//! Validation and prediction pipeline.
//!
//! [`Predictor`] borrows the hooks, the model and the data source; it never
//! touches optimizer, scheduler or training counters. The training loop builds
//! one at every metric checkpoint, and the same type serves ad hoc inference
//! outside of any training session.

use crate::data::{DataSource, Loader, LoaderOptions};
use crate::error::{EngineError, Result};
use crate::hooks::{EvalContainer, MetricReport, ModelHooks, ModelResults, ValContext, primary_score};
use crate::model::Model;
use crate::tensor::StateDict;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Evaluation options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictOptions {
    /// Falls back to the training batch size inside a fit, to 16 otherwise.
    pub batch_size: Option<usize>,
    /// Upper bound on visualised samples per evaluation pass.
    pub max_vis_num: usize,
    pub vis_dir: Option<PathBuf>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            max_vis_num: 8,
            vis_dir: None,
        }
    }
}

const DEFAULT_BATCH_SIZE: usize = 16;

/// Evaluation and inference over borrowed hooks, model and data.
pub struct Predictor<'a, H: ModelHooks, D> {
    hooks: &'a mut H,
    model: &'a mut H::Model,
    data: &'a D,
    options: PredictOptions,
    epoch: u64,
    aux_states: BTreeMap<String, Arc<StateDict>>,
}

impl<'a, H, D> Predictor<'a, H, D>
where
    H: ModelHooks,
    D: DataSource<Record = H::Record>,
{
    pub fn new(hooks: &'a mut H, model: &'a mut H::Model, data: &'a D) -> Self {
        Self {
            hooks,
            model,
            data,
            options: PredictOptions::default(),
            epoch: 0,
            aux_states: BTreeMap::new(),
        }
    }

    pub fn with_options(mut self, options: PredictOptions) -> Self {
        self.options = options;
        self
    }

    /// Epoch reported to hooks through [`ValContext`].
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Hand an extra weight set to the hooks under `name`, e.g. the EMA
    /// shadow.
    pub fn with_aux_state(mut self, name: impl Into<String>, state: StateDict) -> Self {
        self.aux_states.insert(name.into(), Arc::new(state));
        self
    }

    fn batch_size(&self) -> usize {
        self.options.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1)
    }

    fn context(&self) -> ValContext {
        ValContext {
            epoch: self.epoch,
            vis_count: 0,
            max_vis_num: self.options.max_vis_num,
            vis_dir: self.options.vis_dir.clone(),
            aux_states: self.aux_states.clone(),
        }
    }

    /// A fresh, unshuffled loader over the source's validation data.
    pub fn val_loader(&self) -> Result<Loader<H::Record>> {
        let options = LoaderOptions {
            batch_size: self.batch_size(),
            shuffle: false,
            drop_last: false,
            ..LoaderOptions::default()
        };
        Ok(Loader::new(self.data.get_val_data()?, &options, Arc::new(|r| r), 0))
    }

    /// Evaluate over the validation data.
    pub fn predict(&mut self) -> Result<EvalContainer<H::Record, H::Prediction>> {
        let mut loader = self.val_loader()?;
        self.predict_on(&mut loader)
    }

    /// Evaluate over `loader`. Records are passed through
    /// `val_data_augment` before the step and `val_data_restore` after it.
    pub fn predict_on(&mut self, loader: &mut Loader<H::Record>) -> Result<EvalContainer<H::Record, H::Prediction>> {
        self.model.set_training(false);
        let mut ctx = self.context();
        let mut container = EvalContainer::default();
        let mut expected: Option<Vec<String>> = None;

        for batch in loader.batches() {
            let batch: Vec<H::Record> = batch
                .into_iter()
                .map(|r| self.data.val_data_augment(r))
                .collect();
            self.hooks.on_val_step_start(&batch, &ctx)?;
            let results = self.hooks.on_val_step(self.model, &batch, &ctx)?;
            check_consistency(&mut expected, &results, batch.len())?;

            let restored: Vec<H::Record> = batch
                .into_iter()
                .map(|r| self.data.val_data_restore(r))
                .collect();
            self.hooks.on_val_reprocess(&restored, &results, &mut container)?;

            let n = restored
                .len()
                .min(ctx.max_vis_num.saturating_sub(ctx.vis_count));
            if n > 0 {
                self.hooks.visualize(&restored, &results, n, &ctx)?;
                ctx.vis_count += n;
            }
        }

        self.hooks.on_val_end(&mut container, &ctx)?;
        tracing::debug!(samples = container.len(), visualized = ctx.vis_count, "evaluation pass done");
        Ok(container)
    }

    /// Evaluate, then score.
    pub fn metric(&mut self) -> Result<MetricReport> {
        let mut loader = self.val_loader()?;
        self.metric_on(&mut loader)
    }

    /// Evaluate over `loader`, then score. Fails if the primary model has no
    /// `score`.
    pub fn metric_on(&mut self, loader: &mut Loader<H::Record>) -> Result<MetricReport> {
        let container = self.predict_on(loader)?;
        let report = self.hooks.metric(&container)?;
        primary_score(&report, self.hooks.model_name())?;
        Ok(report)
    }

    /// Infer raw inputs in batches; returns the primary model's predictions,
    /// restored to input space, in input order.
    pub fn batch_predict(&mut self, inputs: Vec<H::Input>) -> Result<Vec<H::Prediction>> {
        self.model.set_training(false);
        let ctx = self.context();
        let batch_size = self.batch_size();

        let records = inputs
            .into_iter()
            .map(|input| {
                self.hooks
                    .input_to_record(input)
                    .map(|r| self.data.val_data_augment(r))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(records.len());
        for chunk in records.chunks(batch_size) {
            let mut results = self.hooks.on_val_step(self.model, chunk, &ctx)?;
            let name = self.hooks.model_name();
            let preds = results.remove(name).ok_or_else(|| {
                EngineError::InconsistentResults(format!("no predictions for primary model '{name}'"))
            })?;
            if preds.len() != chunk.len() {
                return Err(EngineError::InconsistentResults(format!(
                    "model '{name}' returned {} predictions for {} inputs",
                    preds.len(),
                    chunk.len()
                )));
            }
            out.extend(
                chunk
                    .iter()
                    .zip(preds)
                    .map(|(record, pred)| self.hooks.restore_prediction(record, pred)),
            );
        }
        Ok(out)
    }

    pub fn single_predict(&mut self, input: H::Input) -> Result<H::Prediction> {
        self.batch_predict(vec![input])?
            .pop()
            .ok_or_else(|| EngineError::InconsistentResults("no prediction for single input".into()))
    }
}

/// Every batch must report the same models, with one prediction per record.
fn check_consistency<P>(expected: &mut Option<Vec<String>>, results: &ModelResults<P>, batch_len: usize) -> Result<()> {
    let keys: Vec<String> = results.keys().cloned().collect();
    match expected {
        Some(first) if *first != keys => {
            return Err(EngineError::InconsistentResults(format!(
                "batch reported models {keys:?}, earlier batches {first:?}"
            )));
        }
        Some(_) => {}
        None => *expected = Some(keys),
    }
    if let Some((name, preds)) = results.iter().find(|(_, p)| p.len() != batch_len) {
        return Err(EngineError::InconsistentResults(format!(
            "model '{name}' returned {} predictions for a batch of {batch_len}",
            preds.len()
        )));
    }
    Ok(())
}
