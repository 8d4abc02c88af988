//! A linear-regression model family for tests and demos.
//!
//! [`MockHooks`] fits `y = w . x + b` with analytic mean-squared-error
//! gradients, so the whole engine can be driven end to end without a tensor
//! backend. Loss anomalies can be injected to exercise the stop paths.

use crate::data::{Dataset, DataSource};
use crate::error::{EngineError, Result};
use crate::hooks::{
    EMA_MODEL, EvalContainer, MetricReport, ModelHooks, ModelResults, SCORE_KEY, StepContext, TrainOutput, ValContext,
};
use crate::model::{Model, TracedModel};
use crate::tensor::{ParamSet, StateDict, Tensor};
use crate::training::reproducibility::SeedManager;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const WEIGHT: &str = "linear.weight";
pub const BIAS: &str = "linear.bias";

#[derive(Debug, Clone)]
pub struct MockModel {
    params: ParamSet,
    training: bool,
}

impl MockModel {
    pub fn new(weight: Vec<f32>, bias: f32) -> Self {
        let mut params = ParamSet::new();
        params
            .insert(WEIGHT, Tensor::from_slice(&weight))
            .insert(BIAS, Tensor::scalar(bias));
        Self {
            params,
            training: true,
        }
    }

    pub fn dim(&self) -> usize {
        self.params.get(WEIGHT).map_or(0, |p| p.value.numel())
    }

    pub fn predict(&self, x: &[f32]) -> f32 {
        let weight = self.params.get(WEIGHT).map_or(&[][..], |p| p.value.data());
        let bias = self.params.get(BIAS).map_or(0.0, |p| p.value.data()[0]);
        linear(weight, bias, x)
    }
}

fn linear(weight: &[f32], bias: f32, x: &[f32]) -> f32 {
    weight.iter().zip(x).map(|(w, x)| w * x).sum::<f32>() + bias
}

/// Prediction of the weights in `state`, e.g. an EMA shadow.
fn predict_with(state: &StateDict, x: &[f32]) -> f32 {
    let weight = state.get(WEIGHT).map_or(&[][..], |t| t.data());
    let bias = state.get(BIAS).and_then(|t| t.data().first().copied()).unwrap_or(0.0);
    linear(weight, bias, x)
}

impl Model for MockModel {
    fn params(&self) -> &ParamSet {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn trace(&self) -> Result<TracedModel> {
        Ok(TracedModel {
            format: "linear-json".to_string(),
            graph: serde_json::to_vec(&self.params.state_dict())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockRecord {
    pub x: Vec<f32>,
    pub y: f32,
}

#[derive(Debug, Clone, Default)]
pub struct MockHooks {
    pub dim: usize,
    /// 1-based batch number whose reported loss is NaN. Gradients stay
    /// finite so the weights are untouched by the anomaly.
    pub nan_at_batch: Option<u64>,
    /// Report this loss for every batch instead of the real one.
    pub constant_loss: Option<f64>,
    /// Multiply the validation score by this factor after each metric call;
    /// values below 1 make the score stagnate, for early-stop tests.
    pub score_decay: Option<f64>,
    /// 1-based batch number whose gradients overflow to infinity.
    pub inf_grad_at_batch: Option<u64>,
    metric_calls: u64,
    visualized: usize,
}

impl MockHooks {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    pub fn with_nan_at_batch(mut self, batch: u64) -> Self {
        self.nan_at_batch = Some(batch);
        self
    }

    pub fn with_constant_loss(mut self, loss: f64) -> Self {
        self.constant_loss = Some(loss);
        self
    }

    pub fn with_score_decay(mut self, decay: f64) -> Self {
        self.score_decay = Some(decay);
        self
    }

    pub fn with_inf_grad_at_batch(mut self, batch: u64) -> Self {
        self.inf_grad_at_batch = Some(batch);
        self
    }

    pub fn metric_calls(&self) -> u64 {
        self.metric_calls
    }

    /// Samples handed to `visualize` so far.
    pub fn visualized(&self) -> usize {
        self.visualized
    }
}

impl ModelHooks for MockHooks {
    type Model = MockModel;
    type Record = MockRecord;
    type Input = Vec<f32>;
    type Prediction = f32;

    fn set_model(&mut self, seeds: &mut SeedManager) -> Result<MockModel> {
        let mut rng = seeds.rng("model");
        let weight = (0..self.dim).map(|_| rng.gen_range(-0.1..0.1)).collect();
        Ok(MockModel::new(weight, 0.0))
    }

    fn on_train_step(&mut self, model: &mut MockModel, batch: &[MockRecord], ctx: &StepContext) -> Result<TrainOutput> {
        let n = batch.len().max(1) as f32;
        let mut grad_w = vec![0.0f32; model.dim()];
        let mut grad_b = 0.0f32;
        let mut sse = 0.0f64;
        for record in batch {
            let err = model.predict(&record.x) - record.y;
            sse += f64::from(err * err);
            for (g, x) in grad_w.iter_mut().zip(&record.x) {
                *g += 2.0 * err * x / n;
            }
            grad_b += 2.0 * err / n;
        }
        let mse = sse / f64::from(n);

        let mut loss = self.constant_loss.unwrap_or(mse);
        if self.nan_at_batch == Some(ctx.total_batches + 1) {
            loss = f64::NAN;
        }

        if self.inf_grad_at_batch == Some(ctx.total_batches + 1) {
            grad_w.fill(f32::INFINITY);
        }

        let grads = StateDict::from([
            (WEIGHT.to_string(), Tensor::from_slice(&grad_w)),
            (BIAS.to_string(), Tensor::scalar(grad_b)),
        ]);
        Ok(TrainOutput::new(loss).with_component("mse", mse).with_grads(grads))
    }

    fn on_val_step(&mut self, model: &MockModel, batch: &[MockRecord], ctx: &ValContext) -> Result<ModelResults<f32>> {
        let preds: Vec<f32> = batch.iter().map(|r| model.predict(&r.x)).collect();
        let mut results = ModelResults::from([(self.model_name().to_string(), preds)]);
        if let Some(shadow) = ctx.aux_state(EMA_MODEL) {
            let ema_preds = batch.iter().map(|r| predict_with(shadow, &r.x)).collect();
            results.insert(EMA_MODEL.to_string(), ema_preds);
        }
        Ok(results)
    }

    fn visualize(
        &mut self,
        _batch: &[MockRecord],
        _results: &ModelResults<f32>,
        n: usize,
        _ctx: &ValContext,
    ) -> Result<()> {
        self.visualized += n;
        Ok(())
    }

    /// Scores every evaluated model; the score decay applies to all of them.
    fn metric(&mut self, container: &EvalContainer<MockRecord, f32>) -> Result<MetricReport> {
        if !container.preds.contains_key(self.model_name()) {
            return Err(EngineError::hook("no predictions for the linear model"));
        }
        let n = container.len().max(1) as f64;
        let decay = self.score_decay.map_or(1.0, |d| d.powi(self.metric_calls as i32));
        self.metric_calls += 1;

        let report = container
            .preds
            .iter()
            .map(|(model, preds)| {
                let mse = container
                    .trues
                    .iter()
                    .zip(preds)
                    .map(|(r, p)| f64::from(p - r.y).powi(2))
                    .sum::<f64>()
                    / n;
                let scores = BTreeMap::from([
                    (SCORE_KEY.to_string(), decay / (1.0 + mse)),
                    ("mse".to_string(), mse),
                ]);
                (model.clone(), scores)
            })
            .collect();
        Ok(report)
    }

    fn input_to_record(&self, input: Vec<f32>) -> Result<MockRecord> {
        if input.len() != self.dim {
            return Err(EngineError::hook(format!(
                "expected {} features, got {}",
                self.dim,
                input.len()
            )));
        }
        Ok(MockRecord { x: input, y: 0.0 })
    }
}

/// In-memory train/val split, optionally served as a stream.
#[derive(Debug, Clone)]
pub struct VecSource<R> {
    pub train: Vec<R>,
    pub val: Vec<R>,
    /// Serve training data through the background streaming loader.
    pub stream: bool,
}

impl<R> VecSource<R> {
    pub fn new(train: Vec<R>, val: Vec<R>) -> Self {
        Self {
            train,
            val,
            stream: false,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

impl VecSource<MockRecord> {
    /// `n` training and `n / 4` validation samples of a noiseless linear
    /// target with weights `1, 2, ..., dim` and bias `0.5`.
    pub fn linear(n: usize, dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sample = || {
            let x: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let y = x.iter().enumerate().map(|(i, x)| (i + 1) as f32 * x).sum::<f32>() + 0.5;
            MockRecord { x, y }
        };
        let train = (0..n).map(|_| sample()).collect();
        let val = (0..(n / 4).max(1)).map(|_| sample()).collect();
        Self::new(train, val)
    }
}

impl<R: Clone + Send + Sync + 'static> DataSource for VecSource<R> {
    type Record = R;

    fn get_train_data(&self) -> Result<Dataset<R>> {
        if !self.stream {
            return Ok(Dataset::Records(self.train.clone()));
        }
        let records = Arc::new(self.train.clone());
        let len = records.len();
        Ok(Dataset::Stream {
            factory: Arc::new(move || {
                let iter: Box<dyn Iterator<Item = R> + Send> = Box::new(records.as_ref().clone().into_iter());
                iter
            }),
            len,
        })
    }

    fn get_val_data(&self) -> Result<Dataset<R>> {
        Ok(Dataset::Records(self.val.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradients_point_downhill() {
        let mut hooks = MockHooks::new(2);
        let mut model = MockModel::new(vec![0.0, 0.0], 0.0);
        let batch = vec![MockRecord { x: vec![1.0, 0.0], y: 2.0 }];
        let out = hooks.on_train_step(&mut model, &batch, &StepContext::default()).unwrap();
        assert_eq!(out.loss().unwrap(), 4.0);
        assert_eq!(out.grads[WEIGHT].data(), &[-4.0, 0.0]);
        assert_eq!(out.grads[BIAS].data(), &[-4.0]);
    }

    #[test]
    fn test_nan_injection_is_one_based() {
        let mut hooks = MockHooks::new(1).with_nan_at_batch(2);
        let mut model = MockModel::new(vec![0.0], 0.0);
        let batch = vec![MockRecord { x: vec![1.0], y: 1.0 }];
        let first = StepContext::default();
        let second = StepContext {
            total_batches: 1,
            ..StepContext::default()
        };
        assert!(hooks.on_train_step(&mut model, &batch, &first).unwrap().loss().unwrap().is_finite());
        assert!(hooks.on_train_step(&mut model, &batch, &second).unwrap().loss().unwrap().is_nan());
    }

    #[test]
    fn test_perfect_model_scores_one() {
        let mut hooks = MockHooks::new(1);
        let container = EvalContainer {
            trues: vec![MockRecord { x: vec![1.0], y: 3.0 }],
            preds: BTreeMap::from([("model".to_string(), vec![3.0])]),
        };
        let report = hooks.metric(&container).unwrap();
        assert_eq!(report["model"][SCORE_KEY], 1.0);
        assert_eq!(report["model"]["mse"], 0.0);
    }

    #[test]
    fn test_ema_shadow_reported_when_present() {
        let mut hooks = MockHooks::new(1);
        let model = MockModel::new(vec![1.0], 0.0);
        let batch = vec![MockRecord { x: vec![2.0], y: 2.0 }];

        let plain = hooks.on_val_step(&model, &batch, &ValContext::default()).unwrap();
        assert_eq!(plain.keys().collect::<Vec<_>>(), vec!["model"]);

        let shadow = StateDict::from([
            (WEIGHT.to_string(), Tensor::from_slice(&[0.5])),
            (BIAS.to_string(), Tensor::scalar(1.0)),
        ]);
        let mut ctx = ValContext::default();
        ctx.aux_states.insert(EMA_MODEL.to_string(), Arc::new(shadow));
        let results = hooks.on_val_step(&model, &batch, &ctx).unwrap();
        assert_eq!(results["model"], vec![2.0]);
        assert_eq!(results[EMA_MODEL], vec![2.0]);
    }

    #[test]
    fn test_inf_grad_injection() {
        let mut hooks = MockHooks::new(1).with_inf_grad_at_batch(1);
        let mut model = MockModel::new(vec![0.0], 0.0);
        let batch = vec![MockRecord { x: vec![1.0], y: 1.0 }];
        let out = hooks.on_train_step(&mut model, &batch, &StepContext::default()).unwrap();
        assert!(out.loss().unwrap().is_finite());
        assert!(!out.grads[WEIGHT].is_finite());
    }

    #[test]
    fn test_input_dimension_checked() {
        let hooks = MockHooks::new(3);
        assert!(hooks.input_to_record(vec![1.0, 2.0]).is_err());
        assert_eq!(hooks.input_to_record(vec![1.0, 2.0, 3.0]).unwrap().x.len(), 3);
    }
}
