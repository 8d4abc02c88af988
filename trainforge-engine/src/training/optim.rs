//! Optimizers over a [`ParamSet`].

use crate::error::{EngineError, Result};
use crate::tensor::{ParamSet, StateDict, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serialisable optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: String,
    pub lr: f64,
    pub step: u64,
    /// Per-parameter buffers, grouped by slot name (`momentum`, `exp_avg`, ...).
    pub slots: BTreeMap<String, StateDict>,
}

pub trait Optimizer: Send {
    fn kind(&self) -> &'static str;

    /// Apply one update from the accumulated gradients.
    fn step(&mut self, params: &mut ParamSet) -> Result<()>;

    fn zero_grad(&mut self, params: &mut ParamSet) {
        params.zero_grad();
    }

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn state(&self) -> OptimizerState;

    fn load_state(&mut self, state: OptimizerState) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    #[default]
    Adam,
}

/// Optimizer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub betas: (f64, f64),
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            lr: 1e-3,
            momentum: 0.9,
            weight_decay: 0.0,
            betas: (0.9, 0.999),
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    pub fn build(&self) -> Box<dyn Optimizer> {
        match self.kind {
            OptimizerKind::Sgd => Box::new(Sgd::new(self.lr, self.momentum, self.weight_decay)),
            OptimizerKind::Adam => Box::new(Adam::new(self.lr, self.betas, self.eps, self.weight_decay)),
        }
    }
}

fn check_kind(expected: &str, state: &OptimizerState) -> Result<()> {
    if state.kind != expected {
        return Err(EngineError::invalid_config(format!(
            "optimizer state is for '{}', this optimizer is '{expected}'",
            state.kind
        )));
    }
    Ok(())
}

/// Gradient with L2 weight decay folded in.
fn decayed_grad(value: &Tensor, grad: &Tensor, weight_decay: f64) -> Tensor {
    let mut g = grad.clone();
    if weight_decay != 0.0 {
        let wd = weight_decay as f32;
        for (g, v) in g.data_mut().iter_mut().zip(value.data()) {
            *g += wd * v;
        }
    }
    g
}

/// Stochastic gradient descent with optional momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    steps: u64,
    buffers: StateDict,
}

impl Sgd {
    pub fn new(lr: f64, momentum: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            steps: 0,
            buffers: StateDict::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn kind(&self) -> &'static str {
        "sgd"
    }

    fn step(&mut self, params: &mut ParamSet) -> Result<()> {
        let lr = self.lr as f32;
        let momentum = self.momentum as f32;
        for (name, param) in params.params_mut() {
            let Some(grad) = param.grad.as_ref().filter(|_| param.trainable) else {
                continue;
            };
            let mut update = decayed_grad(&param.value, grad, self.weight_decay);
            if momentum != 0.0 {
                let buf = self
                    .buffers
                    .entry(name.clone())
                    .or_insert_with(|| Tensor::zeros(update.shape()));
                buf.scale(momentum);
                buf.add_assign(&update)?;
                update = buf.clone();
            }
            for (v, u) in param.value.data_mut().iter_mut().zip(update.data()) {
                *v -= lr * u;
            }
        }
        self.steps += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            kind: self.kind().to_string(),
            lr: self.lr,
            step: self.steps,
            slots: BTreeMap::from([("momentum".to_string(), self.buffers.clone())]),
        }
    }

    fn load_state(&mut self, mut state: OptimizerState) -> Result<()> {
        check_kind(self.kind(), &state)?;
        self.lr = state.lr;
        self.steps = state.step;
        self.buffers = state.slots.remove("momentum").unwrap_or_default();
        Ok(())
    }
}

/// Adam with bias correction.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    betas: (f64, f64),
    eps: f64,
    weight_decay: f64,
    steps: u64,
    exp_avg: StateDict,
    exp_avg_sq: StateDict,
}

impl Adam {
    pub fn new(lr: f64, betas: (f64, f64), eps: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            betas,
            eps,
            weight_decay,
            steps: 0,
            exp_avg: StateDict::new(),
            exp_avg_sq: StateDict::new(),
        }
    }
}

impl Optimizer for Adam {
    fn kind(&self) -> &'static str {
        "adam"
    }

    fn step(&mut self, params: &mut ParamSet) -> Result<()> {
        self.steps += 1;
        let (b1, b2) = self.betas;
        let t = self.steps as i32;
        let correction1 = 1.0 - b1.powi(t);
        let correction2 = 1.0 - b2.powi(t);

        for (name, param) in params.params_mut() {
            let Some(grad) = param.grad.as_ref().filter(|_| param.trainable) else {
                continue;
            };
            let g = decayed_grad(&param.value, grad, self.weight_decay);
            let m = self
                .exp_avg
                .entry(name.clone())
                .or_insert_with(|| Tensor::zeros(g.shape()));
            let v = self
                .exp_avg_sq
                .entry(name.clone())
                .or_insert_with(|| Tensor::zeros(g.shape()));
            if m.shape() != g.shape() || v.shape() != g.shape() {
                return Err(EngineError::ShapeMismatch {
                    key: name.clone(),
                    expected: g.shape().to_vec(),
                    found: m.shape().to_vec(),
                });
            }

            let values = param.value.data_mut();
            for (((value, &gi), mi), vi) in values
                .iter_mut()
                .zip(g.data())
                .zip(m.data_mut().iter_mut())
                .zip(v.data_mut().iter_mut())
            {
                let gi = f64::from(gi);
                let mn = b1 * f64::from(*mi) + (1.0 - b1) * gi;
                let vn = b2 * f64::from(*vi) + (1.0 - b2) * gi * gi;
                *mi = mn as f32;
                *vi = vn as f32;
                let m_hat = mn / correction1;
                let v_hat = vn / correction2;
                *value -= (self.lr * m_hat / (v_hat.sqrt() + self.eps)) as f32;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            kind: self.kind().to_string(),
            lr: self.lr,
            step: self.steps,
            slots: BTreeMap::from([
                ("exp_avg".to_string(), self.exp_avg.clone()),
                ("exp_avg_sq".to_string(), self.exp_avg_sq.clone()),
            ]),
        }
    }

    fn load_state(&mut self, mut state: OptimizerState) -> Result<()> {
        check_kind(self.kind(), &state)?;
        self.lr = state.lr;
        self.steps = state.step;
        self.exp_avg = state.slots.remove("exp_avg").unwrap_or_default();
        self.exp_avg_sq = state.slots.remove("exp_avg_sq").unwrap_or_default();
        Ok(())
    }
}
