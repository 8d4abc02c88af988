//! Lambda learning-rate schedules.

use crate::training::optim::Optimizer;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Multiplier applied to the base learning rate, as a function of progress
/// `x` over a `horizon`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrLambda {
    Constant,
    /// Linear decay from 1 to `lrf`.
    Linear { lrf: f64 },
    /// Half-cosine decay from 1 to `lrf`.
    Cosine { lrf: f64 },
}

impl Default for LrLambda {
    fn default() -> Self {
        Self::Cosine { lrf: 0.01 }
    }
}

impl LrLambda {
    pub fn factor(&self, x: u64, horizon: u64) -> f64 {
        let horizon = horizon.max(1) as f64;
        let x = (x as f64).min(horizon);
        match *self {
            Self::Constant => 1.0,
            Self::Linear { lrf } => (1.0 - x / horizon) * (1.0 - lrf) + lrf,
            Self::Cosine { lrf } => ((1.0 - (x * PI / horizon).cos()) / 2.0) * (lrf - 1.0) + 1.0,
        }
    }
}

/// When the scheduler advances. Declared, never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// Once per optimizer step.
    PerStep,
    #[default]
    PerEpoch,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub lambda: LrLambda,
    pub mode: SchedulerMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub base_lr: f64,
    pub last_epoch: u64,
}

/// `lr = base_lr * lambda(last_epoch, horizon)`.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    lambda: LrLambda,
    mode: SchedulerMode,
    base_lr: f64,
    horizon: u64,
    last_epoch: u64,
}

impl LrScheduler {
    pub fn new(config: &SchedulerConfig, base_lr: f64) -> Self {
        Self {
            lambda: config.lambda,
            mode: config.mode,
            base_lr,
            horizon: 1,
            last_epoch: 0,
        }
    }

    pub fn mode(&self) -> SchedulerMode {
        self.mode
    }

    pub fn horizon(&self) -> u64 {
        self.horizon
    }

    pub fn last_epoch(&self) -> u64 {
        self.last_epoch
    }

    /// Fix the horizon for this run and push the current rate to `optimizer`.
    pub fn init(&mut self, horizon: u64, optimizer: &mut dyn Optimizer) {
        self.horizon = horizon.max(1);
        optimizer.set_learning_rate(self.current_lr());
    }

    pub fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.last_epoch += 1;
        optimizer.set_learning_rate(self.current_lr());
    }

    pub fn current_lr(&self) -> f64 {
        self.base_lr * self.lambda.factor(self.last_epoch, self.horizon)
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            base_lr: self.base_lr,
            last_epoch: self.last_epoch,
        }
    }

    pub fn load_state(&mut self, state: SchedulerState) {
        self.base_lr = state.base_lr;
        self.last_epoch = state.last_epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optim::Sgd;

    #[test]
    fn test_lambda_endpoints() {
        let cos = LrLambda::Cosine { lrf: 0.01 };
        assert!((cos.factor(0, 100) - 1.0).abs() < 1e-12);
        assert!((cos.factor(100, 100) - 0.01).abs() < 1e-12);
        assert!((cos.factor(50, 100) - 0.505).abs() < 1e-12);

        let lin = LrLambda::Linear { lrf: 0.1 };
        assert!((lin.factor(0, 10) - 1.0).abs() < 1e-12);
        assert!((lin.factor(5, 10) - 0.55).abs() < 1e-12);
        assert!((lin.factor(20, 10) - 0.1).abs() < 1e-12);

        assert_eq!(LrLambda::Constant.factor(3, 4), 1.0);
    }

    #[test]
    fn test_step_updates_optimizer() {
        let config = SchedulerConfig {
            lambda: LrLambda::Linear { lrf: 0.0 },
            mode: SchedulerMode::PerEpoch,
        };
        let mut opt = Sgd::new(0.1, 0.0, 0.0);
        let mut sched = LrScheduler::new(&config, 0.1);
        sched.init(4, &mut opt);
        assert!((opt.learning_rate() - 0.1).abs() < 1e-12);

        sched.step(&mut opt);
        sched.step(&mut opt);
        assert!((opt.learning_rate() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_state_restores_position() {
        let config = SchedulerConfig::default();
        let mut opt = Sgd::new(0.1, 0.0, 0.0);
        let mut sched = LrScheduler::new(&config, 0.1);
        sched.init(10, &mut opt);
        for _ in 0..3 {
            sched.step(&mut opt);
        }

        let mut restored = LrScheduler::new(&config, 0.5);
        restored.load_state(sched.state());
        let mut other = Sgd::new(0.5, 0.0, 0.0);
        restored.init(10, &mut other);
        assert_eq!(other.learning_rate(), opt.learning_rate());
    }
}
