//! Dynamic loss scaling.

use crate::error::Result;
use crate::tensor::ParamSet;
use crate::training::optim::Optimizer;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: u32,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f32,
    pub growth_tracker: u32,
}

/// Scales the loss up before backward and the gradients back down before the
/// optimizer step. An overflowing step is skipped and the scale backs off;
/// `growth_interval` clean steps in a row grow it again.
#[derive(Debug, Clone)]
pub struct GradScaler {
    config: ScalerConfig,
    scale: f32,
    growth_tracker: u32,
    found_inf: bool,
}

impl GradScaler {
    pub fn new(config: ScalerConfig) -> Self {
        Self {
            scale: config.init_scale,
            config,
            growth_tracker: 0,
            found_inf: false,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn found_inf(&self) -> bool {
        self.found_inf
    }

    /// Divide gradients by the current scale and record whether any of them
    /// overflowed.
    pub fn unscale(&mut self, params: &mut ParamSet) {
        params.scale_grads(1.0 / self.scale);
        self.found_inf = !params.grads_finite();
    }

    /// Step the optimizer unless the unscaled gradients overflowed. Returns
    /// whether the update was applied.
    pub fn step(&mut self, optimizer: &mut dyn Optimizer, params: &mut ParamSet) -> Result<bool> {
        if self.found_inf {
            tracing::debug!(scale = self.scale, "skipping optimizer step on non-finite gradients");
            return Ok(false);
        }
        optimizer.step(params)?;
        Ok(true)
    }

    pub fn update(&mut self) {
        if self.found_inf {
            self.scale *= self.config.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.config.growth_interval {
                self.scale *= self.config.growth_factor;
                self.growth_tracker = 0;
            }
        }
        self.found_inf = false;
    }

    pub fn state(&self) -> ScalerState {
        ScalerState {
            scale: self.scale,
            growth_tracker: self.growth_tracker,
        }
    }

    pub fn load_state(&mut self, state: ScalerState) {
        self.scale = state.scale;
        self.growth_tracker = state.growth_tracker;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use crate::training::optim::Sgd;

    fn params_with_grad(g: f32) -> ParamSet {
        let mut set = ParamSet::new();
        set.insert("w", Tensor::from_slice(&[1.0]));
        set.accumulate_grad("w", &Tensor::from_slice(&[g])).unwrap();
        set
    }

    #[test]
    fn test_overflow_skips_and_backs_off() {
        let mut scaler = GradScaler::new(ScalerConfig::default());
        let mut opt = Sgd::new(0.1, 0.0, 0.0);
        let mut set = params_with_grad(f32::INFINITY);

        scaler.unscale(&mut set);
        assert!(scaler.found_inf());
        assert!(!scaler.step(&mut opt, &mut set).unwrap());
        scaler.update();

        assert_eq!(scaler.scale(), 32768.0);
        assert_eq!(set.get("w").unwrap().value.data()[0], 1.0);
    }

    #[test]
    fn test_unscale_then_step() {
        let mut scaler = GradScaler::new(ScalerConfig {
            init_scale: 4.0,
            growth_interval: 2,
            ..ScalerConfig::default()
        });
        let mut opt = Sgd::new(1.0, 0.0, 0.0);
        let mut set = params_with_grad(2.0);

        scaler.unscale(&mut set);
        assert!(scaler.step(&mut opt, &mut set).unwrap());
        assert_eq!(set.get("w").unwrap().value.data()[0], 0.5);

        scaler.update();
        assert_eq!(scaler.scale(), 4.0);
        scaler.update();
        assert_eq!(scaler.scale(), 8.0);
        assert_eq!(scaler.state().growth_tracker, 0);
    }
}
