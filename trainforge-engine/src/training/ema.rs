//! Exponential moving average of model weights.

use crate::error::Result;
use crate::model::Model;
use crate::tensor::{LoadReport, ParamSet, StateDict};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaConfig {
    pub decay: f64,
    /// Ramp length, in updates, of the effective decay.
    pub tau: f64,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            decay: 0.9999,
            tau: 2000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaState {
    pub shadow: StateDict,
    pub updates: u64,
}

/// Shadow copy of a model's state, updated once per applied optimizer step
/// with `shadow = d * shadow + (1 - d) * live`, where
/// `d = decay * (1 - exp(-updates / tau))` ramps up from zero.
#[derive(Debug, Clone)]
pub struct ModelEma {
    config: EmaConfig,
    shadow: StateDict,
    updates: u64,
}

impl ModelEma {
    pub fn new(params: &ParamSet, config: EmaConfig) -> Self {
        Self {
            config,
            shadow: params.state_dict(),
            updates: 0,
        }
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn shadow(&self) -> &StateDict {
        &self.shadow
    }

    fn decay(&self) -> f64 {
        self.config.decay * (1.0 - (-(self.updates as f64) / self.config.tau).exp())
    }

    pub fn update(&mut self, params: &ParamSet) {
        self.updates += 1;
        let d = self.decay() as f32;
        for (key, live) in params.state_dict() {
            match self.shadow.get_mut(&key) {
                Some(shadow) if shadow.shape() == live.shape() => {
                    for (s, l) in shadow.data_mut().iter_mut().zip(live.data()) {
                        *s = d * *s + (1.0 - d) * l;
                    }
                }
                _ => {
                    self.shadow.insert(key, live);
                }
            }
        }
    }

    /// Load the shadow weights into `model`, e.g. for evaluation or export.
    pub fn apply_to<M: Model + ?Sized>(&self, model: &mut M) -> Result<LoadReport> {
        model.params_mut().load_state_dict(self.shadow.clone(), false)
    }

    pub fn state(&self) -> EmaState {
        EmaState {
            shadow: self.shadow.clone(),
            updates: self.updates,
        }
    }

    pub fn load_state(&mut self, state: EmaState) {
        self.shadow = state.shadow;
        self.updates = state.updates;
    }
}
