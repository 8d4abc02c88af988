//! Stop policies: early stopping on a stalled validation score and the
//! non-finite loss guard.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Why a fit ended before `max_epoch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NonFiniteLoss { key: String, value: f64 },
    PatienceExhausted { best_step: u64, best_score: f64 },
    /// The runner's stop handle was set.
    External,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonFiniteLoss { key, value } => write!(f, "non-finite loss: {key} = {value}"),
            Self::PatienceExhausted {
                best_step,
                best_score,
            } => write!(
                f,
                "early stopped: no improvement since step {best_step} (best score {best_score:.6})"
            ),
            Self::External => write!(f, "stop requested"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStopConfig {
    /// Idle period, in check units, tolerated before stopping. `None` never
    /// stops.
    pub patience: Option<u64>,
    /// No stop is considered before this step.
    pub min_period: u64,
    /// Scores below this floor never count as improvements.
    pub ignore_min_score: f64,
    /// Minimum gain over the best score to count as an improvement.
    pub threshold: f64,
}

impl Default for EarlyStopConfig {
    fn default() -> Self {
        Self {
            patience: Some(10),
            min_period: 10,
            ignore_min_score: 0.1,
            threshold: 0.005,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopState {
    pub best_score: f64,
    pub best_step: u64,
    pub idle: u64,
    pub last_step: u64,
}

/// Early stopping on a higher-is-better validation score.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    config: EarlyStopConfig,
    state: EarlyStopState,
}

impl EarlyStopping {
    pub fn new(config: EarlyStopConfig) -> Self {
        let state = EarlyStopState {
            best_score: f64::MIN,
            best_step: 0,
            idle: 0,
            last_step: config.min_period,
        };
        Self { config, state }
    }

    pub fn best_score(&self) -> f64 {
        self.state.best_score
    }

    pub fn best_step(&self) -> u64 {
        self.state.best_step
    }

    pub fn idle(&self) -> u64 {
        self.state.idle
    }

    fn improves(&self, score: f64) -> bool {
        score >= self.config.ignore_min_score && score - self.state.best_score > self.config.threshold
    }

    /// Feed the score observed at `step`. Returns `true` once patience is
    /// exhausted.
    pub fn evaluate(&mut self, step: u64, score: f64) -> bool {
        let improved = self.improves(score);
        if improved {
            self.state.best_score = score;
            self.state.best_step = step;
        }
        if step < self.config.min_period {
            return false;
        }

        if improved {
            self.state.idle = 0;
        } else {
            self.state.idle += step.saturating_sub(self.state.last_step);
        }
        self.state.last_step = step;

        match self.config.patience {
            Some(patience) if self.state.idle >= patience => {
                tracing::info!(
                    step,
                    best_step = self.state.best_step,
                    best_score = self.state.best_score,
                    idle = self.state.idle,
                    "early stopping patience exhausted"
                );
                true
            }
            _ => false,
        }
    }

    pub fn stop_reason(&self) -> StopReason {
        StopReason::PatienceExhausted {
            best_step: self.state.best_step,
            best_score: self.state.best_score,
        }
    }

    pub fn state(&self) -> EarlyStopState {
        self.state
    }

    pub fn load_state(&mut self, state: EarlyStopState) {
        self.state = state;
    }
}

/// Flags the first NaN or infinite mean loss.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossGuard;

impl LossGuard {
    pub fn check(&self, losses: &BTreeMap<String, f64>) -> Option<StopReason> {
        losses
            .iter()
            .find(|(_, v)| !v.is_finite())
            .map(|(key, value)| StopReason::NonFiniteLoss {
                key: key.clone(),
                value: *value,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stopper(patience: u64, min_period: u64) -> EarlyStopping {
        EarlyStopping::new(EarlyStopConfig {
            patience: Some(patience),
            min_period,
            ignore_min_score: 0.0,
            threshold: 0.0,
        })
    }

    #[test]
    fn test_plateau_stops_when_idle_reaches_patience() {
        let mut es = stopper(3, 2);
        assert!(!es.evaluate(1, 0.5));
        assert!(!es.evaluate(2, 0.6));
        assert!(!es.evaluate(3, 0.6));
        assert!(!es.evaluate(4, 0.6));
        assert!(es.evaluate(5, 0.6));
        assert_eq!(es.best_step(), 2);
        assert_eq!(
            es.stop_reason(),
            StopReason::PatienceExhausted {
                best_step: 2,
                best_score: 0.6
            }
        );
    }

    #[test]
    fn test_idle_counts_steps_not_calls() {
        let mut es = stopper(10, 0);
        assert!(!es.evaluate(0, 0.5));
        assert!(!es.evaluate(5, 0.4));
        assert!(es.evaluate(10, 0.4));
    }

    #[test]
    fn test_ignore_min_score_floor() {
        let mut es = EarlyStopping::new(EarlyStopConfig {
            patience: Some(2),
            min_period: 0,
            ignore_min_score: 0.5,
            threshold: 0.0,
        });
        assert!(!es.evaluate(1, 0.3));
        assert_eq!(es.best_score(), f64::MIN);
        assert!(es.evaluate(2, 0.4));
    }

    #[test]
    fn test_no_patience_never_stops() {
        let mut es = EarlyStopping::new(EarlyStopConfig {
            patience: None,
            ..EarlyStopConfig::default()
        });
        for step in 0..1000 {
            assert!(!es.evaluate(step, 0.2));
        }
    }

    #[test]
    fn test_loss_guard() {
        let guard = LossGuard;
        let mut losses = BTreeMap::from([("loss".to_string(), 0.5)]);
        assert_eq!(guard.check(&losses), None);
        losses.insert("loss.box".to_string(), f64::INFINITY);
        assert!(matches!(
            guard.check(&losses),
            Some(StopReason::NonFiniteLoss { key, .. }) if key == "loss.box"
        ));
    }

    proptest! {
        #[test]
        fn prop_increasing_scores_never_stop(patience in 1u64..20, min_period in 0u64..20, n in 1usize..200) {
            let mut es = EarlyStopping::new(EarlyStopConfig {
                patience: Some(patience),
                min_period,
                ignore_min_score: 0.0,
                threshold: 0.005,
            });
            for i in 0..n {
                let step = i as u64 + 1;
                prop_assert!(!es.evaluate(step, 0.01 * step as f64));
            }
        }

        #[test]
        fn prop_plateau_stops_exactly_at_patience(patience in 1u64..30, min_period in 0u64..30) {
            let mut es = EarlyStopping::new(EarlyStopConfig {
                patience: Some(patience),
                min_period,
                ignore_min_score: 0.0,
                threshold: 0.0,
            });
            let start = min_period.max(1);
            prop_assert!(!es.evaluate(start, 1.0));
            let mut step = start;
            loop {
                step += 1;
                let stop = es.evaluate(step, 1.0);
                if step - start >= patience {
                    prop_assert!(stop);
                    prop_assert_eq!(step - start, patience);
                    break;
                }
                prop_assert!(!stop);
            }
        }
    }
}
