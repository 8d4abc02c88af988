//! Grid sweeps over model, data and runner parameters.
//!
//! A [`SearchSpace`] maps component names to a [`SearchComponent`]: constant
//! parameters plus a list of grids. Each grid is expanded to its cartesian
//! product and the grids of one component are concatenated; components are
//! then crossed with each other in name order. Every resulting [`Trial`]
//! trains in its own work directory, sequentially.

use super::callbacks::StopReason;
use super::config::{RunOptions, RunnerConfig};
use super::experiment::TrainingStatus;
use super::runner::TrainingRunner;
use crate::data::DataSource;
use crate::error::Result;
use crate::hooks::{ModelHooks, primary_score};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};
use trainforge_core::persistence;

/// Component whose parameters are merged into the [`RunnerConfig`].
pub const RUNNER_COMPONENT: &str = "runner";

/// Values whose text is longer than this are hashed in sub-versions.
const MAX_INLINE_VALUE: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchComponent {
    pub constant: Map<String, Value>,
    /// Grids keyed by dotted parameter paths (`head.anchor_t`).
    pub variable: Vec<BTreeMap<String, Vec<Value>>>,
}

impl SearchComponent {
    /// Flat variable assignments, one per grid point. A component without
    /// grids contributes a single empty assignment.
    pub fn assignments(&self) -> Vec<BTreeMap<String, Value>> {
        if self.variable.is_empty() {
            return vec![BTreeMap::new()];
        }
        self.variable.iter().flat_map(cartesian).collect()
    }
}

pub type SearchSpace = BTreeMap<String, SearchComponent>;

fn cartesian(grid: &BTreeMap<String, Vec<Value>>) -> Vec<BTreeMap<String, Value>> {
    let mut points = vec![BTreeMap::new()];
    for (key, values) in grid {
        points = points
            .iter()
            .flat_map(|point| {
                values.iter().map(move |value| {
                    let mut next = point.clone();
                    next.insert(key.clone(), value.clone());
                    next
                })
            })
            .collect();
    }
    points
}

/// `{"a.b": 1}` to `{"a": {"b": 1}}`.
fn expand_dotted(flat: &BTreeMap<String, Value>) -> Value {
    let mut root = Value::Object(Map::new());
    for (key, value) in flat {
        let mut nested = value.clone();
        for part in key.rsplit('.') {
            let mut map = Map::new();
            map.insert(part.to_string(), nested);
            nested = Value::Object(map);
        }
        deep_merge(&mut root, nested);
    }
    root
}

/// Merge `overlay` into `base`; objects merge key by key, anything else in
/// `overlay` replaces what `base` holds.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn short_value(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > MAX_INLINE_VALUE {
        let digest = format!("{:x}", Sha256::digest(text.as_bytes()));
        digest[..6].to_string()
    } else {
        text
    }
}

/// One point of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub index: usize,
    /// Merged parameters per component.
    pub params: BTreeMap<String, Value>,
    /// `k=v;...` over the variable parameters; empty when nothing varies.
    pub sub_version: String,
}

impl Trial {
    /// Deserialize one component's parameters; an absent component reads as
    /// an empty object.
    pub fn component<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .params
            .get(name)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        Ok(serde_json::from_value(value)?)
    }

    /// `base` with the `runner` component merged in and the dataset version
    /// suffixed by the sub-version, so every trial gets its own work dir.
    pub fn runner_config(&self, base: &RunnerConfig) -> Result<RunnerConfig> {
        let mut value = serde_json::to_value(base)?;
        if let Some(overrides) = self.params.get(RUNNER_COMPONENT) {
            deep_merge(&mut value, overrides.clone());
        }
        let mut config: RunnerConfig = serde_json::from_value(value)?;
        if !self.sub_version.is_empty() {
            config.dataset_version = format!("{}/{}", config.dataset_version, self.sub_version);
        }
        Ok(config)
    }
}

/// Every trial of `space`, first component outermost.
pub fn expand_space(space: &SearchSpace) -> Vec<Trial> {
    let mut combos: Vec<Vec<(&String, BTreeMap<String, Value>)>> = vec![Vec::new()];
    for (name, component) in space {
        let assignments = component.assignments();
        combos = combos
            .into_iter()
            .flat_map(|combo| {
                assignments.iter().map(move |assignment| {
                    let mut next = combo.clone();
                    next.push((name, assignment.clone()));
                    next
                })
            })
            .collect();
    }

    combos
        .into_iter()
        .enumerate()
        .map(|(index, combo)| {
            let mut params = BTreeMap::new();
            let mut parts = Vec::new();
            for (name, assignment) in combo {
                parts.extend(assignment.iter().map(|(k, v)| format!("{k}={}", short_value(v))));
                let mut merged = Value::Object(space[name].constant.clone());
                deep_merge(&mut merged, expand_dotted(&assignment));
                params.insert(name.clone(), merged);
            }
            Trial {
                index,
                params,
                sub_version: parts.join(";"),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepTrial {
    pub trial_number: usize,
    pub sub_version: String,
    pub params: BTreeMap<String, Value>,
    /// Best validation score, or the final one when no metric checkpoint ran.
    pub metric: Option<f64>,
    pub status: TrainingStatus,
    pub stop_reason: Option<StopReason>,
    pub error: Option<String>,
}

impl SweepTrial {
    fn pending(trial: &Trial) -> Self {
        Self {
            trial_number: trial.index,
            sub_version: trial.sub_version.clone(),
            params: trial.params.clone(),
            metric: None,
            status: TrainingStatus::Pending,
            stop_reason: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperparamSweep {
    pub id: String,
    pub experiment_name: String,
    pub space: SearchSpace,
    pub trials: Vec<SweepTrial>,
    pub best_trial: Option<usize>,
}

impl HyperparamSweep {
    pub fn new(experiment_name: &str, space: SearchSpace) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            experiment_name: experiment_name.to_string(),
            space,
            trials: Vec::new(),
            best_trial: None,
        }
    }

    pub fn expand(&self) -> Vec<Trial> {
        expand_space(&self.space)
    }

    pub fn best(&self) -> Option<&SweepTrial> {
        self.best_trial.and_then(|i| self.trials.get(i))
    }

    /// Train every trial in turn.
    ///
    /// `build` turns a trial into a runner; the runner is dropped before the
    /// next trial starts. A failing trial is recorded as
    /// [`TrainingStatus::Failed`] and the sweep moves on. When `report` is
    /// given the sweep is written there as JSON after every trial.
    pub fn run<H, D, F>(&mut self, mut build: F, options: &RunOptions, report: Option<&Path>) -> Result<Option<&SweepTrial>>
    where
        H: ModelHooks,
        D: DataSource<Record = H::Record>,
        F: FnMut(&Trial) -> Result<TrainingRunner<H, D>>,
    {
        let trials = self.expand();
        self.trials = trials.iter().map(SweepTrial::pending).collect();
        self.best_trial = None;
        info!(sweep = %self.id, experiment = %self.experiment_name, trials = trials.len(), "sweep started");

        for trial in &trials {
            self.trials[trial.index].status = TrainingStatus::Running;
            info!(trial = trial.index, sub_version = %trial.sub_version, "trial started");

            let outcome = build(trial).and_then(|mut runner| {
                let summary = runner.run(options.clone())?;
                let final_score = summary
                    .report
                    .as_ref()
                    .map(|report| primary_score(report, runner.hooks().model_name()))
                    .transpose()?;
                Ok((summary, final_score))
            });

            let entry = &mut self.trials[trial.index];
            match outcome {
                Ok((summary, final_score)) => {
                    entry.status = summary.fit.status;
                    entry.stop_reason = summary.fit.stop_reason;
                    entry.metric = summary.fit.best_score.or(final_score);
                    info!(trial = trial.index, metric = ?entry.metric, status = ?entry.status, "trial finished");
                }
                Err(e) => {
                    warn!(trial = trial.index, error = %e, "trial failed");
                    entry.status = TrainingStatus::Failed;
                    entry.error = Some(e.to_string());
                }
            }

            self.best_trial = self.pick_best();
            if let Some(path) = report {
                persistence::atomic_write_json(path, &*self)?;
            }
        }

        if let Some(best) = self.best() {
            info!(trial = best.trial_number, sub_version = %best.sub_version, metric = ?best.metric, "best trial");
        }
        Ok(self.best())
    }

    fn pick_best(&self) -> Option<usize> {
        self.trials
            .iter()
            .filter(|t| t.status != TrainingStatus::Failed)
            .filter_map(|t| t.metric.filter(|m| m.is_finite()).map(|m| (t.trial_number, m)))
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn grid(pairs: &[(&str, Vec<Value>)]) -> BTreeMap<String, Vec<Value>> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_grids_are_concatenated() {
        let component = SearchComponent {
            constant: Map::new(),
            variable: vec![
                grid(&[("depth", vec![json!(1)])]),
                grid(&[("depth", vec![json!(2)])]),
                grid(&[("head.anchor_t", vec![json!(3), json!(4), json!(5)])]),
            ],
        };
        let space = SearchSpace::from([("model".to_string(), component)]);
        assert_eq!(expand_space(&space).len(), 5);
    }

    #[test]
    fn test_components_are_crossed() {
        let model = SearchComponent {
            variable: vec![grid(&[("a", vec![json!(1), json!(2)]), ("b", vec![json!(true), json!(false)])])],
            ..SearchComponent::default()
        };
        let runner = SearchComponent {
            variable: vec![grid(&[("seed", vec![json!(1), json!(2), json!(3)])])],
            ..SearchComponent::default()
        };
        let space = SearchSpace::from([("model".to_string(), model), ("runner".to_string(), runner)]);
        let trials = expand_space(&space);
        assert_eq!(trials.len(), 12);
        assert_eq!(trials[0].sub_version, "a=1;b=true;seed=1");
        assert_eq!(trials[1].sub_version, "a=1;b=true;seed=2");
        assert_eq!(trials.iter().map(|t| t.index).collect::<Vec<_>>(), (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_dotted_keys_expand_and_override_constants() {
        let mut constant = Map::new();
        constant.insert("n_classes".into(), json!(20));
        constant.insert("head".into(), json!({"anchor_t": 4, "na": 3}));
        let component = SearchComponent {
            constant,
            variable: vec![grid(&[("head.anchor_t", vec![json!(5)])])],
        };
        let space = SearchSpace::from([("model".to_string(), component)]);
        let trial = &expand_space(&space)[0];
        assert_eq!(
            trial.params["model"],
            json!({"n_classes": 20, "head": {"anchor_t": 5, "na": 3}})
        );
        assert_eq!(trial.sub_version, "head.anchor_t=5");
    }

    #[test]
    fn test_long_values_are_hashed() {
        assert_eq!(short_value(&json!("short")), "short");
        assert_eq!(short_value(&json!(0.001)), "0.001");
        let long = short_value(&json!("a_rather_long_value"));
        assert_eq!(long.len(), 6);
        assert!(long.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(long, short_value(&json!("a_rather_long_value")));
    }

    #[test]
    fn test_constant_only_space_has_one_trial() {
        let mut constant = Map::new();
        constant.insert("dim".into(), json!(4));
        let space = SearchSpace::from([(
            "model".to_string(),
            SearchComponent {
                constant,
                variable: Vec::new(),
            },
        )]);
        let trials = expand_space(&space);
        assert_eq!(trials.len(), 1);
        assert_eq!(trials[0].sub_version, "");
        let dim: BTreeMap<String, u32> = trials[0].component("model").unwrap();
        assert_eq!(dim["dim"], 4);
    }

    #[test]
    fn test_runner_config_merge() {
        let runner = SearchComponent {
            variable: vec![grid(&[("optimizer.lr", vec![json!(0.1)]), ("seed", vec![json!(7)])])],
            ..SearchComponent::default()
        };
        let space = SearchSpace::from([(RUNNER_COMPONENT.to_string(), runner)]);
        let trial = &expand_space(&space)[0];

        let base = RunnerConfig {
            dataset_version: "voc".into(),
            ..RunnerConfig::default()
        };
        let config = trial.runner_config(&base).unwrap();
        assert_eq!(config.optimizer.lr, 0.1);
        assert_eq!(config.optimizer.kind, base.optimizer.kind);
        assert_eq!(config.seed, 7);
        assert_eq!(config.dataset_version, "voc/optimizer.lr=0.1;seed=7");
    }

    #[test]
    fn test_pick_best_skips_failed_and_nan() {
        let mut sweep = HyperparamSweep::new("exp", SearchSpace::new());
        let trial = |n, metric, status| SweepTrial {
            trial_number: n,
            sub_version: String::new(),
            params: BTreeMap::new(),
            metric,
            status,
            stop_reason: None,
            error: None,
        };
        sweep.trials = vec![
            trial(0, Some(0.5), TrainingStatus::Completed),
            trial(1, Some(f64::NAN), TrainingStatus::Stopped),
            trial(2, Some(0.9), TrainingStatus::Failed),
            trial(3, Some(0.7), TrainingStatus::Stopped),
        ];
        assert_eq!(sweep.pick_best(), Some(3));
    }
}
