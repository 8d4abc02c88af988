//! Minimal host tensors and named parameter sets.
//!
//! The engine never does model math itself. It only needs to move parameter
//! state around (checkpoints, EMA, optimizer slots) and to touch gradients
//! (accumulation, unscaling, clipping), so a flat `f32` buffer plus a shape
//! is all a tensor has to be here.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dense row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(EngineError::TensorLength {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![value; len],
        }
    }

    /// A 1-D tensor owning `data`.
    pub fn from_slice(data: &[f32]) -> Self {
        Self {
            shape: vec![data.len()],
            data: data.to_vec(),
        }
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    pub fn sum_squares(&self) -> f64 {
        self.data.iter().map(|&v| f64::from(v) * f64::from(v)).sum()
    }

    pub fn scale(&mut self, factor: f32) {
        self.data.iter_mut().for_each(|v| *v *= factor);
    }

    /// `self += other`, shapes must agree.
    pub fn add_assign(&mut self, other: &Tensor) -> Result<()> {
        self.check_same_shape("add", other)?;
        self.data
            .iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += b);
        Ok(())
    }

    fn check_same_shape(&self, key: &str, other: &Tensor) -> Result<()> {
        if self.shape != other.shape {
            return Err(EngineError::ShapeMismatch {
                key: key.to_string(),
                expected: self.shape.clone(),
                found: other.shape.clone(),
            });
        }
        Ok(())
    }
}

/// Named tensors: parameters plus buffers, keyed by their dotted path.
pub type StateDict = BTreeMap<String, Tensor>;

/// A learnable tensor and its accumulated gradient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub value: Tensor,
    #[serde(skip)]
    pub grad: Option<Tensor>,
    pub trainable: bool,
}

impl Parameter {
    pub fn new(value: Tensor) -> Self {
        Self {
            value,
            grad: None,
            trainable: true,
        }
    }

    pub fn frozen(value: Tensor) -> Self {
        Self {
            trainable: false,
            ..Self::new(value)
        }
    }
}

/// Outcome of a non-strict state restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Present in the model, absent from the incoming state.
    pub missing: Vec<String>,
    /// Present in the incoming state, unknown to the model.
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Every tensor a model owns: trainable or frozen parameters and plain
/// buffers (running statistics and the like).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    params: BTreeMap<String, Parameter>,
    buffers: BTreeMap<String, Tensor>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Tensor) -> &mut Self {
        self.params.insert(name.into(), Parameter::new(value));
        self
    }

    pub fn insert_frozen(&mut self, name: impl Into<String>, value: Tensor) -> &mut Self {
        self.params.insert(name.into(), Parameter::frozen(value));
        self
    }

    pub fn insert_buffer(&mut self, name: impl Into<String>, value: Tensor) -> &mut Self {
        self.buffers.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.get_mut(name)
    }

    pub fn buffer(&self, name: &str) -> Option<&Tensor> {
        self.buffers.get(name)
    }

    pub fn params(&self) -> impl Iterator<Item = (&String, &Parameter)> {
        self.params.iter()
    }

    pub fn params_mut(&mut self) -> impl Iterator<Item = (&String, &mut Parameter)> {
        self.params.iter_mut()
    }

    pub fn buffers(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.buffers.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len() + self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.buffers.is_empty()
    }

    pub fn num_params(&self) -> usize {
        self.params.values().map(|p| p.value.numel()).sum()
    }

    pub fn num_trainable(&self) -> usize {
        self.params
            .values()
            .filter(|p| p.trainable)
            .map(|p| p.value.numel())
            .sum()
    }

    /// Add `grad` into the gradient slot of parameter `name`.
    pub fn accumulate_grad(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        let param = self
            .params
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownParameter(name.to_string()))?;
        if !param.trainable {
            return Ok(());
        }
        match &mut param.grad {
            Some(existing) => existing.add_assign(grad),
            None => {
                param.value.check_same_shape(name, grad)?;
                param.grad = Some(grad.clone());
                Ok(())
            }
        }
    }

    pub fn zero_grad(&mut self) {
        for param in self.params.values_mut() {
            param.grad = None;
        }
    }

    pub fn scale_grads(&mut self, factor: f32) {
        for grad in self.params.values_mut().filter_map(|p| p.grad.as_mut()) {
            grad.scale(factor);
        }
    }

    pub fn grads_finite(&self) -> bool {
        self.params
            .values()
            .filter_map(|p| p.grad.as_ref())
            .all(Tensor::is_finite)
    }

    /// Global L2 norm over all present gradients.
    pub fn grad_norm(&self) -> f64 {
        self.params
            .values()
            .filter_map(|p| p.grad.as_ref())
            .map(Tensor::sum_squares)
            .sum::<f64>()
            .sqrt()
    }

    /// Rescale gradients so their global norm is at most `max_norm`.
    /// Returns the norm measured before clipping.
    pub fn clip_grad_norm(&mut self, max_norm: f64) -> f64 {
        let norm = self.grad_norm();
        if norm.is_finite() && norm > max_norm {
            let factor = (max_norm / (norm + 1e-6)) as f32;
            self.scale_grads(factor);
        }
        norm
    }

    /// Parameters and buffers, cloned.
    pub fn state_dict(&self) -> StateDict {
        self.params
            .iter()
            .map(|(k, p)| (k.clone(), p.value.clone()))
            .chain(self.buffers.iter().map(|(k, b)| (k.clone(), b.clone())))
            .collect()
    }

    /// Restore tensors by name.
    ///
    /// Keys missing on either side are tolerated and listed in the report,
    /// unless `strict` is set. A shape disagreement is always fatal and leaves
    /// the set untouched.
    pub fn load_state_dict(&mut self, state: StateDict, strict: bool) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        for (key, incoming) in &state {
            let current = self
                .params
                .get(key)
                .map(|p| &p.value)
                .or_else(|| self.buffers.get(key));
            match current {
                Some(current) if current.shape != incoming.shape => {
                    return Err(EngineError::ShapeMismatch {
                        key: key.clone(),
                        expected: current.shape.clone(),
                        found: incoming.shape.clone(),
                    });
                }
                Some(_) => report.loaded.push(key.clone()),
                None => report.unexpected.push(key.clone()),
            }
        }
        report.missing = self
            .params
            .keys()
            .chain(self.buffers.keys())
            .filter(|k| !state.contains_key(*k))
            .cloned()
            .collect();

        if strict && !report.is_complete() {
            return Err(EngineError::invalid_config(format!(
                "strict load: missing {:?}, unexpected {:?}",
                report.missing, report.unexpected
            )));
        }

        for (key, incoming) in state {
            if let Some(param) = self.params.get_mut(&key) {
                param.value = incoming;
            } else if let Some(buffer) = self.buffers.get_mut(&key) {
                *buffer = incoming;
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn two_layer() -> ParamSet {
        let mut set = ParamSet::new();
        set.insert("fc.weight", Tensor::full(&[2, 3], 0.5))
            .insert("fc.bias", Tensor::zeros(&[2]))
            .insert_buffer("bn.running_mean", Tensor::zeros(&[2]));
        set
    }

    #[test]
    fn test_tensor_new_checks_length() {
        assert!(Tensor::new(vec![2, 2], vec![1.0; 4]).is_ok());
        assert!(matches!(
            Tensor::new(vec![2, 2], vec![1.0; 3]),
            Err(EngineError::TensorLength { len: 3, .. })
        ));
    }

    #[test]
    fn test_accumulate_grad_sums() {
        let mut set = two_layer();
        let g = Tensor::full(&[2], 1.5);
        set.accumulate_grad("fc.bias", &g).unwrap();
        set.accumulate_grad("fc.bias", &g).unwrap();
        assert_eq!(set.get("fc.bias").unwrap().grad.as_ref().unwrap().data(), &[3.0, 3.0]);

        set.zero_grad();
        assert!(set.get("fc.bias").unwrap().grad.is_none());
    }

    #[test]
    fn test_accumulate_grad_unknown_and_shape() {
        let mut set = two_layer();
        assert!(matches!(
            set.accumulate_grad("nope", &Tensor::zeros(&[2])),
            Err(EngineError::UnknownParameter(_))
        ));
        assert!(matches!(
            set.accumulate_grad("fc.bias", &Tensor::zeros(&[3])),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_clip_grad_norm() {
        let mut set = ParamSet::new();
        set.insert("w", Tensor::zeros(&[2]));
        set.accumulate_grad("w", &Tensor::from_slice(&[3.0, 4.0])).unwrap();

        let before = set.clip_grad_norm(1.0);
        assert!((before - 5.0).abs() < 1e-9);
        assert!((set.grad_norm() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_non_strict_load_reports_partial() {
        let mut set = two_layer();
        let mut state = StateDict::new();
        state.insert("fc.weight".into(), Tensor::full(&[2, 3], 2.0));
        state.insert("head.weight".into(), Tensor::zeros(&[1]));

        let report = set.load_state_dict(state, false).unwrap();
        assert_eq!(report.loaded, vec!["fc.weight".to_string()]);
        assert_eq!(report.unexpected, vec!["head.weight".to_string()]);
        assert_eq!(
            report.missing,
            vec!["fc.bias".to_string(), "bn.running_mean".to_string()]
        );
        assert_eq!(set.get("fc.weight").unwrap().value.data()[0], 2.0);
    }

    #[test]
    fn test_shape_mismatch_is_fatal_and_atomic() {
        let mut set = two_layer();
        let mut state = StateDict::new();
        state.insert("fc.bias".into(), Tensor::full(&[2], 9.0));
        state.insert("fc.weight".into(), Tensor::zeros(&[3, 2]));

        assert!(matches!(
            set.load_state_dict(state, false),
            Err(EngineError::ShapeMismatch { .. })
        ));
        assert_eq!(set.get("fc.bias").unwrap().value.data(), &[0.0, 0.0]);
    }

    #[test]
    fn test_state_dict_roundtrip_is_bit_identical() {
        let mut set = two_layer();
        set.get_mut("fc.weight")
            .unwrap()
            .value
            .data_mut()
            .copy_from_slice(&[0.1, -0.2, 1e-30, f32::MAX, -0.0, 3.3]);
        let state = set.state_dict();

        let mut other = two_layer();
        let report = other.load_state_dict(state.clone(), true).unwrap();
        assert!(report.is_complete());
        assert_eq!(other.state_dict(), state);
    }
}
