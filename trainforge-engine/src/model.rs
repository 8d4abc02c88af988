//! The model contract the engine drives.
//!
//! Architectures are collaborators: the engine only needs their parameters,
//! a train/eval switch, and optionally a traced export.

use crate::error::{EngineError, Result};
use crate::tensor::ParamSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A trainable model as seen by the training loop.
pub trait Model: Send {
    fn params(&self) -> &ParamSet;

    fn params_mut(&mut self) -> &mut ParamSet;

    /// Switch between training and evaluation behaviour (dropout, batch
    /// statistics, ...).
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Export a self-contained inference graph.
    fn trace(&self) -> Result<TracedModel> {
        Err(EngineError::unsupported("this model has no traced export"))
    }
}

/// An exported inference graph, opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedModel {
    pub format: String,
    pub graph: Vec<u8>,
}

/// Per-entry parameter profile of a model.
#[derive(Debug, Clone)]
pub struct ModelSummary {
    rows: Vec<SummaryRow>,
    pub total: usize,
    pub trainable: usize,
}

#[derive(Debug, Clone)]
struct SummaryRow {
    name: String,
    shape: Vec<usize>,
    params: usize,
    trainable: bool,
}

impl ModelSummary {
    pub fn of(params: &ParamSet) -> Self {
        let rows = params
            .params()
            .map(|(name, p)| SummaryRow {
                name: name.clone(),
                shape: p.value.shape().to_vec(),
                params: p.value.numel(),
                trainable: p.trainable,
            })
            .collect();
        Self {
            rows,
            total: params.num_params(),
            trainable: params.num_trainable(),
        }
    }
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name_width = self
            .rows
            .iter()
            .map(|r| r.name.len())
            .max()
            .unwrap_or(4)
            .max(4);
        writeln!(f, "module info:")?;
        writeln!(
            f,
            "{:<name_width$}   {:<16} {:>10} {:>9}",
            "name", "shape", "params", "trainable"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<name_width$}   {:<16} {:>10} {:>9}",
                row.name,
                format!("{:?}", row.shape),
                human_readable(row.params),
                row.trainable
            )?;
        }
        write!(
            f,
            "{:<name_width$}   {:<16} {:>10} {:>9}",
            "sum",
            "",
            human_readable(self.total),
            human_readable(self.trainable)
        )
    }
}

/// `1234567` -> `1.23M`.
pub fn human_readable(n: usize) -> String {
    const UNITS: [(f64, &str); 3] = [(1e9, "B"), (1e6, "M"), (1e3, "K")];
    let value = n as f64;
    for (scale, unit) in UNITS {
        if value >= scale {
            return format!("{:.2}{unit}", value / scale);
        }
    }
    n.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn test_human_readable() {
        assert_eq!(human_readable(999), "999");
        assert_eq!(human_readable(1_500), "1.50K");
        assert_eq!(human_readable(25_557_032), "25.56M");
    }

    #[test]
    fn test_summary_counts() {
        let mut params = ParamSet::new();
        params
            .insert("fc.weight", Tensor::zeros(&[10, 100]))
            .insert_frozen("embed", Tensor::zeros(&[50]));
        let summary = ModelSummary::of(&params);
        assert_eq!(summary.total, 1050);
        assert_eq!(summary.trainable, 1000);

        let text = summary.to_string();
        assert!(text.contains("fc.weight"));
        assert!(text.contains("1.05K"));
    }
}
