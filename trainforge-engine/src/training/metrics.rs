//! Training history: mean losses per checkpoint interval and validation
//! scores.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// History entries of each kind carried into a checkpoint.
pub const PERSISTED_HISTORY: usize = 64;

/// One checkpoint interval's mean losses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossRecord {
    pub step: u64,
    pub losses: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub step: u64,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub loss_history: Vec<LossRecord>,
    pub score_history: Vec<ScoreRecord>,
    pub best_step: Option<u64>,
    pub best_score: Option<f64>,
    pub total_training_time_secs: f64,
}

impl TrainingMetrics {
    pub fn record_losses(&mut self, step: u64, losses: BTreeMap<String, f64>) {
        self.loss_history.push(LossRecord { step, losses });
    }

    /// Record a validation score. Returns `true` if it beats every earlier
    /// one. A non-finite score is kept in the history but never becomes the
    /// best.
    pub fn record_score(&mut self, step: u64, score: f64) -> bool {
        self.score_history.push(ScoreRecord { step, score });
        let improved = score.is_finite() && self.best_score.is_none_or(|best| score > best);
        if improved {
            self.best_score = Some(score);
            self.best_step = Some(step);
        }
        improved
    }

    pub fn last_losses(&self) -> Option<&BTreeMap<String, f64>> {
        self.loss_history.last().map(|r| &r.losses)
    }

    /// Copy for checkpointing: best tracking and wall time in full, only the
    /// newest [`PERSISTED_HISTORY`] entries of each history.
    pub fn persisted(&self) -> Self {
        Self {
            loss_history: tail(&self.loss_history),
            score_history: tail(&self.score_history),
            best_step: self.best_step,
            best_score: self.best_score,
            total_training_time_secs: self.total_training_time_secs,
        }
    }
}

fn tail<T: Clone>(history: &[T]) -> Vec<T> {
    history[history.len().saturating_sub(PERSISTED_HISTORY)..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_score_tracks_best() {
        let mut metrics = TrainingMetrics::default();
        assert!(metrics.record_score(1, 0.5));
        assert!(metrics.record_score(2, 0.6));
        assert!(!metrics.record_score(3, 0.6));
        assert!(!metrics.record_score(4, 0.4));
        assert_eq!(metrics.best_step, Some(2));
        assert_eq!(metrics.best_score, Some(0.6));
        assert_eq!(metrics.score_history.len(), 4);
    }

    #[test]
    fn test_non_finite_score_never_becomes_best() {
        let mut metrics = TrainingMetrics::default();
        assert!(!metrics.record_score(1, f64::NAN));
        assert_eq!(metrics.best_score, None);
        assert!(metrics.record_score(2, 0.9));
        assert!(!metrics.record_score(3, f64::INFINITY));
        assert!(metrics.record_score(4, 0.99));
        assert_eq!(metrics.best_score, Some(0.99));
        assert_eq!(metrics.best_step, Some(4));
        assert_eq!(metrics.score_history.len(), 4);
    }

    #[test]
    fn test_persisted_keeps_newest_history() {
        let mut metrics = TrainingMetrics::default();
        for step in 1..=200u64 {
            metrics.record_losses(step, BTreeMap::from([("loss".to_string(), 1.0 / step as f64)]));
            metrics.record_score(step, if step == 10 { 5.0 } else { 0.1 });
        }
        metrics.total_training_time_secs = 12.5;

        let persisted = metrics.persisted();
        assert_eq!(persisted.loss_history.len(), PERSISTED_HISTORY);
        assert_eq!(persisted.score_history.len(), PERSISTED_HISTORY);
        assert_eq!(persisted.loss_history.first().unwrap().step, 200 - PERSISTED_HISTORY as u64 + 1);
        assert_eq!(persisted.loss_history.last().unwrap().step, 200);
        assert_eq!(persisted.best_step, Some(10));
        assert_eq!(persisted.best_score, Some(5.0));
        assert_eq!(persisted.total_training_time_secs, 12.5);
        assert_eq!(metrics.loss_history.len(), 200);
    }

    #[test]
    fn test_last_losses() {
        let mut metrics = TrainingMetrics::default();
        assert!(metrics.last_losses().is_none());
        metrics.record_losses(10, BTreeMap::from([("loss".to_string(), 1.5)]));
        assert_eq!(metrics.last_losses().unwrap()["loss"], 1.5);
    }
}
