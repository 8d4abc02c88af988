//! Loop counters persisted with every checkpoint.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Progress of a training run.
///
/// Samples are the unit of accumulation and of per-step checkpoint cadence;
/// `total_steps` only moves when an accumulation boundary resolves into an
/// optimizer step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    /// Completed passes over the training data.
    pub epoch: u64,
    pub total_samples_seen: u64,
    /// Resolved accumulation boundaries (optimizer steps).
    pub total_steps: u64,
    /// Processed batches.
    pub total_batches: u64,
    pub per_epoch_samples: u64,
    /// Samples since the last checkpoint.
    pub check_samples: u64,
    /// Completed checkpoint intervals.
    pub check_count: u64,
    /// Running `loss * batch_len` sums since the last checkpoint.
    pub check_loss: BTreeMap<String, f64>,
}

impl Counters {
    /// Book one processed batch and its per-sample mean losses.
    pub fn record_batch(&mut self, batch_len: u64, losses: &BTreeMap<String, f64>) {
        self.total_samples_seen += batch_len;
        self.per_epoch_samples += batch_len;
        self.check_samples += batch_len;
        self.total_batches += 1;
        for (key, value) in losses {
            *self.check_loss.entry(key.clone()).or_insert(0.0) += value * batch_len as f64;
        }
    }

    /// Sample-weighted mean of every loss since the last checkpoint.
    pub fn mean_losses(&self) -> BTreeMap<String, f64> {
        if self.check_samples == 0 {
            return BTreeMap::new();
        }
        let n = self.check_samples as f64;
        self.check_loss
            .iter()
            .map(|(key, sum)| (key.clone(), sum / n))
            .collect()
    }

    /// Close the current checkpoint interval.
    pub fn reset_check(&mut self) {
        self.check_samples = 0;
        self.check_loss.clear();
        self.check_count += 1;
    }
}

/// Whether the batch that brought the running count to `seen` crossed a
/// multiple of `window`. A zero window fires on every batch.
///
/// Batches need not divide the window: the step fires on the batch that
/// crosses the boundary, not only on one landing exactly on it.
pub fn crosses_boundary(seen: u64, batch_len: u64, window: u64) -> bool {
    window == 0 || seen % window < batch_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn losses(loss: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("loss".to_string(), loss)])
    }

    #[test]
    fn test_mean_is_sample_weighted() {
        let mut c = Counters::default();
        c.record_batch(4, &losses(1.0));
        c.record_batch(2, &losses(4.0));
        assert_eq!(c.mean_losses()["loss"], 2.0);
        assert_eq!(c.total_batches, 2);
        assert_eq!(c.total_samples_seen, 6);

        c.reset_check();
        assert!(c.mean_losses().is_empty());
        assert_eq!(c.check_count, 1);
        assert_eq!(c.total_samples_seen, 6);
    }

    #[test]
    fn test_boundary_crossing() {
        // window 4, batch 3: seen 3, 6, 9, 12
        let fired: Vec<bool> = [3, 6, 9, 12]
            .iter()
            .map(|&seen| crosses_boundary(seen, 3, 4))
            .collect();
        assert_eq!(fired, vec![false, true, true, true]);
        assert!(crosses_boundary(5, 5, 0));
    }

    proptest! {
        #[test]
        fn prop_step_count_tracks_window(batch in 1u64..32, window in 1u64..128, batches in 1u64..200) {
            let mut fired = 0u64;
            for i in 1..=batches {
                if crosses_boundary(i * batch, batch, window) {
                    fired += 1;
                }
            }
            let total = batches * batch;
            if window >= batch {
                let expected = total / window;
                prop_assert!(fired + 1 >= expected && fired <= expected + 1);
            } else {
                prop_assert_eq!(fired, batches);
            }
            prop_assert!(fired <= batches);
        }

        #[test]
        fn prop_constant_loss_mean_is_exact(quarter in -400i32..400, sizes in proptest::collection::vec(1u64..64, 1..50)) {
            let loss = f64::from(quarter) / 4.0;
            let mut c = Counters::default();
            for &size in &sizes {
                c.record_batch(size, &losses(loss));
            }
            prop_assert_eq!(c.mean_losses()["loss"], loss);
        }
    }
}
