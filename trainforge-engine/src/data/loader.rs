//! In-memory batch loader.

use super::{Augment, LoaderOptions, num_batches};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Batches a finite record list, optionally reshuffled each pass.
pub struct DataLoader<R> {
    records: Vec<R>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    augment: Augment<R>,
    rng: StdRng,
}

impl<R: Clone> DataLoader<R> {
    pub fn new(records: Vec<R>, options: &LoaderOptions, augment: Augment<R>, seed: u64) -> Self {
        Self {
            records,
            batch_size: options.batch_size.max(1),
            shuffle: options.shuffle,
            drop_last: options.drop_last,
            augment,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        num_batches(self.records.len(), self.batch_size, self.drop_last)
    }

    /// One pass over the records. Records are cloned and augmented lazily,
    /// batch by batch.
    pub fn batches(&mut self) -> impl Iterator<Item = Vec<R>> + '_ {
        let mut order: Vec<usize> = (0..self.records.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        let batch_size = self.batch_size;
        let full = self.num_batches();
        let records = &self.records;
        let augment = &self.augment;

        (0..full).map(move |i| {
            let end = ((i + 1) * batch_size).min(order.len());
            order[i * batch_size..end]
                .iter()
                .map(|&idx| augment(records[idx].clone()))
                .collect()
        })
    }
}
