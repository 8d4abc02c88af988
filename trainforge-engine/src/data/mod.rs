//! Dataset adapters and batch loaders.
//!
//! Dataset materialisation and per-sample transforms belong to the
//! [`DataSource`] collaborator; this module only turns what it yields into a
//! finite sequence of batches, in memory or through a bounded background
//! queue.

pub mod loader;
pub mod stream;

pub use loader::DataLoader;
pub use stream::{StreamBatches, StreamLoader};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-sample transform applied while batches are assembled.
pub type Augment<R> = Arc<dyn Fn(R) -> R + Send + Sync>;

/// Produces a fresh record iterator for one pass over a streaming dataset.
pub type StreamFactory<R> = Arc<dyn Fn() -> Box<dyn Iterator<Item = R> + Send> + Send + Sync>;

/// What a [`DataSource`] hands to the engine.
pub enum Dataset<R> {
    /// Finite, indexable records; shuffled per epoch when requested.
    Records(Vec<R>),
    /// Records produced on the fly by a background thread. `len` is the
    /// number of records one pass yields, used for scheduler horizons.
    Stream { factory: StreamFactory<R>, len: usize },
}

impl<R> Dataset<R> {
    pub fn len(&self) -> usize {
        match self {
            Self::Records(records) => records.len(),
            Self::Stream { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collaborator owning dataset materialisation and per-sample transforms.
pub trait DataSource: Send + Sync + 'static {
    type Record: Clone + Send + 'static;

    fn get_train_data(&self) -> Result<Dataset<Self::Record>>;

    fn get_val_data(&self) -> Result<Dataset<Self::Record>>;

    fn train_data_augment(&self, record: Self::Record) -> Self::Record {
        record
    }

    fn val_data_augment(&self, record: Self::Record) -> Self::Record {
        record
    }

    /// Map an augmented validation record back to its original form, for
    /// scoring against ground truth.
    fn val_data_restore(&self, record: Self::Record) -> Self::Record {
        record
    }
}

/// Batching options shared by training and evaluation loaders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    /// Capacity, in batches, of the streaming queue.
    pub prefetch: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            batch_size: 16,
            shuffle: false,
            drop_last: false,
            prefetch: 4,
        }
    }
}

/// Either kind of loader behind one batch iterator.
pub enum Loader<R> {
    Memory(DataLoader<R>),
    Stream(StreamLoader<R>),
}

impl<R: Clone + Send + 'static> Loader<R> {
    pub fn new(dataset: Dataset<R>, options: &LoaderOptions, augment: Augment<R>, seed: u64) -> Self {
        match dataset {
            Dataset::Records(records) => {
                Self::Memory(DataLoader::new(records, options, augment, seed))
            }
            Dataset::Stream { factory, len } => {
                Self::Stream(StreamLoader::new(factory, len, options, augment))
            }
        }
    }

    /// One pass over the data.
    pub fn batches(&mut self) -> Box<dyn Iterator<Item = Vec<R>> + '_> {
        match self {
            Self::Memory(loader) => Box::new(loader.batches()),
            Self::Stream(loader) => Box::new(loader.batches()),
        }
    }

    /// Number of batches one pass yields.
    pub fn num_batches(&self) -> usize {
        match self {
            Self::Memory(loader) => loader.num_batches(),
            Self::Stream(loader) => loader.num_batches(),
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            Self::Memory(loader) => loader.batch_size(),
            Self::Stream(loader) => loader.batch_size(),
        }
    }
}

pub(crate) fn num_batches(len: usize, batch_size: usize, drop_last: bool) -> usize {
    if drop_last {
        len / batch_size
    } else {
        len.div_ceil(batch_size)
    }
}
