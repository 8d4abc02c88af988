//! Streaming loader backed by a bounded producer queue.
//!
//! For datasets too large to materialise, one producer thread per pass pulls
//! records from the dataset factory, augments them, and pushes whole batches
//! into a bounded channel. The training loop only ever blocks on that queue.

use super::{Augment, LoaderOptions, StreamFactory, num_batches};
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Batches records produced by a [`StreamFactory`] on a background thread.
pub struct StreamLoader<R> {
    factory: StreamFactory<R>,
    len: usize,
    batch_size: usize,
    drop_last: bool,
    prefetch: usize,
    augment: Augment<R>,
}

impl<R: Send + 'static> StreamLoader<R> {
    pub fn new(factory: StreamFactory<R>, len: usize, options: &LoaderOptions, augment: Augment<R>) -> Self {
        Self {
            factory,
            len,
            batch_size: options.batch_size.max(1),
            drop_last: options.drop_last,
            prefetch: options.prefetch.max(1),
            augment,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        num_batches(self.len, self.batch_size, self.drop_last)
    }

    /// Start one pass: spawns the producer and returns the consuming end.
    pub fn batches(&mut self) -> StreamBatches<R> {
        let (tx, rx) = mpsc::channel(self.prefetch);
        let factory = self.factory.clone();
        let augment = self.augment.clone();
        let batch_size = self.batch_size;
        let drop_last = self.drop_last;

        let producer = std::thread::spawn(move || {
            let mut batch = Vec::with_capacity(batch_size);
            for record in factory() {
                batch.push(augment(record));
                if batch.len() == batch_size {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                    if tx.blocking_send(full).is_err() {
                        // consumer went away
                        return;
                    }
                }
            }
            if !batch.is_empty() && !drop_last {
                let _ = tx.blocking_send(batch);
            }
        });

        StreamBatches {
            rx,
            producer: Some(producer),
        }
    }
}

/// Consuming end of one streaming pass.
///
/// Dropping it early closes the queue, which unblocks and ends the producer.
pub struct StreamBatches<R> {
    rx: mpsc::Receiver<Vec<R>>,
    producer: Option<JoinHandle<()>>,
}

impl<R> StreamBatches<R> {
    fn join_producer(&mut self) {
        if let Some(handle) = self.producer.take() {
            if let Err(panic) = handle.join() {
                // collaborator code panicked inside the producer
                std::panic::resume_unwind(panic);
            }
        }
    }
}

impl<R> Iterator for StreamBatches<R> {
    type Item = Vec<R>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rx.blocking_recv() {
            Some(batch) => Some(batch),
            None => {
                self.join_producer();
                None
            }
        }
    }
}

impl<R> Drop for StreamBatches<R> {
    fn drop(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        if let Some(handle) = self.producer.take() {
            if handle.join().is_err() {
                tracing::warn!("streaming producer panicked after the consumer stopped");
            }
        }
    }
}
