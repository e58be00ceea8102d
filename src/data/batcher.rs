//! Mini-batch iteration over window datasets

use std::sync::Arc;

use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::tensor::backend::Backend;

use super::dataset::{WindowBatch, WindowBatcher, WindowDataset};

/// Data loader over one partition of windows
///
/// With a shuffle seed every call to [`iterate`](Self::iterate) yields a new
/// permutation; without one windows come out in chronological order.
/// Batches are built one at a time on the given device.
#[derive(Clone)]
pub struct BatchIterator<B: Backend> {
    loader: Arc<dyn DataLoader<B, WindowBatch<B>>>,
    batch_size: usize,
}

impl<B: Backend> BatchIterator<B> {
    /// # Arguments
    ///
    /// * `dataset` - Windows to batch; the dataset is never modified
    /// * `device` - Device the batch tensors are created on
    /// * `batch_size` - Windows per batch; the last batch may be short
    /// * `shuffle` - Seed for per-pass shuffling, `None` for chronological order
    pub fn new(
        dataset: &WindowDataset,
        device: B::Device,
        batch_size: usize,
        shuffle: Option<u64>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        let batcher = WindowBatcher::<B>::from_dataset(dataset);

        let builder = DataLoaderBuilder::new(batcher)
            .batch_size(batch_size)
            .set_device(device);
        let builder = match shuffle {
            Some(seed) => builder.shuffle(seed),
            None => builder,
        };

        BatchIterator {
            loader: builder.build(dataset.clone()),
            batch_size,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Windows behind the loader
    pub fn num_windows(&self) -> usize {
        self.loader.num_items()
    }

    /// Batches yielded by one pass
    pub fn num_batches(&self) -> usize {
        self.num_windows().div_ceil(self.batch_size)
    }

    /// Lazily batch one pass over the windows
    pub fn iterate(&self) -> impl Iterator<Item = WindowBatch<B>> + '_ {
        self.loader.iter()
    }
}
