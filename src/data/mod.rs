//! Data ingestion, windowing and batching
//!
//! Loads pickup/dropoff count arrays and weather covariates, slices them into
//! burn-in windows and batches them onto a compute device.

pub mod batcher;
pub mod dataset;
pub mod loader;
pub mod series;

pub use batcher::BatchIterator;
pub use dataset::{
    NormalizationStats, SplitConfig, Window, WindowBatch, WindowBatcher, WindowDataset,
    WindowItem, WindowedSplit,
};
pub use loader::{load_adjacency, load_series};
pub use series::{RawSeries, SeriesShape};
