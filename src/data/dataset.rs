//! Burn Dataset implementation over fixed-length windows
//!
//! Windows slide one step at a time over the full series. A single boundary
//! splits them chronologically into train and test, and min-max statistics
//! come from the rows the training windows cover.

use std::marker::PhantomData;
use std::ops::Range;
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::series::{RawSeries, SeriesShape};
use crate::{DataConfig, Result, TrafficError};

/// Per-channel min-max statistics computed from training rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    pub min: Vec<f32>,
    pub max: Vec<f32>,
}

impl NormalizationStats {
    /// Compute min and max for each channel over `rows` of a row-major buffer
    pub fn from_rows(values: &[f32], channels: usize, rows: Range<usize>) -> Self {
        let mut min = vec![f32::INFINITY; channels];
        let mut max = vec![f32::NEG_INFINITY; channels];

        for row in values[rows.start * channels..rows.end * channels].chunks_exact(channels) {
            for (c, &v) in row.iter().enumerate() {
                min[c] = min[c].min(v);
                max[c] = max[c].max(v);
            }
        }

        NormalizationStats { min, max }
    }

    pub fn channels(&self) -> usize {
        self.min.len()
    }

    /// Scale of a channel, `None` when the channel never varied in training
    pub fn range(&self, channel: usize) -> Option<f32> {
        let range = self.max[channel] - self.min[channel];
        if range > f32::EPSILON {
            Some(range)
        } else {
            None
        }
    }

    pub fn is_degenerate(&self, channel: usize) -> bool {
        self.range(channel).is_none()
    }

    /// Channels that are passed through unscaled
    pub fn degenerate_channels(&self) -> Vec<usize> {
        (0..self.channels()).filter(|&c| self.is_degenerate(c)).collect()
    }

    /// Map a raw value into the training range; zero-range channels pass through
    pub fn normalize(&self, channel: usize, value: f32) -> f32 {
        match self.range(channel) {
            Some(range) => (value - self.min[channel]) / range,
            None => value,
        }
    }

    /// Inverse of [`normalize`](Self::normalize)
    pub fn denormalize(&self, channel: usize, value: f32) -> f32 {
        match self.range(channel) {
            Some(range) => value * range + self.min[channel],
            None => value,
        }
    }

    /// Normalize a row-major `[.., channels]` buffer in place
    pub fn normalize_rows(&self, values: &mut [f32]) {
        let channels = self.channels();
        for row in values.chunks_exact_mut(channels) {
            for (c, v) in row.iter_mut().enumerate() {
                *v = self.normalize(c, *v);
            }
        }
    }

    /// Denormalize a row-major `[.., channels]` buffer in place
    pub fn denormalize_rows(&self, values: &mut [f32]) {
        let channels = self.channels();
        for row in values.chunks_exact_mut(channels) {
            for (c, v) in row.iter_mut().enumerate() {
                *v = self.denormalize(c, *v);
            }
        }
    }
}

/// Window split settings
#[derive(Debug, Clone)]
pub struct SplitConfig {
    /// Steps per window
    pub split_len: usize,
    /// Leading ground-truth steps of every window
    pub burn_in_steps: usize,
    /// Fraction of windows, counted from the start, used for training
    pub train_frac: f64,
    /// Min-max scale every channel with training statistics
    pub normalize: bool,
    /// Drop test windows that share steps with training windows
    pub purge_overlap: bool,
}

impl From<&DataConfig> for SplitConfig {
    fn from(config: &DataConfig) -> Self {
        SplitConfig {
            split_len: config.split_len,
            burn_in_steps: config.burn_in_steps,
            train_frac: config.train_frac,
            normalize: config.normalize,
            purge_overlap: config.purge_overlap,
        }
    }
}

/// A contiguous slice of the series: known history followed by steps to predict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub burn_in_steps: usize,
    pub pred_steps: usize,
}

impl Window {
    pub fn new(start: usize, split_len: usize, burn_in_steps: usize) -> Self {
        Window {
            start,
            burn_in_steps,
            pred_steps: split_len - burn_in_steps,
        }
    }

    pub fn split_len(&self) -> usize {
        self.burn_in_steps + self.pred_steps
    }

    /// Series steps fed as ground truth
    pub fn burn_in_range(&self) -> Range<usize> {
        self.start..self.start + self.burn_in_steps
    }

    /// Series steps the model has to predict
    pub fn pred_range(&self) -> Range<usize> {
        self.start + self.burn_in_steps..self.end()
    }

    /// One past the last step of the window
    pub fn end(&self) -> usize {
        self.start + self.split_len()
    }
}

/// One window materialised for batching
#[derive(Debug, Clone)]
pub struct WindowItem {
    pub start: usize,
    /// `[split_len, nodes, features]`
    pub observations: Vec<f32>,
    /// `[split_len, covariate_dim]`
    pub covariates: Vec<f32>,
}

/// The windows of one partition over a shared (normalized) series
#[derive(Debug, Clone)]
pub struct WindowDataset {
    series: Arc<RawSeries>,
    windows: Vec<Window>,
}

impl WindowDataset {
    fn new(series: Arc<RawSeries>, starts: Range<usize>, split_len: usize, burn_in_steps: usize) -> Self {
        let windows = starts
            .map(|start| Window::new(start, split_len, burn_in_steps))
            .collect();
        WindowDataset { series, windows }
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn shape(&self) -> SeriesShape {
        self.series.shape()
    }

    pub fn split_len(&self) -> usize {
        self.windows.first().map(Window::split_len).unwrap_or(0)
    }

    pub fn item(&self, index: usize) -> Option<WindowItem> {
        let window = self.windows.get(index)?;
        Some(WindowItem {
            start: window.start,
            observations: self.series.observation_span(window.start, window.end()).to_vec(),
            covariates: self.series.covariate_span(window.start, window.end()).to_vec(),
        })
    }
}

impl Dataset<WindowItem> for WindowDataset {
    fn get(&self, index: usize) -> Option<WindowItem> {
        self.item(index)
    }

    fn len(&self) -> usize {
        self.windows.len()
    }
}

/// Chronologically split, optionally normalized windows
#[derive(Debug, Clone)]
pub struct WindowedSplit {
    series: Arc<RawSeries>,
    train: WindowDataset,
    test: WindowDataset,
    stats: Option<NormalizationStats>,
    num_windows: usize,
    boundary: usize,
}

impl WindowedSplit {
    /// Window the series, split it and normalize with training statistics
    pub fn build(mut series: RawSeries, config: &SplitConfig) -> Result<Self> {
        let SplitConfig {
            split_len,
            burn_in_steps,
            train_frac,
            normalize,
            purge_overlap,
        } = *config;

        if split_len < 2 {
            return Err(TrafficError::Configuration(format!(
                "split_len must be at least 2, got {}",
                split_len
            )));
        }
        if burn_in_steps == 0 || burn_in_steps >= split_len {
            return Err(TrafficError::Configuration(format!(
                "burn_in_steps must be in [1, {}), got {}",
                split_len, burn_in_steps
            )));
        }
        if !(train_frac > 0.0 && train_frac < 1.0) {
            return Err(TrafficError::Configuration(format!(
                "train_frac must be in (0, 1), got {}",
                train_frac
            )));
        }
        if split_len > series.len() {
            return Err(TrafficError::Configuration(format!(
                "split_len {} exceeds the series length {}, no windows can be formed",
                split_len,
                series.len()
            )));
        }

        let num_windows = series.len() - split_len + 1;
        let boundary = (train_frac * num_windows as f64).floor() as usize;
        if boundary == 0 || boundary >= num_windows {
            return Err(TrafficError::Configuration(format!(
                "train_frac {} splits {} windows into {} train and {} test, both must be non-empty",
                train_frac,
                num_windows,
                boundary,
                num_windows.saturating_sub(boundary)
            )));
        }

        // Rows touched by any training window
        let train_rows = 0..boundary - 1 + split_len;
        let test_start = if purge_overlap {
            train_rows.end
        } else {
            boundary
        };
        if test_start >= num_windows {
            return Err(TrafficError::Configuration(format!(
                "purging the train/test overlap leaves no test windows ({} windows, first test start {})",
                num_windows, test_start
            )));
        }

        let stats = if normalize {
            let channels = series.shape().channels();
            let stats = NormalizationStats::from_rows(series.observations(), channels, train_rows);
            let degenerate = stats.degenerate_channels();
            if !degenerate.is_empty() {
                log::warn!(
                    "{} of {} channels are constant in the training rows and pass through unscaled",
                    degenerate.len(),
                    channels
                );
            }
            stats.normalize_rows(series.observations_mut());
            Some(stats)
        } else {
            None
        };

        let series = Arc::new(series);
        let train = WindowDataset::new(series.clone(), 0..boundary, split_len, burn_in_steps);
        let test = WindowDataset::new(series.clone(), test_start..num_windows, split_len, burn_in_steps);

        log::info!(
            "Split {} windows (split_len={}, burn_in={}): train={}, test={}",
            num_windows,
            split_len,
            burn_in_steps,
            train.len(),
            test.len()
        );

        Ok(WindowedSplit {
            series,
            train,
            test,
            stats,
            num_windows,
            boundary,
        })
    }

    pub fn train(&self) -> &WindowDataset {
        &self.train
    }

    pub fn test(&self) -> &WindowDataset {
        &self.test
    }

    pub fn stats(&self) -> Option<&NormalizationStats> {
        self.stats.as_ref()
    }

    /// Total windows before splitting
    pub fn num_windows(&self) -> usize {
        self.num_windows
    }

    /// First window start that is not used for training
    pub fn boundary(&self) -> usize {
        self.boundary
    }

    pub fn shape(&self) -> SeriesShape {
        self.series.shape()
    }

    /// The series as seen by the models (normalized when requested)
    pub fn series(&self) -> &RawSeries {
        &self.series
    }

    /// Timestamp of the first step of the window starting at `start`
    pub fn window_start_time(&self, start: usize) -> Option<NaiveDateTime> {
        self.series.timestamps().get(start).copied()
    }
}

/// Batch of windows stacked along the leading dimension
#[derive(Debug, Clone)]
pub struct WindowBatch<B: Backend> {
    /// Window start offsets, in batch order
    pub starts: Vec<usize>,
    /// `[batch, split_len, nodes, features]`
    pub observations: Tensor<B, 4>,
    /// `[batch, split_len, covariate_dim]`
    pub covariates: Tensor<B, 3>,
}

/// Batcher for stacking window items into tensors
#[derive(Debug, Clone)]
pub struct WindowBatcher<B: Backend> {
    shape: SeriesShape,
    split_len: usize,
    _backend: PhantomData<B>,
}

impl<B: Backend> WindowBatcher<B> {
    pub fn new(shape: SeriesShape, split_len: usize) -> Self {
        WindowBatcher {
            shape,
            split_len,
            _backend: PhantomData,
        }
    }

    pub fn from_dataset(dataset: &WindowDataset) -> Self {
        Self::new(dataset.shape(), dataset.split_len())
    }
}

impl<B: Backend> Batcher<B, WindowItem, WindowBatch<B>> for WindowBatcher<B> {
    fn batch(&self, items: Vec<WindowItem>, device: &B::Device) -> WindowBatch<B> {
        let batch_size = items.len();
        let SeriesShape {
            num_nodes,
            node_features,
            covariate_dim,
        } = self.shape;

        let mut starts = Vec::with_capacity(batch_size);
        let mut observations =
            Vec::with_capacity(batch_size * self.split_len * num_nodes * node_features);
        let mut covariates = Vec::with_capacity(batch_size * self.split_len * covariate_dim);

        for item in items {
            starts.push(item.start);
            observations.extend(item.observations);
            covariates.extend(item.covariates);
        }

        let observations = Tensor::<B, 1>::from_floats(observations.as_slice(), device).reshape([
            batch_size,
            self.split_len,
            num_nodes,
            node_features,
        ]);
        let covariates = Tensor::<B, 1>::from_floats(covariates.as_slice(), device)
            .reshape([batch_size, self.split_len, covariate_dim]);

        WindowBatch {
            starts,
            observations,
            covariates,
        }
    }
}
