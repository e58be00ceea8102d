//! Burn-in forecasts on raw (unnormalized) series

use std::path::Path;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use chrono::NaiveDateTime;
use serde::Serialize;

use crate::data::{NormalizationStats, RawSeries};
use crate::model::BurnInForecaster;
use crate::{Result, TrafficError};

/// Predictions for one window, in the units of the raw data
#[derive(Debug, Clone)]
pub struct WindowForecast {
    pub start: usize,
    /// Timestamps of the predicted steps
    pub timestamps: Vec<NaiveDateTime>,
    pub channels: usize,
    /// `[steps, channels]`
    pub predicted: Vec<f32>,
    /// `[steps, channels]`
    pub actual: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct ForecastRow {
    timestamp: NaiveDateTime,
    channel: usize,
    predicted: f32,
    actual: f32,
}

impl WindowForecast {
    pub fn steps(&self) -> usize {
        self.timestamps.len()
    }

    /// Mean absolute error against the observed values
    pub fn mae(&self) -> f64 {
        if self.predicted.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .predicted
            .iter()
            .zip(&self.actual)
            .map(|(p, a)| (p - a).abs() as f64)
            .sum();
        total / self.predicted.len() as f64
    }

    /// Write one `timestamp,channel,predicted,actual` row per value
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for (step, timestamp) in self.timestamps.iter().enumerate() {
            for channel in 0..self.channels {
                let i = step * self.channels + channel;
                writer.serialize(ForecastRow {
                    timestamp: *timestamp,
                    channel,
                    predicted: self.predicted[i],
                    actual: self.actual[i],
                })?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

/// Runs a trained model on windows of a raw series
pub struct Predictor<B: Backend, M: BurnInForecaster<B>> {
    model: M,
    stats: Option<NormalizationStats>,
    split_len: usize,
    known_steps: usize,
    device: B::Device,
}

impl<B: Backend, M: BurnInForecaster<B>> Predictor<B, M> {
    pub fn new(
        model: M,
        stats: Option<NormalizationStats>,
        split_len: usize,
        known_steps: usize,
        device: B::Device,
    ) -> Self {
        Predictor {
            model,
            stats,
            split_len,
            known_steps,
            device,
        }
    }

    /// Start of the most recent complete window
    pub fn latest_start(&self, series: &RawSeries) -> Result<usize> {
        series.len().checked_sub(self.split_len).ok_or_else(|| {
            TrafficError::Configuration(format!(
                "series has {} steps, fewer than the window length {}",
                series.len(),
                self.split_len
            ))
        })
    }

    /// Forecast the window starting at `start`
    pub fn forecast_window(&self, series: &RawSeries, start: usize) -> Result<WindowForecast> {
        let end = start + self.split_len;
        if end > series.len() {
            return Err(TrafficError::Configuration(format!(
                "window {}..{} runs past the end of the series ({} steps)",
                start,
                end,
                series.len()
            )));
        }

        let shape = series.shape();
        if let Some(stats) = &self.stats {
            if stats.channels() != shape.channels() {
                return Err(TrafficError::DataShape(format!(
                    "model was trained on {} channels, series has {}",
                    stats.channels(),
                    shape.channels()
                )));
            }
        }

        let mut observations = series.observation_span(start, end).to_vec();
        if let Some(stats) = &self.stats {
            stats.normalize_rows(&mut observations);
        }
        let covariates = series.covariate_span(start, end);

        let observations = Tensor::<B, 1>::from_floats(observations.as_slice(), &self.device).reshape([
            1,
            self.split_len,
            shape.num_nodes,
            shape.node_features,
        ]);
        let covariates = Tensor::<B, 1>::from_floats(covariates, &self.device)
            .reshape([1, self.split_len, shape.covariate_dim]);

        let forecast = self
            .model
            .forward_burn_in(observations, covariates, self.known_steps);
        let mut predicted = forecast
            .predictions
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| TrafficError::DataShape(format!("cannot read predictions: {:?}", e)))?;
        if let Some(stats) = &self.stats {
            stats.denormalize_rows(&mut predicted);
        }

        let first = start + self.known_steps;
        Ok(WindowForecast {
            start,
            timestamps: series.timestamps()[first..end].to_vec(),
            channels: shape.channels(),
            predicted,
            actual: series.observation_span(first, end).to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SeriesShape;
    use crate::model::{AuxiliaryTerms, Forecast};
    use burn::backend::NdArray;
    use chrono::NaiveDate;

    type TestBackend = NdArray<f32>;

    /// Repeats the last known step
    struct Persistence;

    impl<B: Backend> BurnInForecaster<B> for Persistence {
        fn forward_burn_in(
            &self,
            observations: Tensor<B, 4>,
            _covariates: Tensor<B, 3>,
            known_steps: usize,
        ) -> Forecast<B> {
            let [batch, split_len, nodes, features] = observations.dims();
            let last = observations.slice([0..batch, known_steps - 1..known_steps, 0..nodes, 0..features]);
            Forecast {
                predictions: last.repeat_dim(1, split_len - known_steps),
                auxiliary: AuxiliaryTerms::empty(),
            }
        }
    }

    fn series() -> RawSeries {
        let start = NaiveDate::from_ymd_opt(2019, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let obs = (0..20).flat_map(|i| [i as f32, 100.0 + i as f32]).collect();
        RawSeries::hourly(start, obs, vec![0.0; 20], SeriesShape::new(2, 1, 1)).unwrap()
    }

    #[test]
    fn test_forecast_in_raw_units() {
        let stats = NormalizationStats {
            min: vec![0.0, 100.0],
            max: vec![10.0, 110.0],
        };
        let predictor =
            Predictor::<TestBackend, _>::new(Persistence, Some(stats), 5, 3, Default::default());
        let series = series();

        let start = predictor.latest_start(&series).unwrap();
        assert_eq!(start, 15);
        let forecast = predictor.forecast_window(&series, start).unwrap();

        assert_eq!(forecast.steps(), 2);
        // Last known step is 17 for both predicted steps
        for (p, expected) in forecast.predicted.iter().zip([17.0, 117.0, 17.0, 117.0]) {
            assert!((p - expected).abs() < 1e-4);
        }
        assert_eq!(forecast.actual, vec![18.0, 118.0, 19.0, 119.0]);
        assert!((forecast.mae() - 1.5).abs() < 1e-4);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forecast.csv");
        forecast.write_csv(&path).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().count(), 1 + 4);
    }

    #[test]
    fn test_window_past_end() {
        let predictor = Predictor::<TestBackend, _>::new(Persistence, None, 5, 3, Default::default());
        assert!(predictor.forecast_window(&series(), 16).is_err());
    }
}
