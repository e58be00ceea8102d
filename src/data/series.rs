//! Time-aligned observation and covariate series

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::{Result, TrafficError};

/// Layout of one timestep: `num_nodes * node_features` observation
/// channels plus `covariate_dim` covariates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesShape {
    pub num_nodes: usize,
    pub node_features: usize,
    pub covariate_dim: usize,
}

impl SeriesShape {
    pub fn new(num_nodes: usize, node_features: usize, covariate_dim: usize) -> Self {
        SeriesShape {
            num_nodes,
            node_features,
            covariate_dim,
        }
    }

    /// Observation channels per timestep
    pub fn channels(&self) -> usize {
        self.num_nodes * self.node_features
    }
}

/// Ordered observations `[time, nodes, features]` with aligned covariates
/// `[time, covariate_dim]`, both stored row-major
#[derive(Debug, Clone)]
pub struct RawSeries {
    timestamps: Vec<NaiveDateTime>,
    observations: Vec<f32>,
    covariates: Vec<f32>,
    shape: SeriesShape,
}

impl RawSeries {
    /// Build a series, checking alignment, finiteness and the time grid
    pub fn new(
        timestamps: Vec<NaiveDateTime>,
        observations: Vec<f32>,
        covariates: Vec<f32>,
        shape: SeriesShape,
    ) -> Result<Self> {
        let len = timestamps.len();
        if len == 0 {
            return Err(TrafficError::DataShape("series has no timesteps".to_string()));
        }
        if shape.num_nodes == 0 || shape.node_features == 0 || shape.covariate_dim == 0 {
            return Err(TrafficError::DataShape(format!(
                "series needs at least one node, feature and covariate, got {:?}",
                shape
            )));
        }
        if observations.len() != len * shape.channels() {
            return Err(TrafficError::DataShape(format!(
                "expected {} observation values ({} steps x {} channels), got {}",
                len * shape.channels(),
                len,
                shape.channels(),
                observations.len()
            )));
        }
        if covariates.len() != len * shape.covariate_dim {
            return Err(TrafficError::DataShape(format!(
                "covariate series has {} values, expected {} ({} steps x {} covariates)",
                covariates.len(),
                len * shape.covariate_dim,
                len,
                shape.covariate_dim
            )));
        }
        if let Some(i) = observations.iter().position(|v| !v.is_finite()) {
            return Err(TrafficError::DataShape(format!(
                "observation at step {} channel {} is not finite",
                i / shape.channels(),
                i % shape.channels()
            )));
        }
        if let Some(i) = covariates.iter().position(|v| !v.is_finite()) {
            return Err(TrafficError::DataShape(format!(
                "covariate at step {} column {} is not finite",
                i / shape.covariate_dim,
                i % shape.covariate_dim
            )));
        }
        check_uniform_grid(&timestamps)?;

        Ok(RawSeries {
            timestamps,
            observations,
            covariates,
            shape,
        })
    }

    /// Build a series on an hourly grid starting at `start`
    pub fn hourly(
        start: NaiveDateTime,
        observations: Vec<f32>,
        covariates: Vec<f32>,
        shape: SeriesShape,
    ) -> Result<Self> {
        let channels = shape.channels().max(1);
        let len = observations.len() / channels;
        let timestamps = (0..len)
            .map(|i| start + Duration::hours(i as i64))
            .collect();
        Self::new(timestamps, observations, covariates, shape)
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn shape(&self) -> SeriesShape {
        self.shape
    }

    pub fn timestamps(&self) -> &[NaiveDateTime] {
        &self.timestamps
    }

    /// Spacing of the time grid, `None` for a single-step series
    pub fn interval(&self) -> Option<Duration> {
        match self.timestamps.as_slice() {
            [first, second, ..] => Some(*second - *first),
            _ => None,
        }
    }

    pub fn observations(&self) -> &[f32] {
        &self.observations
    }

    pub fn covariates(&self) -> &[f32] {
        &self.covariates
    }

    /// Observation channels at step `t`
    pub fn observation_row(&self, t: usize) -> &[f32] {
        let c = self.shape.channels();
        &self.observations[t * c..(t + 1) * c]
    }

    /// Covariates at step `t`
    pub fn covariate_row(&self, t: usize) -> &[f32] {
        let w = self.shape.covariate_dim;
        &self.covariates[t * w..(t + 1) * w]
    }

    /// Observation values for steps `start..end`
    pub fn observation_span(&self, start: usize, end: usize) -> &[f32] {
        let c = self.shape.channels();
        &self.observations[start * c..end * c]
    }

    /// Covariate values for steps `start..end`
    pub fn covariate_span(&self, start: usize, end: usize) -> &[f32] {
        let w = self.shape.covariate_dim;
        &self.covariates[start * w..end * w]
    }

    pub(crate) fn observations_mut(&mut self) -> &mut [f32] {
        &mut self.observations
    }
}

fn check_uniform_grid(timestamps: &[NaiveDateTime]) -> Result<()> {
    let Some(step) = timestamps.windows(2).next().map(|w| w[1] - w[0]) else {
        return Ok(());
    };
    if step <= Duration::zero() {
        return Err(TrafficError::DataShape(format!(
            "timestamps must be strictly increasing, {} is followed by {}",
            timestamps[0], timestamps[1]
        )));
    }
    for (i, pair) in timestamps.windows(2).enumerate() {
        if pair[1] - pair[0] != step {
            return Err(TrafficError::DataShape(format!(
                "timestamp {} at step {} breaks the {} minute grid",
                pair[1],
                i + 1,
                step.num_minutes()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2019, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_hourly_series() {
        let shape = SeriesShape::new(2, 1, 1);
        let series = RawSeries::hourly(start(), vec![0.0; 20], vec![1.0; 10], shape).unwrap();
        assert_eq!(series.len(), 10);
        assert_eq!(series.interval(), Some(Duration::hours(1)));
        assert_eq!(series.observation_row(3).len(), 2);
        assert_eq!(series.covariate_row(9), &[1.0]);
    }

    #[test]
    fn test_covariate_length_mismatch() {
        let shape = SeriesShape::new(1, 1, 2);
        let err = RawSeries::hourly(start(), vec![0.0; 10], vec![0.0; 18], shape).unwrap_err();
        assert!(matches!(err, TrafficError::DataShape(_)));
    }

    #[test]
    fn test_rejects_nan_observation() {
        let shape = SeriesShape::new(1, 1, 1);
        let mut obs = vec![1.0; 5];
        obs[3] = f32::NAN;
        let err = RawSeries::hourly(start(), obs, vec![0.0; 5], shape).unwrap_err();
        assert!(matches!(err, TrafficError::DataShape(_)));
    }

    #[test]
    fn test_rejects_irregular_grid() {
        let shape = SeriesShape::new(1, 1, 1);
        let t0 = start();
        let timestamps = vec![t0, t0 + Duration::hours(1), t0 + Duration::hours(3)];
        let err = RawSeries::new(timestamps, vec![0.0; 3], vec![0.0; 3], shape).unwrap_err();
        assert!(matches!(err, TrafficError::DataShape(_)));

        let timestamps = vec![t0, t0, t0];
        assert!(RawSeries::new(timestamps, vec![0.0; 3], vec![0.0; 3], shape).is_err());
    }
}
