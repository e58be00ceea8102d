//! Raw input files: count arrays (.npy) and the weather table (.csv)
//!
//! Count arrays are `[cells, time]` or `[cells, time, features]`. Pickups and
//! dropoffs are stacked along the cell axis, so a run with both files sees
//! twice as many nodes.

use std::fs::File;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use ndarray::{ArrayD, Axis, Ix3};
use ndarray_npy::ReadNpyExt;

use super::series::{RawSeries, SeriesShape};
use crate::{DataConfig, Result, TrafficError};

/// Value substituted for missing or unreadable covariate cells
pub const MISSING_COVARIATE: f32 = 0.0;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Weather covariates read from CSV
#[derive(Debug, Clone)]
pub struct WeatherTable {
    pub timestamps: Vec<NaiveDateTime>,
    /// Row-major `[time, columns]`
    pub values: Vec<f32>,
    pub columns: Vec<String>,
    /// Cells replaced by [`MISSING_COVARIATE`]
    pub filled: usize,
}

impl WeatherTable {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Load pickups, optional dropoffs and weather into one aligned series
pub fn load_series(config: &DataConfig) -> Result<RawSeries> {
    if config.pickup_path.is_empty() {
        return Err(TrafficError::Configuration(
            "data.pickup_path is not set".to_string(),
        ));
    }
    if config.weather_path.is_empty() {
        return Err(TrafficError::Configuration(
            "data.weather_path is not set".to_string(),
        ));
    }

    log::info!("Loading pickup counts from {}", config.pickup_path);
    let mut blocks = vec![as_cells_time_features(read_npy_f32(&config.pickup_path)?)?];
    if let Some(dropoff_path) = &config.dropoff_path {
        log::info!("Loading dropoff counts from {}", dropoff_path);
        blocks.push(as_cells_time_features(read_npy_f32(dropoff_path)?)?);
    }
    let (observations, num_nodes, steps, node_features) = stack_time_major(&blocks)?;

    log::info!("Loading weather covariates from {}", config.weather_path);
    let weather = read_weather(
        &config.weather_path,
        config.timestamp_column,
        &config.covariate_columns,
    )?;
    if weather.filled > 0 {
        log::warn!(
            "Replaced {} missing weather values with {}",
            weather.filled,
            MISSING_COVARIATE
        );
    }
    if weather.len() != steps {
        return Err(TrafficError::DataShape(format!(
            "weather table has {} rows but the count arrays have {} timesteps",
            weather.len(),
            steps
        )));
    }

    let shape = SeriesShape::new(num_nodes, node_features, weather.columns.len());
    let series = RawSeries::new(weather.timestamps, observations, weather.values, shape)?;
    log::info!(
        "Loaded {} steps x {} nodes x {} features with {} covariates",
        series.len(),
        num_nodes,
        node_features,
        shape.covariate_dim
    );
    Ok(series)
}

/// Read a numeric .npy array as f32 regardless of its stored float/int width
pub fn read_npy_f32(path: impl AsRef<Path>) -> Result<ArrayD<f32>> {
    let path = path.as_ref();
    if let Ok(array) = ArrayD::<f32>::read_npy(File::open(path)?) {
        return Ok(array);
    }
    if let Ok(array) = ArrayD::<f64>::read_npy(File::open(path)?) {
        return Ok(array.mapv(|v| v as f32));
    }
    let array = ArrayD::<i64>::read_npy(File::open(path)?)?;
    Ok(array.mapv(|v| v as f32))
}

/// Normalise a count array to `[cells, time, features]`
fn as_cells_time_features(array: ArrayD<f32>) -> Result<ndarray::Array3<f32>> {
    let array = match array.ndim() {
        2 => array.insert_axis(Axis(2)),
        3 => array,
        n => {
            return Err(TrafficError::DataShape(format!(
                "count arrays must be [cells, time] or [cells, time, features], got {} dimensions",
                n
            )))
        }
    };
    array
        .into_dimensionality::<Ix3>()
        .map_err(|e| TrafficError::DataShape(e.to_string()))
}

/// Concatenate blocks along the cell axis and flatten to `[time, nodes, features]`
fn stack_time_major(blocks: &[ndarray::Array3<f32>]) -> Result<(Vec<f32>, usize, usize, usize)> {
    let Some(first) = blocks.first() else {
        return Err(TrafficError::DataShape("no count arrays given".to_string()));
    };
    let (_, steps, features) = first.dim();
    for block in blocks {
        let (_, t, f) = block.dim();
        if t != steps || f != features {
            return Err(TrafficError::DataShape(format!(
                "count arrays disagree: {} steps x {} features vs {} steps x {} features",
                steps, features, t, f
            )));
        }
    }
    let num_nodes: usize = blocks.iter().map(|b| b.dim().0).sum();

    let mut values = Vec::with_capacity(steps * num_nodes * features);
    for t in 0..steps {
        for block in blocks {
            for cell in block.axis_iter(Axis(0)) {
                values.extend(cell.index_axis(Axis(0), t).iter().copied());
            }
        }
    }
    Ok((values, num_nodes, steps, features))
}

/// Read the weather CSV, filling missing covariates with [`MISSING_COVARIATE`]
pub fn read_weather(
    path: impl AsRef<Path>,
    timestamp_column: usize,
    columns: &[String],
) -> Result<WeatherTable> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path.as_ref())?;

    let headers = reader.headers()?.clone();
    let indices = columns
        .iter()
        .map(|name| {
            headers.iter().position(|h| h.trim() == name).ok_or_else(|| {
                TrafficError::DataShape(format!("weather file has no column named {}", name))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut timestamps = Vec::new();
    let mut values = Vec::new();
    let mut filled = 0;

    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let raw_time = record.get(timestamp_column).ok_or_else(|| {
            TrafficError::DataShape(format!("weather row {} has no timestamp column", row + 1))
        })?;
        timestamps.push(parse_timestamp(raw_time).ok_or_else(|| {
            TrafficError::DataShape(format!(
                "weather row {} has an unreadable timestamp: {}",
                row + 1,
                raw_time
            ))
        })?);

        for &idx in &indices {
            match record.get(idx).and_then(|v| v.trim().parse::<f32>().ok()) {
                Some(v) if v.is_finite() => values.push(v),
                _ => {
                    values.push(MISSING_COVARIATE);
                    filled += 1;
                }
            }
        }
    }

    Ok(WeatherTable {
        timestamps,
        values,
        columns: columns.to_vec(),
        filled,
    })
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_utc()))
}

/// Load a square adjacency matrix for `num_nodes` nodes, row-major
pub fn load_adjacency(path: impl AsRef<Path>, num_nodes: usize) -> Result<Vec<f32>> {
    let array = read_npy_f32(path)?;
    if array.shape() != [num_nodes, num_nodes] {
        return Err(TrafficError::DataShape(format!(
            "adjacency matrix has shape {:?}, expected [{}, {}]",
            array.shape(),
            num_nodes,
            num_nodes
        )));
    }
    let values: Vec<f32> = array.iter().copied().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(TrafficError::DataShape(
            "adjacency matrix contains non-finite values".to_string(),
        ));
    }
    Ok(values)
}
