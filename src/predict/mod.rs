//! Prediction and inference
//!
//! Run trained models on raw series and map the output back to raw units.

pub mod inference;

pub use inference::{Predictor, WindowForecast};
