//! Training metrics and run history

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-batch values accumulated over one pass
#[derive(Debug, Clone, Default)]
pub struct EpochMetrics {
    /// Reconstruction plus weighted regularizer
    pub total_loss: f64,
    pub reconstruction: f64,
    pub regularizer: f64,
    pub mse: f64,
    /// Mean absolute error in the units of the raw data
    pub mae: f64,
    pub batch_count: usize,
    pub window_count: usize,
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update metrics with a batch result
    pub fn update(
        &mut self,
        total_loss: f32,
        reconstruction: f32,
        regularizer: f32,
        mse: f32,
        mae: f32,
        batch_size: usize,
    ) {
        self.total_loss += total_loss as f64;
        self.reconstruction += reconstruction as f64;
        self.regularizer += regularizer as f64;
        self.mse += mse as f64;
        self.mae += mae as f64;
        self.batch_count += 1;
        self.window_count += batch_size;
    }

    fn mean(&self, sum: f64) -> f64 {
        if self.batch_count == 0 {
            0.0
        } else {
            sum / self.batch_count as f64
        }
    }

    pub fn avg_loss(&self) -> f64 {
        self.mean(self.total_loss)
    }

    pub fn avg_reconstruction(&self) -> f64 {
        self.mean(self.reconstruction)
    }

    pub fn avg_regularizer(&self) -> f64 {
        self.mean(self.regularizer)
    }

    pub fn avg_mse(&self) -> f64 {
        self.mean(self.mse)
    }

    pub fn avg_mae(&self) -> f64 {
        self.mean(self.mae)
    }
}

impl fmt::Display for EpochMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Loss: {:.5} (recon: {:.5}, reg: {:.5}) | MSE: {:.5} | MAE: {:.3}",
            self.avg_loss(),
            self.avg_reconstruction(),
            self.avg_regularizer(),
            self.avg_mse(),
            self.avg_mae()
        )
    }
}

/// Append-only metric series
///
/// Train series hold one value per completed epoch. Test series hold one
/// value per evaluation, at the epochs listed in `test_epochs`.
///
/// A diverged run leaves NaN or infinite losses behind; those are stored as
/// the strings `"NaN"`, `"inf"` and `"-inf"` so the history stays readable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricHistory {
    #[serde(with = "float_series")]
    pub train_loss: Vec<f64>,
    #[serde(with = "float_series")]
    pub train_reconstruction: Vec<f64>,
    #[serde(with = "float_series")]
    pub train_regularizer: Vec<f64>,
    #[serde(with = "float_series")]
    pub train_mse: Vec<f64>,
    pub annealing_weight: Vec<f64>,
    pub learning_rate: Vec<f64>,
    pub test_epochs: Vec<usize>,
    #[serde(with = "float_series")]
    pub test_loss: Vec<f64>,
    #[serde(with = "float_series")]
    pub test_mse: Vec<f64>,
    #[serde(with = "float_series")]
    pub test_mae: Vec<f64>,
    /// Lowest finite test loss so far
    pub best_test_loss: Option<f64>,
    pub best_epoch: Option<usize>,
}

impl MetricHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_train(&mut self, train: &EpochMetrics, weight: f64, lr: f64) {
        self.train_loss.push(train.avg_loss());
        self.train_reconstruction.push(train.avg_reconstruction());
        self.train_regularizer.push(train.avg_regularizer());
        self.train_mse.push(train.avg_mse());
        self.annealing_weight.push(weight);
        self.learning_rate.push(lr);
    }

    pub fn record_test(&mut self, epoch: usize, test: &EpochMetrics) {
        let loss = test.avg_reconstruction();
        self.test_epochs.push(epoch);
        self.test_loss.push(loss);
        self.test_mse.push(test.avg_mse());
        self.test_mae.push(test.avg_mae());

        // NaN compares false both ways, so a diverged evaluation never wins
        let improved = loss.is_finite()
            && self
                .best_test_loss
                .filter(|best| best.is_finite())
                .map_or(true, |best| loss < best);
        if improved {
            self.best_test_loss = Some(loss);
            self.best_epoch = Some(epoch);
        }
    }

    /// Completed epochs
    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }
}

/// Serde helpers for float series that may contain non-finite values
mod float_series {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum JsonFloat {
        Number(f64),
        Text(String),
    }

    impl From<f64> for JsonFloat {
        fn from(value: f64) -> Self {
            if value.is_finite() {
                JsonFloat::Number(value)
            } else {
                JsonFloat::Text(value.to_string())
            }
        }
    }

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|&v| JsonFloat::from(v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<JsonFloat>::deserialize(deserializer)?
            .into_iter()
            .map(|value| match value {
                JsonFloat::Number(v) => Ok(v),
                JsonFloat::Text(text) => text
                    .parse::<f64>()
                    .map_err(|_| D::Error::custom(format!("invalid metric value {:?}", text))),
            })
            .collect()
    }
}

/// Where the loop is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "epoch")]
pub enum TrainingPhase {
    Initialized,
    /// Running the given epoch
    Epoch(usize),
    Finalized,
}

/// Counters and history owned by the training loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub phase: TrainingPhase,
    pub global_step: usize,
    pub history: MetricHistory,
}

impl TrainingState {
    pub fn new() -> Self {
        TrainingState {
            phase: TrainingPhase::Initialized,
            global_step: 0,
            history: MetricHistory::new(),
        }
    }

    pub fn completed_epochs(&self) -> usize {
        self.history.epochs()
    }

    pub fn is_finalized(&self) -> bool {
        self.phase == TrainingPhase::Finalized
    }
}

impl Default for TrainingState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_averages() {
        let mut metrics = EpochMetrics::new();
        metrics.update(1.0, 0.8, 0.2, 0.5, 2.0, 4);
        metrics.update(3.0, 2.8, 0.2, 1.5, 4.0, 2);

        assert_eq!(metrics.batch_count, 2);
        assert_eq!(metrics.window_count, 6);
        assert!((metrics.avg_loss() - 2.0).abs() < 1e-9);
        assert!((metrics.avg_mse() - 1.0).abs() < 1e-9);
        assert!((metrics.avg_mae() - 3.0).abs() < 1e-9);
        assert_eq!(EpochMetrics::new().avg_loss(), 0.0);
    }

    #[test]
    fn test_best_test_epoch() {
        let mut history = MetricHistory::new();
        let mut metrics = EpochMetrics::new();
        metrics.update(0.0, 0.4, 0.0, 0.4, 1.0, 1);
        history.record_test(0, &metrics);

        let mut better = EpochMetrics::new();
        better.update(0.0, 0.1, 0.0, 0.1, 0.5, 1);
        history.record_test(10, &better);
        history.record_test(20, &metrics);

        assert_eq!(history.test_epochs, vec![0, 10, 20]);
        assert_eq!(history.best_epoch, Some(10));
        let best = history.best_test_loss.unwrap();
        assert!((best - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_diverged_evaluation_is_never_best() {
        let mut history = MetricHistory::new();
        let mut diverged = EpochMetrics::new();
        diverged.update(f32::NAN, f32::NAN, 0.0, f32::NAN, f32::NAN, 1);
        history.record_test(0, &diverged);
        assert_eq!(history.best_test_loss, None);

        let mut finite = EpochMetrics::new();
        finite.update(0.5, 0.5, 0.0, 0.5, 1.0, 1);
        history.record_test(10, &finite);
        history.record_test(20, &diverged);

        assert_eq!(history.best_epoch, Some(10));
        assert_eq!(history.best_test_loss, Some(0.5));
        assert!(history.test_loss[2].is_nan());
    }

    #[test]
    fn test_non_finite_losses_survive_json() {
        let mut history = MetricHistory::new();
        history.train_loss = vec![0.3, f64::NAN, f64::INFINITY];
        history.test_loss = vec![f64::NEG_INFINITY];

        let json = serde_json::to_string(&history).unwrap();
        assert!(!json.contains("null"));
        let back: MetricHistory = serde_json::from_str(&json).unwrap();

        assert_eq!(back.train_loss[0], 0.3);
        assert!(back.train_loss[1].is_nan());
        assert_eq!(back.train_loss[2], f64::INFINITY);
        assert_eq!(back.test_loss, vec![f64::NEG_INFINITY]);
    }

    #[test]
    fn test_state_serializes_phase() {
        let mut state = TrainingState::new();
        state.phase = TrainingPhase::Epoch(3);
        let json = serde_json::to_string(&state).unwrap();
        let back: TrainingState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
