//! Recurrent forecaster
//!
//! Every node runs through the same LSTM with the weather covariates appended
//! to its own features.

use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, Lstm, LstmConfig};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

use super::{AuxiliaryTerms, BurnInForecaster, EncoderGradients, Forecast};
use crate::data::SeriesShape;
use crate::ModelConfig;

/// Configuration for the LSTM forecaster
#[derive(Debug, Clone)]
pub struct LstmForecasterConfig {
    /// Features per node (1 for count vectors)
    pub node_features: usize,
    /// Weather covariates appended to every node's input
    pub covariate_dim: usize,
    /// LSTM hidden size
    pub hidden_size: usize,
    /// Dropout before the read-out, active only while training
    pub dropout: f64,
}

impl LstmForecasterConfig {
    /// # Arguments
    ///
    /// * `shape` - Series layout the model is trained on
    /// * `model` - Model section of the configuration
    /// * `dropout` - Dropout probability
    pub fn new(shape: SeriesShape, model: &ModelConfig, dropout: f64) -> Self {
        LstmForecasterConfig {
            node_features: shape.node_features,
            covariate_dim: shape.covariate_dim,
            hidden_size: model.lstm_hid,
            dropout,
        }
    }
}

/// Shared per-node LSTM with a linear read-out
#[derive(Module, Debug)]
pub struct LstmForecaster<B: Backend> {
    /// Recurrent cell over `[features + covariates]` inputs
    lstm: Lstm<B>,
    dropout: Dropout,
    /// Hidden state to next-step node features
    output: Linear<B>,
    hidden_size: usize,
}

impl<B: Backend> LstmForecaster<B> {
    pub fn new(device: &B::Device, config: LstmForecasterConfig) -> Self {
        let input_size = config.node_features + config.covariate_dim;
        let lstm = LstmConfig::new(input_size, config.hidden_size, true).init(device);
        let output = LinearConfig::new(config.hidden_size, config.node_features).init(device);

        LstmForecaster {
            lstm,
            dropout: DropoutConfig::new(config.dropout).init(),
            output,
            hidden_size: config.hidden_size,
        }
    }

    /// Map LSTM outputs `[rows, steps, hidden]` to node features
    fn read_out(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        self.output.forward(self.dropout.forward(hidden))
    }
}

impl<B: AutodiffBackend> EncoderGradients<B> for LstmForecaster<B> {}

impl<B: Backend> BurnInForecaster<B> for LstmForecaster<B> {
    fn forward_burn_in(
        &self,
        observations: Tensor<B, 4>,
        covariates: Tensor<B, 3>,
        known_steps: usize,
    ) -> Forecast<B> {
        let [batch, split_len, num_nodes, features] = observations.dims();
        let covariate_dim = covariates.dims()[2];
        debug_assert!(known_steps >= 1 && known_steps < split_len);
        let rows = batch * num_nodes;

        // One sequence per (window, node): [rows, time, features]
        let series = observations
            .swap_dims(1, 2)
            .reshape([rows, split_len, features]);
        let weather = covariates
            .unsqueeze_dim::<4>(1)
            .repeat_dim(1, num_nodes)
            .reshape([rows, split_len, covariate_dim]);

        let known = Tensor::cat(
            vec![
                series.slice([0..rows, 0..known_steps, 0..features]),
                weather.clone().slice([0..rows, 0..known_steps, 0..covariate_dim]),
            ],
            2,
        );
        let (output, mut state) = self.lstm.forward(known, None);
        let last = output.slice([0..rows, known_steps - 1..known_steps, 0..self.hidden_size]);

        let mut previous = self.read_out(last);
        let mut steps = vec![previous.clone()];

        // Rollout: the model only ever sees its own predictions from here on
        for t in known_steps + 1..split_len {
            let input = Tensor::cat(
                vec![
                    previous,
                    weather.clone().slice([0..rows, t - 1..t, 0..covariate_dim]),
                ],
                2,
            );
            let (output, next_state) = self.lstm.forward(input, Some(state));
            state = next_state;
            previous = self.read_out(output);
            steps.push(previous.clone());
        }

        let pred_steps = steps.len();
        let predictions = Tensor::cat(steps, 1)
            .reshape([batch, num_nodes, pred_steps, features])
            .swap_dims(1, 2);

        Forecast {
            predictions,
            auxiliary: AuxiliaryTerms::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn model(device: &<TestBackend as Backend>::Device) -> LstmForecaster<TestBackend> {
        let config = LstmForecasterConfig {
            node_features: 1,
            covariate_dim: 2,
            hidden_size: 8,
            dropout: 0.0,
        };
        LstmForecaster::new(device, config)
    }

    #[test]
    fn test_prediction_shape() {
        let device = Default::default();
        let model = model(&device);

        let observations =
            Tensor::<TestBackend, 4>::random([3, 10, 5, 1], Distribution::Uniform(0.0, 1.0), &device);
        let covariates =
            Tensor::<TestBackend, 3>::random([3, 10, 2], Distribution::Uniform(0.0, 1.0), &device);

        let forecast = model.forward_burn_in(observations, covariates, 6);
        assert_eq!(forecast.predictions.dims(), [3, 4, 5, 1]);
        assert!(forecast.auxiliary.is_empty());
    }

    #[test]
    fn test_rollout_ignores_future_ground_truth() {
        let device = Default::default();
        let model = model(&device);

        let observations =
            Tensor::<TestBackend, 4>::random([2, 8, 3, 1], Distribution::Uniform(0.0, 1.0), &device);
        let covariates = Tensor::<TestBackend, 3>::zeros([2, 8, 2], &device);

        // Overwrite everything after the known prefix
        let known = observations.clone().slice([0..2, 0..5, 0..3, 0..1]);
        let noise = Tensor::<TestBackend, 4>::ones([2, 3, 3, 1], &device) * 100.0;
        let altered = Tensor::cat(vec![known, noise], 1);

        let a = model.forward_burn_in(observations, covariates.clone(), 5);
        let b = model.forward_burn_in(altered, covariates, 5);

        let a = a.predictions.into_data().to_vec::<f32>().unwrap();
        let b = b.predictions.into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_known_step() {
        let device = Default::default();
        let model = model(&device);

        let observations = Tensor::<TestBackend, 4>::zeros([1, 6, 2, 1], &device);
        let covariates = Tensor::<TestBackend, 3>::zeros([1, 6, 2], &device);

        let forecast = model.forward_burn_in(observations, covariates, 1);
        assert_eq!(forecast.predictions.dims(), [1, 5, 2, 1]);
    }
}
