//! Recurrent message-passing decoder shared by the graph forecasters

use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::covariates_per_node;
use super::graph::relation_matrices;
use crate::data::SeriesShape;
use crate::ModelConfig;

/// Configuration for the message-passing decoder
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Features per node, predicted at every step
    pub node_features: usize,
    /// Weather covariates appended to every node's input
    pub covariate_dim: usize,
    /// Relation types, each with its own message MLP
    pub n_edge_types: usize,
    /// Width of the per-edge messages
    pub msg_hidden: usize,
    /// Width of the recurrent node state
    pub gru_hidden: usize,
    /// Width of the output MLP
    pub out_hidden: usize,
    /// Dropout on messages and the output MLP
    pub dropout: f64,
    /// Edge type 0 carries no messages
    pub skip_first_edge: bool,
}

impl DecoderConfig {
    pub fn new(shape: SeriesShape, model: &ModelConfig, n_edge_types: usize, dropout: f64) -> Self {
        DecoderConfig {
            node_features: shape.node_features,
            covariate_dim: shape.covariate_dim,
            n_edge_types,
            msg_hidden: model.dec_msg_hid,
            gru_hidden: model.dec_gru_hid,
            out_hidden: model.dec_n_hid,
            dropout,
            skip_first_edge: model.skip_first_edge,
        }
    }
}

/// GRU-style node update driven by messages along typed edges
///
/// Each step predicts the change of every node from its recurrent state and
/// adds it to the current input.
#[derive(Module, Debug)]
pub struct MessagePassingDecoder<B: Backend> {
    /// First message layer, one per edge type (sender and receiver state in)
    msg_fc1: Vec<Linear<B>>,
    /// Second message layer, one per edge type
    msg_fc2: Vec<Linear<B>>,
    /// Reset gate from aggregated messages
    hidden_r: Linear<B>,
    /// Update gate from aggregated messages
    hidden_i: Linear<B>,
    /// Candidate state from aggregated messages
    hidden_h: Linear<B>,
    /// Reset gate from the step input
    input_r: Linear<B>,
    /// Update gate from the step input
    input_i: Linear<B>,
    /// Candidate state from the step input
    input_n: Linear<B>,
    /// Output MLP mapping node state to a feature delta
    out_fc1: Linear<B>,
    out_fc2: Linear<B>,
    out_fc3: Linear<B>,
    dropout: Dropout,
    msg_hidden: usize,
    gru_hidden: usize,
    skip_first_edge: bool,
}

impl<B: Backend> MessagePassingDecoder<B> {
    /// Create a decoder with freshly initialized weights
    ///
    /// # Arguments
    ///
    /// * `device` - Device to create the weights on
    /// * `config` - Layer sizes and edge types
    pub fn new(device: &B::Device, config: DecoderConfig) -> Self {
        let msg_fc1 = (0..config.n_edge_types)
            .map(|_| LinearConfig::new(2 * config.gru_hidden, config.msg_hidden).init(device))
            .collect();
        let msg_fc2 = (0..config.n_edge_types)
            .map(|_| LinearConfig::new(config.msg_hidden, config.msg_hidden).init(device))
            .collect();

        let gate = |input: usize| {
            LinearConfig::new(input, config.gru_hidden)
                .with_bias(false)
                .init(device)
        };
        let input_size = config.node_features + config.covariate_dim;

        MessagePassingDecoder {
            msg_fc1,
            msg_fc2,
            hidden_r: gate(config.msg_hidden),
            hidden_i: gate(config.msg_hidden),
            hidden_h: gate(config.msg_hidden),
            input_r: LinearConfig::new(input_size, config.gru_hidden).init(device),
            input_i: LinearConfig::new(input_size, config.gru_hidden).init(device),
            input_n: LinearConfig::new(input_size, config.gru_hidden).init(device),
            out_fc1: LinearConfig::new(config.gru_hidden, config.out_hidden).init(device),
            out_fc2: LinearConfig::new(config.out_hidden, config.out_hidden).init(device),
            out_fc3: LinearConfig::new(config.out_hidden, config.node_features).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
            msg_hidden: config.msg_hidden,
            gru_hidden: config.gru_hidden,
            skip_first_edge: config.skip_first_edge,
        }
    }

    /// Roll out a window given per-edge type weights
    ///
    /// * `observations` - `[batch, split_len, nodes, features]`
    /// * `covariates` - `[batch, split_len, covariate_dim]`
    /// * `edges` - `[batch, nodes * (nodes - 1), edge_types]`
    ///
    /// Returns predictions for positions `known_steps..split_len`.
    pub fn forward(
        &self,
        observations: Tensor<B, 4>,
        covariates: Tensor<B, 3>,
        edges: Tensor<B, 3>,
        known_steps: usize,
    ) -> Tensor<B, 4> {
        let [batch, split_len, num_nodes, features] = observations.dims();
        let covariate_dim = covariates.dims()[2];
        debug_assert!(known_steps >= 1 && known_steps < split_len);
        let device = observations.device();

        let (send, recv) = relation_matrices::<B>(num_nodes, &device);
        let send = send.unsqueeze::<3>().repeat_dim(0, batch);
        let recv = recv.unsqueeze::<3>().repeat_dim(0, batch);

        let ground_truth = |t: usize| {
            observations
                .clone()
                .slice([0..batch, t..t + 1, 0..num_nodes, 0..features])
                .reshape([batch, num_nodes, features])
        };

        let mut hidden = Tensor::zeros([batch, num_nodes, self.gru_hidden], &device);
        let mut input = ground_truth(0);
        let mut steps = Vec::with_capacity(split_len - known_steps);

        for t in 0..split_len - 1 {
            let weather = covariates
                .clone()
                .slice([0..batch, t..t + 1, 0..covariate_dim])
                .reshape([batch, covariate_dim]);
            let (prediction, next_hidden) =
                self.step(input, weather, hidden, edges.clone(), &send, &recv);
            hidden = next_hidden;

            if t + 1 >= known_steps {
                steps.push(prediction.clone().unsqueeze_dim::<4>(1));
            }
            input = if t + 1 < known_steps {
                ground_truth(t + 1)
            } else {
                prediction
            };
        }

        Tensor::cat(steps, 1)
    }

    /// One decoder step: `[batch, nodes, features]` in, prediction and new state out
    fn step(
        &self,
        input: Tensor<B, 3>,
        weather: Tensor<B, 2>,
        hidden: Tensor<B, 3>,
        edges: Tensor<B, 3>,
        send: &Tensor<B, 3>,
        recv: &Tensor<B, 3>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let [batch, num_nodes, _] = input.dims();
        let num_edges = edges.dims()[1];

        let pre_msg = Tensor::cat(
            vec![
                send.clone().matmul(hidden.clone()),
                recv.clone().matmul(hidden.clone()),
            ],
            2,
        );

        let first = usize::from(self.skip_first_edge);
        let mut messages: Option<Tensor<B, 3>> = None;
        for k in first..self.msg_fc1.len() {
            let msg = self.msg_fc1[k].forward(pre_msg.clone()).tanh();
            let msg = self.msg_fc2[k].forward(self.dropout.forward(msg)).tanh();
            let width = msg.dims()[2];
            let weight = edges
                .clone()
                .slice([0..batch, 0..num_edges, k..k + 1])
                .repeat_dim(2, width);
            let msg = msg * weight;
            messages = Some(match messages {
                Some(total) => total + msg,
                None => msg,
            });
        }
        let active = (self.msg_fc1.len() - first).max(1);

        // Sum incoming messages per receiving node
        let aggregated = match messages {
            Some(messages) => recv.clone().swap_dims(1, 2).matmul(messages) / active as f64,
            None => Tensor::zeros([batch, num_nodes, self.msg_hidden], &input.device()),
        };

        let node_input = Tensor::cat(vec![input.clone(), covariates_per_node(weather, num_nodes)], 2);

        let r = sigmoid(self.input_r.forward(node_input.clone()) + self.hidden_r.forward(aggregated.clone()));
        let i = sigmoid(self.input_i.forward(node_input.clone()) + self.hidden_i.forward(aggregated.clone()));
        let n = (self.input_n.forward(node_input) + r * self.hidden_h.forward(aggregated)).tanh();
        let hidden = (i.clone().neg() + 1.0) * n + i * hidden;

        let delta = relu(self.out_fc1.forward(self.dropout.forward(hidden.clone())));
        let delta = relu(self.out_fc2.forward(self.dropout.forward(delta)));
        let delta = self.out_fc3.forward(delta);

        (input + delta, hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn config() -> DecoderConfig {
        DecoderConfig {
            node_features: 1,
            covariate_dim: 2,
            n_edge_types: 2,
            msg_hidden: 4,
            gru_hidden: 6,
            out_hidden: 5,
            dropout: 0.0,
            skip_first_edge: true,
        }
    }

    #[test]
    fn test_decoder_shape() {
        let device = Default::default();
        let decoder = MessagePassingDecoder::<TestBackend>::new(&device, config());

        let observations =
            Tensor::<TestBackend, 4>::random([2, 7, 4, 1], Distribution::Uniform(0.0, 1.0), &device);
        let covariates = Tensor::<TestBackend, 3>::zeros([2, 7, 2], &device);
        let edges = Tensor::<TestBackend, 3>::ones([2, 12, 2], &device) * 0.5;

        let predictions = decoder.forward(observations, covariates, edges, 3);
        assert_eq!(predictions.dims(), [2, 4, 4, 1]);
    }

    #[test]
    fn test_decoder_ignores_future_ground_truth() {
        let device = Default::default();
        let decoder = MessagePassingDecoder::<TestBackend>::new(&device, config());

        let observations =
            Tensor::<TestBackend, 4>::random([1, 6, 3, 1], Distribution::Uniform(0.0, 1.0), &device);
        let covariates = Tensor::<TestBackend, 3>::zeros([1, 6, 2], &device);
        let edges = Tensor::<TestBackend, 3>::ones([1, 6, 2], &device) * 0.5;

        let known = observations.clone().slice([0..1, 0..4, 0..3, 0..1]);
        let altered = Tensor::cat(vec![known, Tensor::ones([1, 2, 3, 1], &device) * 50.0], 1);

        let a = decoder.forward(observations, covariates.clone(), edges.clone(), 4);
        let b = decoder.forward(altered, covariates, edges, 4);
        assert_eq!(
            a.into_data().to_vec::<f32>().unwrap(),
            b.into_data().to_vec::<f32>().unwrap()
        );
    }
}
