//! Graph forecaster with edges inferred from each window's known prefix

use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::activation::{relu, softmax};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Distribution, Tensor};

use super::decoder::{DecoderConfig, MessagePassingDecoder};
use super::{AuxiliaryTerms, BurnInForecaster, EncoderGradients, Forecast, EDGE_PROBS};
use crate::data::SeriesShape;
use crate::ModelConfig;

/// Directed edges of the fully connected graph without self loops, as
/// `(receiver, sender)` in row-major order of the adjacency matrix
pub fn edge_pairs(num_nodes: usize) -> Vec<(usize, usize)> {
    (0..num_nodes)
        .flat_map(|recv| {
            (0..num_nodes)
                .filter(move |&send| send != recv)
                .map(move |send| (recv, send))
        })
        .collect()
}

/// One-hot sender and receiver matrices, each `[edges, nodes]`
pub fn relation_matrices<B: Backend>(
    num_nodes: usize,
    device: &B::Device,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let pairs = edge_pairs(num_nodes);
    let mut send = vec![0.0f32; pairs.len() * num_nodes];
    let mut recv = vec![0.0f32; pairs.len() * num_nodes];
    for (e, &(r, s)) in pairs.iter().enumerate() {
        recv[e * num_nodes + r] = 1.0;
        send[e * num_nodes + s] = 1.0;
    }

    let shape = [pairs.len(), num_nodes];
    (
        Tensor::<B, 1>::from_floats(send.as_slice(), device).reshape(shape),
        Tensor::<B, 1>::from_floats(recv.as_slice(), device).reshape(shape),
    )
}

/// Relaxed categorical sample over the last dimension
pub fn gumbel_softmax<B: Backend>(logits: Tensor<B, 3>, tau: f64) -> Tensor<B, 3> {
    let eps = 1e-10;
    let uniform = Tensor::random(logits.shape(), Distribution::Uniform(0.0, 1.0), &logits.device());
    let gumbel = ((uniform + eps).log().neg() + eps).log().neg();
    softmax((logits + gumbel).div_scalar(tau), 2)
}

/// Configuration for the learned-graph forecaster
#[derive(Debug, Clone)]
pub struct GraphForecasterConfig {
    /// Features per node
    pub node_features: usize,
    /// Weather covariates appended to every node's input
    pub covariate_dim: usize,
    /// Width of the edge encoder MLPs
    pub encoder_hidden: usize,
    /// Relation types scored per directed edge
    pub n_edge_types: usize,
    /// Gumbel-softmax temperature, also used to sharpen evaluation softmax
    pub gumbel_tau: f64,
    pub dropout: f64,
    /// Decoder run over the inferred edges
    pub decoder: DecoderConfig,
}

impl GraphForecasterConfig {
    pub fn new(shape: SeriesShape, model: &ModelConfig, dropout: f64) -> Self {
        GraphForecasterConfig {
            node_features: shape.node_features,
            covariate_dim: shape.covariate_dim,
            encoder_hidden: model.enc_n_hid,
            n_edge_types: model.n_edge_types,
            gumbel_tau: model.gumbel_tau,
            dropout,
            decoder: DecoderConfig::new(shape, model, model.n_edge_types, dropout),
        }
    }
}

/// Scores every directed edge from the nodes' known history
///
/// Node embeddings are averaged over the known steps, so the encoder accepts
/// any prefix length and never reads the steps being predicted.
#[derive(Module, Debug)]
pub struct EdgeEncoder<B: Backend> {
    node_fc1: Linear<B>,
    node_fc2: Linear<B>,
    edge_fc1: Linear<B>,
    edge_fc2: Linear<B>,
    out: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> EdgeEncoder<B> {
    pub fn new(device: &B::Device, config: &GraphForecasterConfig) -> Self {
        let input = config.node_features + config.covariate_dim;
        let hidden = config.encoder_hidden;
        EdgeEncoder {
            node_fc1: LinearConfig::new(input, hidden).init(device),
            node_fc2: LinearConfig::new(hidden, hidden).init(device),
            edge_fc1: LinearConfig::new(2 * hidden, hidden).init(device),
            edge_fc2: LinearConfig::new(hidden, hidden).init(device),
            out: LinearConfig::new(hidden, config.n_edge_types).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
        }
    }

    /// Edge-type logits `[batch, edges, edge_types]`
    pub fn forward(
        &self,
        observations: Tensor<B, 4>,
        covariates: Tensor<B, 3>,
        known_steps: usize,
    ) -> Tensor<B, 3> {
        let [batch, _, num_nodes, features] = observations.dims();
        let covariate_dim = covariates.dims()[2];

        let known = observations.slice([0..batch, 0..known_steps, 0..num_nodes, 0..features]);
        let weather = covariates
            .slice([0..batch, 0..known_steps, 0..covariate_dim])
            .unsqueeze_dim::<4>(2)
            .repeat_dim(2, num_nodes);
        let x = Tensor::cat(vec![known, weather], 3);

        let x = relu(self.node_fc1.forward(x));
        let x = relu(self.node_fc2.forward(self.dropout.forward(x)));
        let hidden = x.dims()[3];
        let nodes = x.mean_dim(1).reshape([batch, num_nodes, hidden]);

        let device = nodes.device();
        let (send, recv) = relation_matrices::<B>(num_nodes, &device);
        let send = send.unsqueeze::<3>().repeat_dim(0, batch).matmul(nodes.clone());
        let recv = recv.unsqueeze::<3>().repeat_dim(0, batch).matmul(nodes);

        let e = Tensor::cat(vec![send, recv], 2);
        let e = relu(self.edge_fc1.forward(e));
        let e = relu(self.edge_fc2.forward(self.dropout.forward(e)));
        self.out.forward(e)
    }
}

/// Infers a relation type per edge, then decodes with message passing
#[derive(Module, Debug)]
pub struct GraphForecaster<B: Backend> {
    encoder: EdgeEncoder<B>,
    decoder: MessagePassingDecoder<B>,
    gumbel_tau: f64,
}

impl<B: Backend> GraphForecaster<B> {
    pub fn new(device: &B::Device, config: GraphForecasterConfig) -> Self {
        GraphForecaster {
            encoder: EdgeEncoder::new(device, &config),
            decoder: MessagePassingDecoder::new(device, config.decoder.clone()),
            gumbel_tau: config.gumbel_tau,
        }
    }

    pub fn encoder(&self) -> &EdgeEncoder<B> {
        &self.encoder
    }
}

impl<B: Backend> BurnInForecaster<B> for GraphForecaster<B> {
    fn forward_burn_in(
        &self,
        observations: Tensor<B, 4>,
        covariates: Tensor<B, 3>,
        known_steps: usize,
    ) -> Forecast<B> {
        let logits = self
            .encoder
            .forward(observations.clone(), covariates.clone(), known_steps);
        let edge_probs = softmax(logits.clone(), 2);

        // Sampled edges while training, their expectation otherwise
        let edges = if B::ad_enabled() {
            gumbel_softmax(logits, self.gumbel_tau)
        } else {
            softmax(logits.div_scalar(self.gumbel_tau), 2)
        };

        let predictions = self
            .decoder
            .forward(observations, covariates, edges, known_steps);

        Forecast {
            predictions,
            auxiliary: AuxiliaryTerms::empty().with(EDGE_PROBS, edge_probs),
        }
    }
}

impl<B: AutodiffBackend> EncoderGradients<B> for GraphForecaster<B> {
    fn encoder_grads(&self, grads: &mut B::Gradients) -> Option<GradientsParams> {
        Some(GradientsParams::from_module(grads, &self.encoder))
    }
}
