//! Forecasting models behind a shared burn-in interface
//!
//! - LSTM: one recurrent cell shared by every node
//! - Graph: message passing over edges inferred per window
//! - Fixed graph: message passing over a given adjacency matrix

pub mod decoder;
pub mod fixed_graph;
pub mod graph;
pub mod lstm;

use std::collections::BTreeMap;

use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

pub use decoder::{DecoderConfig, MessagePassingDecoder};
pub use fixed_graph::FixedGraphForecaster;
pub use graph::{GraphForecaster, GraphForecasterConfig};
pub use lstm::{LstmForecaster, LstmForecasterConfig};

/// Key under which graph models expose their edge-type probabilities
pub const EDGE_PROBS: &str = "edge_probs";

/// Named model-specific tensors handed to the loss regularizer
///
/// Every term is `[batch, items, categories]`.
#[derive(Debug, Clone)]
pub struct AuxiliaryTerms<B: Backend> {
    terms: BTreeMap<String, Tensor<B, 3>>,
}

impl<B: Backend> AuxiliaryTerms<B> {
    pub fn empty() -> Self {
        AuxiliaryTerms {
            terms: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, term: Tensor<B, 3>) -> Self {
        self.terms.insert(name.to_string(), term);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tensor<B, 3>> {
        self.terms.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.terms.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Output of a burn-in forward pass
#[derive(Debug, Clone)]
pub struct Forecast<B: Backend> {
    /// `[batch, split_len - known_steps, nodes, features]`, covering window
    /// positions `known_steps..split_len`
    pub predictions: Tensor<B, 4>,
    pub auxiliary: AuxiliaryTerms<B>,
}

/// A model that reads a known prefix of each window and rolls out the rest
///
/// The first `known_steps` observations are fed as ground truth. Every later
/// step consumes the model's own previous prediction. The prediction for
/// position `t` is made from the input at `t - 1`.
pub trait BurnInForecaster<B: Backend> {
    /// * `observations` - `[batch, split_len, nodes, features]`
    /// * `covariates` - `[batch, split_len, covariate_dim]`
    fn forward_burn_in(
        &self,
        observations: Tensor<B, 4>,
        covariates: Tensor<B, 3>,
        known_steps: usize,
    ) -> Forecast<B>;
}

/// Parameters trained at a reduced learning rate
///
/// Models with an edge encoder pull its gradients out of `grads` so the
/// training loop can step them separately; the rest stay in `grads`.
pub trait EncoderGradients<B: AutodiffBackend> {
    fn encoder_grads(&self, _grads: &mut B::Gradients) -> Option<GradientsParams> {
        None
    }
}

/// Broadcast per-step covariates to every node: `[batch, nodes, covariate_dim]`
pub(crate) fn covariates_per_node<B: Backend>(covariates: Tensor<B, 2>, num_nodes: usize) -> Tensor<B, 3> {
    covariates.unsqueeze_dim::<3>(1).repeat_dim(1, num_nodes)
}
