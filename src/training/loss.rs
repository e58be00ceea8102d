//! Reconstruction losses and auxiliary regularizers

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::model::{AuxiliaryTerms, EDGE_PROBS};
use crate::{LossConfig, LossKind};

/// Error between predicted and observed steps
#[derive(Debug, Clone, Copy)]
pub struct ReconstructionLoss {
    kind: LossKind,
    variance: f64,
}

impl ReconstructionLoss {
    pub fn new(config: &LossConfig) -> Self {
        ReconstructionLoss {
            kind: config.kind,
            variance: config.nll_variance,
        }
    }

    pub fn kind(&self) -> LossKind {
        self.kind
    }

    /// Loss over `[batch, steps, nodes, features]` tensors
    ///
    /// `nll` is the Gaussian negative log-likelihood with fixed variance,
    /// summed and divided by `batch * nodes`.
    pub fn forward<B: Backend>(&self, predictions: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        match self.kind {
            LossKind::Mse => mse(predictions, targets),
            LossKind::Nll => {
                let [batch, _, nodes, _] = predictions.dims();
                let squared = (predictions - targets).powf_scalar(2.0);
                squared
                    .div_scalar(2.0 * self.variance)
                    .sum()
                    .div_scalar((batch * nodes) as f64)
            }
        }
    }
}

pub fn mse<B: Backend>(predictions: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
    (predictions - targets).powf_scalar(2.0).mean()
}

/// Penalty computed from a model's auxiliary terms
pub trait AuxiliaryRegularizer<B: Backend> {
    /// `None` when the terms it needs are absent
    fn penalty(&self, auxiliary: &AuxiliaryTerms<B>) -> Option<Tensor<B, 1>>;
}

/// For models without a latent structure
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRegularizer;

impl<B: Backend> AuxiliaryRegularizer<B> for NoRegularizer {
    fn penalty(&self, _auxiliary: &AuxiliaryTerms<B>) -> Option<Tensor<B, 1>> {
        None
    }
}

/// KL divergence of the edge-type probabilities from a sparse prior
///
/// The prior gives `1 - edge_rate` to type 0 and splits `edge_rate` over the
/// remaining types.
#[derive(Debug, Clone)]
pub struct KlCategorical {
    log_prior: Vec<f32>,
    num_nodes: usize,
}

impl KlCategorical {
    const EPS: f64 = 1e-16;

    pub fn new(edge_rate: f64, n_edge_types: usize, num_nodes: usize) -> Self {
        let others = (n_edge_types.max(2) - 1) as f64;
        let log_prior = std::iter::once(1.0 - edge_rate)
            .chain(std::iter::repeat(edge_rate / others).take(n_edge_types.max(2) - 1))
            .map(|p| p.ln() as f32)
            .collect();
        KlCategorical {
            log_prior,
            num_nodes,
        }
    }

    pub fn log_prior(&self) -> &[f32] {
        &self.log_prior
    }

    /// KL term for probabilities `[batch, edges, edge_types]`
    pub fn divergence<B: Backend>(&self, probs: Tensor<B, 3>) -> Tensor<B, 1> {
        let [batch, edges, types] = probs.dims();
        let log_prior = Tensor::<B, 1>::from_floats(self.log_prior.as_slice(), &probs.device())
            .reshape([1, 1, types])
            .repeat_dim(0, batch)
            .repeat_dim(1, edges);

        let kl = probs.clone() * ((probs + Self::EPS).log() - log_prior);
        kl.sum().div_scalar((self.num_nodes * batch) as f64)
    }
}

impl<B: Backend> AuxiliaryRegularizer<B> for KlCategorical {
    fn penalty(&self, auxiliary: &AuxiliaryTerms<B>) -> Option<Tensor<B, 1>> {
        auxiliary
            .get(EDGE_PROBS)
            .map(|probs| self.divergence(probs.clone()))
    }
}
