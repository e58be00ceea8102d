//! Message passing over a known adjacency matrix

use burn::module::{Ignored, Module};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

use super::decoder::{DecoderConfig, MessagePassingDecoder};
use super::graph::edge_pairs;
use super::{AuxiliaryTerms, BurnInForecaster, EncoderGradients, Forecast};
use crate::data::SeriesShape;
use crate::{ModelConfig, Result, TrafficError};

/// Decoder over fixed "no edge" / "edge" relation types
///
/// The adjacency matrix is not part of the parameter record. Checkpoints
/// keep it in their manifest and hand it back when the model is rebuilt.
#[derive(Module, Debug)]
pub struct FixedGraphForecaster<B: Backend> {
    decoder: MessagePassingDecoder<B>,
    adjacency: Ignored<Vec<f32>>,
    num_nodes: usize,
}

impl<B: Backend> FixedGraphForecaster<B> {
    /// `adjacency` is a row-major `[nodes, nodes]` matrix, nonzero meaning
    /// the column node sends to the row node
    pub fn new(
        device: &B::Device,
        shape: SeriesShape,
        model: &ModelConfig,
        dropout: f64,
        adjacency: Vec<f32>,
    ) -> Result<Self> {
        let num_nodes = shape.num_nodes;
        if adjacency.len() != num_nodes * num_nodes {
            return Err(TrafficError::DataShape(format!(
                "adjacency has {} entries, expected {}x{}",
                adjacency.len(),
                num_nodes,
                num_nodes
            )));
        }

        let config = DecoderConfig::new(shape, model, 2, dropout);
        Ok(FixedGraphForecaster {
            decoder: MessagePassingDecoder::new(device, config),
            adjacency: Ignored(adjacency),
            num_nodes,
        })
    }

    /// Row-major `[nodes, nodes]` adjacency the model was built with
    pub fn adjacency(&self) -> &[f32] {
        &self.adjacency.0
    }

    /// Number of directed edges present in the adjacency matrix
    pub fn num_edges(&self) -> usize {
        edge_pairs(self.num_nodes)
            .into_iter()
            .filter(|&(r, s)| self.adjacency.0[r * self.num_nodes + s] > 0.0)
            .count()
    }

    /// One-hot edge types `[batch, edges, 2]`
    fn edge_types(&self, batch: usize, device: &B::Device) -> Tensor<B, 3> {
        let pairs = edge_pairs(self.num_nodes);
        let values: Vec<f32> = pairs
            .iter()
            .flat_map(|&(r, s)| {
                if self.adjacency.0[r * self.num_nodes + s] > 0.0 {
                    [0.0, 1.0]
                } else {
                    [1.0, 0.0]
                }
            })
            .collect();

        Tensor::<B, 1>::from_floats(values.as_slice(), device)
            .reshape([1, pairs.len(), 2])
            .repeat_dim(0, batch)
    }
}

impl<B: AutodiffBackend> EncoderGradients<B> for FixedGraphForecaster<B> {}

impl<B: Backend> BurnInForecaster<B> for FixedGraphForecaster<B> {
    fn forward_burn_in(
        &self,
        observations: Tensor<B, 4>,
        covariates: Tensor<B, 3>,
        known_steps: usize,
    ) -> Forecast<B> {
        let [batch, _, num_nodes, _] = observations.dims();
        debug_assert_eq!(num_nodes, self.num_nodes);
        let edges = self.edge_types(batch, &observations.device());

        Forecast {
            predictions: self
                .decoder
                .forward(observations, covariates, edges, known_steps),
            auxiliary: AuxiliaryTerms::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_model() -> ModelConfig {
        ModelConfig {
            dec_n_hid: 4,
            dec_msg_hid: 4,
            dec_gru_hid: 4,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_fixed_graph_forecast() {
        let device = Default::default();
        #[rustfmt::skip]
        let adjacency = vec![
            0.0, 1.0, 0.0,
            1.0, 0.0, 1.0,
            0.0, 1.0, 0.0,
        ];
        let model = FixedGraphForecaster::<TestBackend>::new(
            &device,
            SeriesShape::new(3, 1, 2),
            &small_model(),
            0.0,
            adjacency,
        )
        .unwrap();
        assert_eq!(model.num_edges(), 4);

        let observations = Tensor::<TestBackend, 4>::ones([2, 8, 3, 1], &device);
        let covariates = Tensor::<TestBackend, 3>::zeros([2, 8, 2], &device);
        let forecast = model.forward_burn_in(observations, covariates, 5);

        assert_eq!(forecast.predictions.dims(), [2, 3, 3, 1]);
        assert!(forecast.auxiliary.is_empty());
    }

    #[test]
    fn test_adjacency_size_mismatch() {
        let device = Default::default();
        let result = FixedGraphForecaster::<TestBackend>::new(
            &device,
            SeriesShape::new(3, 1, 2),
            &small_model(),
            0.0,
            vec![0.0; 4],
        );
        assert!(matches!(result, Err(TrafficError::DataShape(_))));
    }
}
