//! Taxi demand forecasting with burn-in sequence models
//!
//! Trains recurrent and graph message-passing models on gridded pickup/dropoff
//! counts plus weather covariates. The models see a short known history
//! (the burn-in) and must roll out the rest of each window on their own.

pub mod data;
pub mod experiment;
pub mod model;
pub mod predict;
pub mod training;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Application-wide errors
#[derive(Debug, Error)]
pub enum TrafficError {
    /// Invalid or mutually inconsistent settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Mismatched series lengths/dimensions or undefined values in the input
    #[error("Data shape error: {0}")]
    DataShape(String),

    /// Failure reported by the numeric backend while training or evaluating
    #[error("Device compute error in epoch {epoch}: {message}")]
    DeviceCompute { epoch: usize, message: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("NPY read error: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrafficError>;

fn ensure(condition: bool, message: impl Into<String>) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(TrafficError::Configuration(message.into()))
    }
}

/// Which forecaster to train
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Shared LSTM over each node's series
    Lstm,
    /// Message passing over an edge structure inferred per window
    Graph,
    /// Message passing over an adjacency matrix loaded from disk
    FixedGraph,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Lstm => write!(f, "lstm"),
            ModelKind::Graph => write!(f, "graph"),
            ModelKind::FixedGraph => write!(f, "fixed_graph"),
        }
    }
}

impl std::str::FromStr for ModelKind {
    type Err = TrafficError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lstm" => Ok(ModelKind::Lstm),
            "graph" | "nri" => Ok(ModelKind::Graph),
            "fixed_graph" | "fixed" => Ok(ModelKind::FixedGraph),
            _ => Err(TrafficError::Configuration(format!(
                "Unknown model kind: {}. Use lstm, graph or fixed_graph.",
                s
            ))),
        }
    }
}

/// Reconstruction loss over the predicted steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    Mse,
    /// Gaussian negative log-likelihood with a fixed variance
    Nll,
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossKind::Mse => write!(f, "mse"),
            LossKind::Nll => write!(f, "nll"),
        }
    }
}

impl std::str::FromStr for LossKind {
    type Err = TrafficError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mse" => Ok(LossKind::Mse),
            "nll" => Ok(LossKind::Nll),
            _ => Err(TrafficError::Configuration(format!(
                "Unknown loss kind: {}. Use mse or nll.",
                s
            ))),
        }
    }
}

/// Shape of the regularizer weight over training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnealingPolicy {
    /// Ramp up once, then hold
    Monotonic,
    /// Restart the ramp every period
    Cyclical,
}

/// What the annealing step counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnealCounter {
    /// Epoch index, cumulative over the run
    Epoch,
    /// Optimizer steps, cumulative over the run
    GlobalStep,
    /// Optimizer steps, reset at the start of every epoch
    EpochStep,
}

/// Compute device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Cpu,
    Wgpu,
}

impl std::str::FromStr for DeviceKind {
    type Err = TrafficError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cpu" | "ndarray" => Ok(DeviceKind::Cpu),
            "wgpu" | "gpu" => Ok(DeviceKind::Wgpu),
            _ => Err(TrafficError::Configuration(format!(
                "Unknown device: {}. Use cpu or wgpu.",
                s
            ))),
        }
    }
}

/// Application configuration loaded from config.toml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub training: TrainingConfig,
    pub data: DataConfig,
    pub model: ModelConfig,
    pub loss: LossConfig,
    pub annealing: AnnealingConfig,
    pub experiment: ExperimentConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub n_epochs: usize,
    pub dropout_p: f64,
    pub shuffle_train: bool,
    pub shuffle_test: bool,
    pub learning_rate: f64,
    /// Epochs between learning-rate decays
    pub lr_decay_step: usize,
    pub lr_decay_gamma: f64,
    pub weight_decay: f64,
    /// Graph encoder learning rate as a fraction of `learning_rate`
    pub encoder_lr_frac: f64,
    /// Evaluate on the test windows every this many epochs
    pub eval_every: usize,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            batch_size: 25,
            n_epochs: 100,
            dropout_p: 0.0,
            shuffle_train: true,
            shuffle_test: false,
            learning_rate: 1e-3,
            lr_decay_step: 100,
            lr_decay_gamma: 0.5,
            weight_decay: 0.0,
            encoder_lr_frac: 1.0,
            eval_every: 10,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub pickup_path: String,
    pub dropoff_path: Option<String>,
    pub weather_path: String,
    /// Weather columns used as covariates, in order
    pub covariate_columns: Vec<String>,
    /// Index of the timestamp column in the weather file
    pub timestamp_column: usize,
    pub normalize: bool,
    pub train_frac: f64,
    pub split_len: usize,
    pub burn_in_steps: usize,
    /// When false the models only see the first step of each window
    pub burn_in: bool,
    /// Drop test windows that share timestamps with the last training window
    pub purge_overlap: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            pickup_path: "data/procdata/full_year_manhattan_vector_pickup.npy".to_string(),
            dropoff_path: Some("data/procdata/full_year_manhattan_vector_dropoff.npy".to_string()),
            weather_path: "data/procdata/LGA_weather_full_2019.csv".to_string(),
            covariate_columns: vec!["temperature".to_string(), "precipDepth".to_string()],
            timestamp_column: 0,
            normalize: true,
            train_frac: 0.8,
            split_len: 40,
            burn_in_steps: 30,
            burn_in: true,
            purge_overlap: false,
        }
    }
}

impl DataConfig {
    pub fn pred_steps(&self) -> usize {
        self.split_len.saturating_sub(self.burn_in_steps)
    }

    /// Number of leading ground-truth steps fed to the model
    pub fn known_steps(&self) -> usize {
        if self.burn_in {
            self.burn_in_steps
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub kind: ModelKind,
    pub lstm_hid: usize,
    pub enc_n_hid: usize,
    pub n_edge_types: usize,
    pub dec_n_hid: usize,
    pub dec_msg_hid: usize,
    pub dec_gru_hid: usize,
    /// Prior probability of an edge being present
    pub edge_rate: f64,
    pub gumbel_tau: f64,
    /// Treat edge type 0 as "no edge" and send no messages along it
    pub skip_first_edge: bool,
    pub fixed_adj_matrix_path: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            kind: ModelKind::Lstm,
            lstm_hid: 128,
            enc_n_hid: 128,
            n_edge_types: 2,
            dec_n_hid: 16,
            dec_msg_hid: 8,
            dec_gru_hid: 8,
            edge_rate: 0.01,
            gumbel_tau: 0.5,
            skip_first_edge: true,
            fixed_adj_matrix_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub kind: LossKind,
    pub nll_variance: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig {
            kind: LossKind::Mse,
            nll_variance: 5e-5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnealingConfig {
    pub policy: AnnealingPolicy,
    pub target_max: f64,
    pub ramp_steps: usize,
    /// Cycle length, only used by the cyclical policy
    pub period: usize,
    pub counter: AnnealCounter,
}

impl Default for AnnealingConfig {
    fn default() -> Self {
        AnnealingConfig {
            policy: AnnealingPolicy::Monotonic,
            target_max: 1.0,
            ramp_steps: 1,
            period: 100,
            counter: AnnealCounter::Epoch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub name: String,
    pub models_dir: String,
    pub device: DeviceKind,
    pub gpu_index: Option<usize>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            name: "experiment".to_string(),
            models_dir: "models".to_string(),
            device: DeviceKind::Cpu,
            gpu_index: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrafficError::Configuration(format!("Failed to read config file {}: {}", path, e))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| TrafficError::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            TrafficError::Configuration(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check every option against its legal range
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        ensure(t.batch_size >= 1, "training.batch_size must be at least 1")?;
        ensure(
            (0.0..1.0).contains(&t.dropout_p),
            format!("training.dropout_p must be in [0, 1), got {}", t.dropout_p),
        )?;
        ensure(
            t.learning_rate > 0.0,
            format!("training.learning_rate must be positive, got {}", t.learning_rate),
        )?;
        ensure(t.lr_decay_step >= 1, "training.lr_decay_step must be at least 1")?;
        ensure(
            t.lr_decay_gamma > 0.0 && t.lr_decay_gamma <= 1.0,
            format!("training.lr_decay_gamma must be in (0, 1], got {}", t.lr_decay_gamma),
        )?;
        ensure(t.weight_decay >= 0.0, "training.weight_decay must not be negative")?;
        ensure(
            t.encoder_lr_frac > 0.0,
            format!("training.encoder_lr_frac must be positive, got {}", t.encoder_lr_frac),
        )?;
        ensure(t.eval_every >= 1, "training.eval_every must be at least 1")?;

        let d = &self.data;
        ensure(
            d.train_frac > 0.0 && d.train_frac < 1.0,
            format!("data.train_frac must be in (0, 1), got {}", d.train_frac),
        )?;
        ensure(
            d.split_len >= 2,
            format!("data.split_len must be at least 2, got {}", d.split_len),
        )?;
        ensure(d.burn_in_steps >= 1, "data.burn_in_steps must be at least 1")?;
        ensure(
            d.burn_in_steps < d.split_len,
            format!(
                "data.burn_in_steps ({}) must be smaller than data.split_len ({})",
                d.burn_in_steps, d.split_len
            ),
        )?;
        ensure(
            !d.covariate_columns.is_empty(),
            "data.covariate_columns must name at least one column",
        )?;

        let m = &self.model;
        ensure(
            m.lstm_hid >= 1
                && m.enc_n_hid >= 1
                && m.dec_n_hid >= 1
                && m.dec_msg_hid >= 1
                && m.dec_gru_hid >= 1,
            "model hidden sizes must be at least 1",
        )?;
        ensure(
            m.n_edge_types >= 2,
            format!("model.n_edge_types must be at least 2, got {}", m.n_edge_types),
        )?;
        ensure(
            m.edge_rate > 0.0 && m.edge_rate < 1.0,
            format!("model.edge_rate must be in (0, 1), got {}", m.edge_rate),
        )?;
        ensure(m.gumbel_tau > 0.0, "model.gumbel_tau must be positive")?;
        if m.kind == ModelKind::FixedGraph {
            ensure(
                m.fixed_adj_matrix_path.is_some(),
                "model.fixed_adj_matrix_path is required for the fixed_graph model",
            )?;
        }

        ensure(
            self.loss.nll_variance > 0.0,
            "loss.nll_variance must be positive",
        )?;

        let a = &self.annealing;
        ensure(a.target_max >= 0.0, "annealing.target_max must not be negative")?;
        ensure(a.ramp_steps >= 1, "annealing.ramp_steps must be at least 1")?;
        ensure(a.period >= 1, "annealing.period must be at least 1")?;

        ensure(
            !self.experiment.name.trim().is_empty(),
            "experiment.name must not be empty",
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_burn_in_must_be_shorter_than_split() {
        let mut config = Config::default();
        config.data.burn_in_steps = config.data.split_len;
        assert!(matches!(
            config.validate(),
            Err(TrafficError::Configuration(_))
        ));
    }

    #[test]
    fn test_train_frac_range() {
        let mut config = Config::default();
        config.data.train_frac = 1.0;
        assert!(config.validate().is_err());
        config.data.train_frac = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_encoder_lr_frac_must_be_positive() {
        let mut config = Config::default();
        assert_eq!(config.training.encoder_lr_frac, 1.0);
        config.training.encoder_lr_frac = 0.0;
        assert!(config.validate().is_err());
        config.training.encoder_lr_frac = 0.1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fixed_graph_requires_adjacency() {
        let mut config = Config::default();
        config.model.kind = ModelKind::FixedGraph;
        assert!(config.validate().is_err());
        config.model.fixed_adj_matrix_path = Some("adj.npy".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_loss_kind() {
        assert!(matches!(
            "huber".parse::<LossKind>(),
            Err(TrafficError::Configuration(_))
        ));
        assert_eq!("NLL".parse::<LossKind>().unwrap(), LossKind::Nll);
    }

    #[test]
    fn test_toml_roundtrip_with_partial_sections() {
        let text = r#"
            [data]
            split_len = 12
            burn_in_steps = 8

            [annealing]
            policy = "cyclical"
            period = 20
            ramp_steps = 10
            counter = "global_step"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.data.split_len, 12);
        assert_eq!(config.data.pred_steps(), 4);
        assert_eq!(config.annealing.policy, AnnealingPolicy::Cyclical);
        assert_eq!(config.annealing.counter, AnnealCounter::GlobalStep);
        assert_eq!(config.training.batch_size, 25);
        config.validate().unwrap();
    }

    #[test]
    fn test_known_steps_without_burn_in() {
        let mut config = Config::default();
        assert_eq!(config.data.known_steps(), 30);
        config.data.burn_in = false;
        assert_eq!(config.data.known_steps(), 1);
    }
}
