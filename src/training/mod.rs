//! Model training
//!
//! Generic burn-in training loop, losses, annealing and metrics tracking.

pub mod annealing;
pub mod loss;
pub mod metrics;
pub mod trainer;

pub use annealing::AnnealingSchedule;
pub use loss::{AuxiliaryRegularizer, KlCategorical, NoRegularizer, ReconstructionLoss};
pub use metrics::{EpochMetrics, MetricHistory, TrainingPhase, TrainingState};
pub use trainer::{EpochReport, LoopSettings, TrainingLoop};
