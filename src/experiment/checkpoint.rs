//! Persisted model parameters plus everything needed to reproduce them
//!
//! A checkpoint is two files in the experiment folder: `model.mpk` holds the
//! parameters (burn named MessagePack record) and `checkpoint.json` holds the
//! resolved configuration, the metric history and the normalization stats.
//! Fixed-graph models also store their adjacency matrix there, so restoring
//! one never depends on the original adjacency file.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::Backend;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::data::{NormalizationStats, SeriesShape, WindowedSplit};
use crate::training::{MetricHistory, TrainingPhase, TrainingState};
use crate::{Config, ModelKind, Result, TrafficError};

pub const MODEL_FILE: &str = "model";
pub const MANIFEST_FILE: &str = "checkpoint.json";

/// Self-describing metadata stored next to the parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub format_version: u32,
    pub created_at: String,
    pub experiment: String,
    pub model_kind: ModelKind,
    pub config: Config,
    pub shape: SeriesShape,
    pub normalization: Option<NormalizationStats>,
    pub series_start: Option<NaiveDateTime>,
    pub series_end: Option<NaiveDateTime>,
    pub train_windows: usize,
    pub test_windows: usize,
    pub phase: TrainingPhase,
    pub global_step: usize,
    pub history: MetricHistory,
    /// Row-major `[nodes, nodes]` matrix of a fixed-graph model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_adjacency: Option<Vec<f32>>,
}

impl CheckpointManifest {
    pub const FORMAT_VERSION: u32 = 1;

    pub fn new(experiment: &str, config: &Config, split: &WindowedSplit, state: &TrainingState) -> Self {
        let timestamps = split.series().timestamps();
        CheckpointManifest {
            format_version: Self::FORMAT_VERSION,
            created_at: chrono::Local::now().to_rfc3339(),
            experiment: experiment.to_string(),
            model_kind: config.model.kind,
            config: config.clone(),
            shape: split.shape(),
            normalization: split.stats().cloned(),
            series_start: timestamps.first().copied(),
            series_end: timestamps.last().copied(),
            train_windows: split.train().len(),
            test_windows: split.test().len(),
            phase: state.phase,
            global_step: state.global_step,
            history: state.history.clone(),
            fixed_adjacency: None,
        }
    }

    pub fn with_fixed_adjacency(mut self, adjacency: Vec<f32>) -> Self {
        self.fixed_adjacency = Some(adjacency);
        self
    }

    /// Adjacency to rebuild a fixed-graph model with
    pub fn require_fixed_adjacency(&self) -> Result<&[f32]> {
        self.fixed_adjacency.as_deref().ok_or_else(|| {
            TrafficError::Checkpoint(format!(
                "experiment {} has no stored adjacency matrix",
                self.experiment
            ))
        })
    }

    /// Whether training ran to completion before this checkpoint was written
    pub fn is_complete(&self) -> bool {
        self.phase == TrainingPhase::Finalized
    }
}

/// Writes and reads experiment checkpoints
pub struct ExperimentCheckpoint;

impl ExperimentCheckpoint {
    /// Write the model record and the manifest into `dir`
    ///
    /// The manifest is written to a temporary file first and renamed into
    /// place, so a reader never sees a half-written manifest.
    pub fn save<B, M>(model: &M, manifest: &CheckpointManifest, dir: impl AsRef<Path>) -> Result<PathBuf>
    where
        B: Backend,
        M: Module<B>,
        B::FloatElem: Serialize + serde::de::DeserializeOwned,
        B::IntElem: Serialize + serde::de::DeserializeOwned,
    {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        recorder
            .record(model.clone().into_record(), dir.join(MODEL_FILE))
            .map_err(|e| TrafficError::Checkpoint(format!("failed to write model record: {}", e)))?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let tmp_path = dir.join(format!("{}.tmp", MANIFEST_FILE));
        fs::write(&tmp_path, serde_json::to_string_pretty(manifest)?)?;
        fs::rename(&tmp_path, &manifest_path)?;

        log::info!(
            "Checkpoint saved at {} ({} epochs, phase {:?})",
            dir.display(),
            manifest.history.epochs(),
            manifest.phase
        );
        Ok(manifest_path)
    }

    pub fn load_manifest(dir: impl AsRef<Path>) -> Result<CheckpointManifest> {
        let path = dir.as_ref().join(MANIFEST_FILE);
        let content = fs::read_to_string(&path).map_err(|e| {
            TrafficError::Checkpoint(format!("cannot read {}: {}", path.display(), e))
        })?;
        let manifest: CheckpointManifest = serde_json::from_str(&content)?;
        if manifest.format_version != CheckpointManifest::FORMAT_VERSION {
            return Err(TrafficError::Checkpoint(format!(
                "unsupported checkpoint format {} (expected {})",
                manifest.format_version,
                CheckpointManifest::FORMAT_VERSION
            )));
        }
        Ok(manifest)
    }

    /// Load saved parameters into a freshly built `template` of the same architecture
    pub fn load_model<B, M>(template: M, dir: impl AsRef<Path>, device: &B::Device) -> Result<M>
    where
        B: Backend,
        M: Module<B>,
        B::FloatElem: Serialize + serde::de::DeserializeOwned,
        B::IntElem: Serialize + serde::de::DeserializeOwned,
    {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let record = recorder
            .load(dir.as_ref().join(MODEL_FILE), device)
            .map_err(|e| TrafficError::Checkpoint(format!("failed to read model record: {}", e)))?;
        Ok(template.load_record(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{RawSeries, SplitConfig};
    use crate::model::{
        BurnInForecaster, FixedGraphForecaster, LstmForecaster, LstmForecasterConfig,
    };
    use burn::backend::NdArray;
    use burn::tensor::Tensor;
    use chrono::NaiveDate;

    type TestBackend = NdArray<f32>;

    fn split(config: &Config) -> WindowedSplit {
        let start = NaiveDate::from_ymd_opt(2019, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let obs = (0..30).map(|i| i as f32).collect();
        let series = RawSeries::hourly(start, obs, vec![0.0; 30], SeriesShape::new(1, 1, 1)).unwrap();
        WindowedSplit::build(series, &SplitConfig::from(&config.data)).unwrap()
    }

    #[test]
    fn test_save_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();

        let mut config = Config::default();
        config.data.split_len = 6;
        config.data.burn_in_steps = 3;
        config.model.lstm_hid = 4;
        let data = split(&config);

        let mut state = TrainingState::new();
        state.history.train_loss = vec![0.3, 0.2];
        state.phase = TrainingPhase::Finalized;

        let lstm_config = LstmForecasterConfig::new(data.shape(), &config.model, 0.0);
        let model = LstmForecaster::<TestBackend>::new(&device, lstm_config.clone());
        let manifest = CheckpointManifest::new("unit", &config, &data, &state);
        ExperimentCheckpoint::save(&model, &manifest, dir.path()).unwrap();

        let loaded = ExperimentCheckpoint::load_manifest(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
        assert!(loaded.is_complete());
        assert_eq!(loaded.config.data.split_len, 6);
        assert_eq!(loaded.normalization.as_ref().unwrap().max, vec![data.stats().unwrap().max[0]]);

        let template = LstmForecaster::<TestBackend>::new(&device, lstm_config);
        let restored = ExperimentCheckpoint::load_model(template, dir.path(), &device).unwrap();

        let observations = Tensor::<TestBackend, 4>::ones([1, 6, 1, 1], &device);
        let covariates = Tensor::<TestBackend, 3>::zeros([1, 6, 1], &device);
        let a = model.forward_burn_in(observations.clone(), covariates.clone(), 3);
        let b = restored.forward_burn_in(observations, covariates, 3);
        assert_eq!(
            a.predictions.into_data().to_vec::<f32>().unwrap(),
            b.predictions.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_diverged_history_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();

        let mut config = Config::default();
        config.data.split_len = 6;
        config.data.burn_in_steps = 3;
        config.model.lstm_hid = 2;
        let data = split(&config);

        let mut state = TrainingState::new();
        state.phase = TrainingPhase::Epoch(2);
        state.history.train_loss = vec![0.3, f64::NAN];
        state.history.test_epochs = vec![0];
        state.history.test_loss = vec![f64::INFINITY];

        let model = LstmForecaster::<TestBackend>::new(
            &device,
            LstmForecasterConfig::new(data.shape(), &config.model, 0.0),
        );
        let manifest = CheckpointManifest::new("diverged", &config, &data, &state);
        ExperimentCheckpoint::save(&model, &manifest, dir.path()).unwrap();

        let loaded = ExperimentCheckpoint::load_manifest(dir.path()).unwrap();
        assert!(!loaded.is_complete());
        assert_eq!(loaded.history.train_loss[0], 0.3);
        assert!(loaded.history.train_loss[1].is_nan());
        assert_eq!(loaded.history.test_loss, vec![f64::INFINITY]);
    }

    #[test]
    fn test_fixed_adjacency_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();

        let mut config = Config::default();
        config.data.split_len = 6;
        config.data.burn_in_steps = 3;
        config.model.dec_n_hid = 2;
        config.model.dec_msg_hid = 2;
        config.model.dec_gru_hid = 2;
        let start = NaiveDate::from_ymd_opt(2019, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let obs = (0..60).map(|i| i as f32).collect();
        let series = RawSeries::hourly(start, obs, vec![0.0; 30], SeriesShape::new(2, 1, 1)).unwrap();
        let data = WindowedSplit::build(series, &SplitConfig::from(&config.data)).unwrap();

        let model = FixedGraphForecaster::<TestBackend>::new(
            &device,
            data.shape(),
            &config.model,
            0.0,
            vec![0.0, 1.0, 1.0, 0.0],
        )
        .unwrap();
        let manifest = CheckpointManifest::new("fixed", &config, &data, &TrainingState::new())
            .with_fixed_adjacency(model.adjacency().to_vec());
        ExperimentCheckpoint::save(&model, &manifest, dir.path()).unwrap();

        let loaded = ExperimentCheckpoint::load_manifest(dir.path()).unwrap();
        let adjacency = loaded.require_fixed_adjacency().unwrap().to_vec();
        assert_eq!(adjacency, vec![0.0, 1.0, 1.0, 0.0]);

        let template =
            FixedGraphForecaster::<TestBackend>::new(&device, data.shape(), &config.model, 0.0, adjacency)
                .unwrap();
        let restored = ExperimentCheckpoint::load_model(template, dir.path(), &device).unwrap();
        assert_eq!(restored.adjacency(), model.adjacency());

        let plain = CheckpointManifest::new("lstm", &config, &data, &TrainingState::new());
        assert!(matches!(
            plain.require_fixed_adjacency(),
            Err(TrafficError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExperimentCheckpoint::load_manifest(dir.path()).unwrap_err();
        assert!(matches!(err, TrafficError::Checkpoint(_)));
    }
}
