//! Burn-in training loop shared by every forecaster

use std::panic::{self, AssertUnwindSafe};

use burn::lr_scheduler::step::{StepLrScheduler, StepLrSchedulerConfig};
use burn::lr_scheduler::LrScheduler;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};

use super::annealing::AnnealingSchedule;
use super::loss::{mse, AuxiliaryRegularizer, ReconstructionLoss};
use super::metrics::{EpochMetrics, TrainingPhase, TrainingState};
use crate::data::{BatchIterator, NormalizationStats, WindowDataset, WindowedSplit};
use crate::model::{BurnInForecaster, EncoderGradients};
use crate::{Config, Result, TrafficError};

/// Loop settings resolved from the configuration
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub batch_size: usize,
    pub n_epochs: usize,
    pub eval_every: usize,
    pub shuffle_train: bool,
    pub shuffle_test: bool,
    pub seed: u64,
    /// Leading ground-truth steps fed to the model
    pub known_steps: usize,
    /// Trailing steps that are scored
    pub pred_steps: usize,
    pub learning_rate: f64,
    pub lr_decay_step: usize,
    pub lr_decay_gamma: f64,
    pub weight_decay: f64,
    /// Learning-rate factor for models with a separate edge encoder
    pub encoder_lr_frac: f64,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        LoopSettings {
            batch_size: config.training.batch_size,
            n_epochs: config.training.n_epochs,
            eval_every: config.training.eval_every,
            shuffle_train: config.training.shuffle_train,
            shuffle_test: config.training.shuffle_test,
            seed: config.training.seed,
            known_steps: config.data.known_steps(),
            pred_steps: config.data.pred_steps(),
            learning_rate: config.training.learning_rate,
            lr_decay_step: config.training.lr_decay_step,
            lr_decay_gamma: config.training.lr_decay_gamma,
            weight_decay: config.training.weight_decay,
            encoder_lr_frac: config.training.encoder_lr_frac,
        }
    }

    /// Shuffle seed for the train loader, `None` keeps chronological order
    fn train_shuffle(&self) -> Option<u64> {
        self.shuffle_train.then_some(self.seed)
    }

    fn test_shuffle(&self) -> Option<u64> {
        self.shuffle_test.then_some(self.seed.wrapping_add(1))
    }

    /// Whether the test windows are evaluated after `epoch`
    pub fn evaluates_at(&self, epoch: usize) -> bool {
        epoch % self.eval_every.max(1) == 0
    }
}

/// What one epoch produced, handed to the epoch callback
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: usize,
    pub train: EpochMetrics,
    pub test: Option<EpochMetrics>,
    pub annealing_weight: f64,
    pub learning_rate: f64,
    pub global_step: usize,
}

/// Trains any [`BurnInForecaster`] on a windowed split
///
/// The loop owns the model, the optimizer and the [`TrainingState`];
/// [`finalize`](Self::finalize) hands the latter two back frozen.
pub struct TrainingLoop<B, M, R>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    model: M,
    optimizer: OptimizerAdaptor<Adam, M, B>,
    loss: ReconstructionLoss,
    regularizer: R,
    annealing: AnnealingSchedule,
    /// Stepped once per epoch
    lr_schedule: StepLrScheduler,
    settings: LoopSettings,
    device: B::Device,
    /// Per-channel factor turning normalized errors into raw units
    error_scale: Option<Vec<f32>>,
    state: TrainingState,
}

impl<B, M, R> TrainingLoop<B, M, R>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + BurnInForecaster<B> + EncoderGradients<B>,
    M::InnerModule: BurnInForecaster<B::InnerBackend>,
    R: AuxiliaryRegularizer<B> + AuxiliaryRegularizer<B::InnerBackend>,
{
    pub fn new(
        model: M,
        regularizer: R,
        config: &Config,
        stats: Option<&NormalizationStats>,
        device: B::Device,
    ) -> Result<Self> {
        let settings = LoopSettings::from_config(config);
        let lr_schedule = StepLrSchedulerConfig::new(settings.learning_rate, settings.lr_decay_step)
            .with_gamma(settings.lr_decay_gamma)
            .init()
            .map_err(TrafficError::Configuration)?;

        let optimizer = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(settings.weight_decay as f32)))
            .init();

        let error_scale = stats.map(|stats| {
            (0..stats.channels())
                .map(|c| stats.range(c).unwrap_or(1.0))
                .collect()
        });

        Ok(TrainingLoop {
            model,
            optimizer,
            loss: ReconstructionLoss::new(&config.loss),
            regularizer,
            annealing: AnnealingSchedule::from(&config.annealing),
            lr_schedule,
            settings,
            device,
            error_scale,
            state: TrainingState::new(),
        })
    }

    /// Train for the configured number of epochs
    pub fn fit(&mut self, split: &WindowedSplit) -> Result<()> {
        self.fit_with(split, |_| {})
    }

    /// Train, calling `on_epoch` after every completed epoch
    ///
    /// A panic raised by the backend during an epoch is returned as
    /// [`TrafficError::DeviceCompute`]; everything recorded for earlier
    /// epochs stays available through [`state`](Self::state).
    pub fn fit_with<F>(&mut self, split: &WindowedSplit, mut on_epoch: F) -> Result<()>
    where
        F: FnMut(&EpochReport),
    {
        if self.state.is_finalized() {
            return Err(TrafficError::Configuration(
                "training loop has already been finalized".to_string(),
            ));
        }

        let n_epochs = self.settings.n_epochs;
        let start = self.state.completed_epochs();
        if start == 0 {
            log::info!(
                "Starting training for {} epochs ({} train / {} test windows, {} known + {} predicted steps)",
                n_epochs,
                split.train().len(),
                split.test().len(),
                self.settings.known_steps,
                self.settings.pred_steps
            );
        }

        let train_batches = BatchIterator::<B>::new(
            split.train(),
            self.device.clone(),
            self.settings.batch_size,
            self.settings.train_shuffle(),
        );
        let test_batches = BatchIterator::<B::InnerBackend>::new(
            split.test(),
            self.device.clone(),
            self.settings.batch_size,
            self.settings.test_shuffle(),
        );

        for epoch in start..n_epochs {
            self.state.phase = TrainingPhase::Epoch(epoch);

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.run_epoch(epoch, &train_batches, &test_batches)
            }));
            let report = outcome.map_err(|payload| TrafficError::DeviceCompute {
                epoch,
                message: panic_message(payload.as_ref()),
            })?;

            match &report.test {
                Some(test) => log::info!(
                    "Epoch {}/{}: Train: {} | Test: {}",
                    epoch + 1,
                    n_epochs,
                    report.train,
                    test
                ),
                None => log::info!("Epoch {}/{}: Train: {}", epoch + 1, n_epochs, report.train),
            }
            on_epoch(&report);
        }

        Ok(())
    }

    fn run_epoch(
        &mut self,
        epoch: usize,
        train_batches: &BatchIterator<B>,
        test_batches: &BatchIterator<B::InnerBackend>,
    ) -> EpochReport {
        // Committed only once the epoch completes
        let mut lr_schedule = self.lr_schedule.clone();
        let learning_rate = lr_schedule.step();
        if let Some(&previous) = self.state.history.learning_rate.last() {
            if learning_rate != previous {
                log::debug!("Learning rate decayed to {:.2e}", learning_rate);
            }
        }

        let (train, annealing_weight) = self.train_epoch(epoch, train_batches, learning_rate);
        let test = if self.settings.evaluates_at(epoch) {
            Some(self.evaluate_batches(test_batches))
        } else {
            None
        };

        // Only fully completed epochs reach the history
        self.state
            .history
            .record_train(&train, annealing_weight, learning_rate);
        if let Some(test) = &test {
            self.state.history.record_test(epoch, test);
        }

        self.lr_schedule = lr_schedule;

        EpochReport {
            epoch,
            train,
            test,
            annealing_weight,
            learning_rate,
            global_step: self.state.global_step,
        }
    }

    /// One optimizer pass over the training windows
    fn train_epoch(
        &mut self,
        epoch: usize,
        batches: &BatchIterator<B>,
        learning_rate: f64,
    ) -> (EpochMetrics, f64) {
        let mut metrics = EpochMetrics::new();
        let mut weight = 0.0;

        for (epoch_step, batch) in batches.iterate().enumerate() {
            let step = self
                .annealing
                .step_for(epoch, self.state.global_step, epoch_step);
            weight = self.annealing.weight(step);

            let batch_size = batch.starts.len();
            let targets = scored_steps(batch.observations.clone(), self.settings.pred_steps);
            let forecast = self.model.forward_burn_in(
                batch.observations,
                batch.covariates,
                self.settings.known_steps,
            );
            let predictions = scored_steps(forecast.predictions, self.settings.pred_steps);

            let reconstruction = self.loss.forward(predictions.clone(), targets.clone());
            let penalty = self.regularizer.penalty(&forecast.auxiliary);
            let total = match &penalty {
                Some(penalty) => reconstruction.clone() + penalty.clone().mul_scalar(weight),
                None => reconstruction.clone(),
            };

            // Read back once per step
            let total_val: f32 = total.clone().into_scalar().elem();
            let reconstruction_val: f32 = reconstruction.into_scalar().elem();
            let penalty_val: f32 = penalty
                .map(|p| p.into_scalar().elem())
                .unwrap_or(0.0);
            let predictions = predictions.inner();
            let targets = targets.inner();
            let mse_val: f32 = mse(predictions.clone(), targets.clone()).into_scalar().elem();
            let mae_val: f32 = scaled_mae(predictions, targets, self.error_scale.as_deref())
                .into_scalar()
                .elem();

            let mut grads = total.backward();
            let encoder_grads = self.model.encoder_grads(&mut grads);
            let grads = GradientsParams::from_grads(grads, &self.model);
            if let Some(encoder_grads) = encoder_grads {
                let encoder_lr = learning_rate * self.settings.encoder_lr_frac;
                self.model = self.optimizer.step(encoder_lr, self.model.clone(), encoder_grads);
            }
            self.model = self.optimizer.step(learning_rate, self.model.clone(), grads);
            self.state.global_step += 1;

            metrics.update(
                total_val,
                reconstruction_val,
                penalty_val,
                mse_val,
                mae_val,
                batch_size,
            );
        }

        (metrics, weight)
    }

    /// Score the test windows with the inner (non-autodiff) model
    ///
    /// No gradients are tracked and dropout is inactive.
    pub fn evaluate(&self, dataset: &WindowDataset) -> EpochMetrics {
        let batches = BatchIterator::new(
            dataset,
            self.device.clone(),
            self.settings.batch_size,
            self.settings.test_shuffle(),
        );
        self.evaluate_batches(&batches)
    }

    fn evaluate_batches(&self, batches: &BatchIterator<B::InnerBackend>) -> EpochMetrics {
        let model = self.model.valid();
        let mut metrics = EpochMetrics::new();

        for batch in batches.iterate() {
            let batch_size = batch.starts.len();
            let targets = scored_steps(batch.observations.clone(), self.settings.pred_steps);
            let forecast = model.forward_burn_in(
                batch.observations,
                batch.covariates,
                self.settings.known_steps,
            );
            let predictions = scored_steps(forecast.predictions, self.settings.pred_steps);

            let reconstruction: f32 = self
                .loss
                .forward(predictions.clone(), targets.clone())
                .into_scalar()
                .elem();
            let penalty: f32 = self
                .regularizer
                .penalty(&forecast.auxiliary)
                .map(|p| p.into_scalar().elem())
                .unwrap_or(0.0);
            let mse_val: f32 = mse(predictions.clone(), targets.clone()).into_scalar().elem();
            let mae_val: f32 = scaled_mae(predictions, targets, self.error_scale.as_deref())
                .into_scalar()
                .elem();

            metrics.update(
                reconstruction,
                reconstruction,
                penalty,
                mse_val,
                mae_val,
                batch_size,
            );
        }

        metrics
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Freeze the state and hand back the trained model
    pub fn finalize(mut self) -> (M, TrainingState) {
        self.state.phase = TrainingPhase::Finalized;
        log::info!(
            "Training finalized after {} epochs ({} optimizer steps)",
            self.state.completed_epochs(),
            self.state.global_step
        );
        (self.model, self.state)
    }
}

/// Last `pred_steps` positions of a `[batch, steps, nodes, features]` tensor
fn scored_steps<B: Backend>(tensor: Tensor<B, 4>, pred_steps: usize) -> Tensor<B, 4> {
    let [batch, steps, nodes, features] = tensor.dims();
    let first = steps.saturating_sub(pred_steps);
    tensor.slice([0..batch, first..steps, 0..nodes, 0..features])
}

/// Mean absolute error with each channel scaled back to raw units
fn scaled_mae<B: Backend>(
    predictions: Tensor<B, 4>,
    targets: Tensor<B, 4>,
    scale: Option<&[f32]>,
) -> Tensor<B, 1> {
    let [batch, steps, nodes, features] = predictions.dims();
    let error = (predictions - targets).abs();
    match scale {
        Some(scale) => {
            let scale = Tensor::<B, 1>::from_floats(scale, &error.device())
                .reshape([1, 1, nodes, features])
                .repeat_dim(0, batch)
                .repeat_dim(1, steps);
            (error * scale).mean()
        }
        None => error.mean(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "backend panicked without a message".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{RawSeries, SeriesShape, SplitConfig};
    use crate::model::{
        Forecast, GraphForecaster, GraphForecasterConfig, LstmForecaster, LstmForecasterConfig,
    };
    use crate::training::loss::{KlCategorical, NoRegularizer};
    use burn::backend::{Autodiff, NdArray};
    use burn::module::Module;
    use burn::nn::{Linear, LinearConfig};
    use chrono::NaiveDate;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn small_config(n_epochs: usize, eval_every: usize) -> Config {
        let mut config = Config::default();
        config.training.n_epochs = n_epochs;
        config.training.eval_every = eval_every;
        config.training.batch_size = 8;
        config.data.split_len = 6;
        config.data.burn_in_steps = 4;
        config.model.lstm_hid = 4;
        config.model.enc_n_hid = 4;
        config.model.dec_n_hid = 4;
        config.model.dec_msg_hid = 4;
        config.model.dec_gru_hid = 4;
        config
    }

    fn split(config: &Config, num_nodes: usize) -> WindowedSplit {
        let start = NaiveDate::from_ymd_opt(2019, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let len = 40;
        let obs = (0..len * num_nodes)
            .map(|i| ((i / num_nodes) as f32 * 0.3).sin() + (i % num_nodes) as f32)
            .collect();
        let cov = (0..len * 2).map(|i| (i % 7) as f32).collect();
        let series = RawSeries::hourly(start, obs, cov, SeriesShape::new(num_nodes, 1, 2)).unwrap();
        WindowedSplit::build(series, &SplitConfig::from(&config.data)).unwrap()
    }

    fn lstm(config: &Config, data: &WindowedSplit) -> LstmForecaster<TestBackend> {
        let device = Default::default();
        LstmForecaster::new(&device, LstmForecasterConfig::new(data.shape(), &config.model, 0.0))
    }

    #[test]
    fn test_history_lengths() {
        for (n_epochs, eval_every) in [(3, 2), (5, 10), (4, 1)] {
            let config = small_config(n_epochs, eval_every);
            let data = split(&config, 2);
            let model = lstm(&config, &data);
            let mut trainer =
                TrainingLoop::new(model, NoRegularizer, &config, data.stats(), Default::default())
                    .unwrap();

            trainer.fit(&data).unwrap();
            let (_, state) = trainer.finalize();

            assert!(state.is_finalized());
            assert_eq!(state.history.train_loss.len(), n_epochs);
            assert_eq!(state.history.test_loss.len(), n_epochs.div_ceil(eval_every));
            assert!(state.history.train_loss.iter().all(|l| l.is_finite()));
        }
    }

    #[test]
    fn test_global_step_counts_batches() {
        let config = small_config(2, 10);
        let data = split(&config, 2);
        let model = lstm(&config, &data);
        let mut trainer =
            TrainingLoop::new(model, NoRegularizer, &config, data.stats(), Default::default())
                .unwrap();

        let mut reports = Vec::new();
        trainer
            .fit_with(&data, |report| reports.push(report.epoch))
            .unwrap();

        let per_epoch = data.train().len().div_ceil(8);
        assert_eq!(trainer.state().global_step, 2 * per_epoch);
        assert_eq!(reports, vec![0, 1]);
    }

    #[test]
    fn test_graph_model_records_regularizer() {
        let mut config = small_config(2, 1);
        config.annealing.ramp_steps = 1;
        let data = split(&config, 3);
        let device = Default::default();
        let model = GraphForecaster::<TestBackend>::new(
            &device,
            GraphForecasterConfig::new(data.shape(), &config.model, 0.0),
        );
        let kl = KlCategorical::new(config.model.edge_rate, config.model.n_edge_types, 3);
        let mut trainer = TrainingLoop::new(model, kl, &config, data.stats(), device).unwrap();

        trainer.fit(&data).unwrap();
        let history = &trainer.state().history;
        assert_eq!(history.annealing_weight, vec![0.0, 1.0]);
        assert!(history.train_regularizer.iter().all(|&r| r > 0.0));
        assert_eq!(history.test_epochs, vec![0, 1]);
    }

    #[test]
    fn test_learning_rate_decays_per_epoch() {
        let mut config = small_config(3, 10);
        config.training.learning_rate = 1e-3;
        config.training.lr_decay_step = 2;
        config.training.lr_decay_gamma = 0.5;
        let data = split(&config, 2);
        let model = lstm(&config, &data);
        let mut trainer =
            TrainingLoop::new(model, NoRegularizer, &config, data.stats(), Default::default())
                .unwrap();

        trainer.fit(&data).unwrap();
        let rates = &trainer.state().history.learning_rate;
        assert_eq!(rates.len(), 3);
        assert!((rates[0] - 1e-3).abs() < 1e-12);
        assert!((rates[1] - 1e-3).abs() < 1e-12);
        assert!((rates[2] - 5e-4).abs() < 1e-12);
    }

    /// Largest change in edge logits after one epoch at the given encoder rate
    fn encoder_drift(encoder_lr_frac: f64) -> f32 {
        let mut config = small_config(1, 1);
        config.training.learning_rate = 0.01;
        config.training.encoder_lr_frac = encoder_lr_frac;
        let data = split(&config, 3);
        let device = Default::default();
        let model = GraphForecaster::<TestBackend>::new(
            &device,
            GraphForecasterConfig::new(data.shape(), &config.model, 0.0),
        );
        let before = model.valid();
        let kl = KlCategorical::new(config.model.edge_rate, config.model.n_edge_types, 3);
        let mut trainer = TrainingLoop::new(model, kl, &config, data.stats(), device).unwrap();
        trainer.fit(&data).unwrap();
        let after = trainer.model().valid();

        let batches = BatchIterator::<NdArray<f32>>::new(data.test(), device, 4, None);
        let batch = batches.iterate().next().unwrap();
        let logits = |model: &GraphForecaster<NdArray<f32>>| {
            model
                .encoder()
                .forward(batch.observations.clone(), batch.covariates.clone(), 4)
        };
        let drift: f32 = (logits(&after) - logits(&before))
            .abs()
            .max()
            .into_scalar()
            .elem();
        drift
    }

    #[test]
    fn test_encoder_lr_frac_slows_encoder() {
        let full = encoder_drift(1.0);
        let frozen = encoder_drift(1e-9);
        assert!(full > 1e-4, "encoder did not move: {full}");
        assert!(frozen < 1e-5, "encoder moved too far: {frozen}");
    }

    #[test]
    fn test_scaled_mae_uses_channel_ranges() {
        let device = Default::default();
        let pred = Tensor::<NdArray<f32>, 4>::ones([1, 2, 2, 1], &device);
        let target = Tensor::<NdArray<f32>, 4>::zeros([1, 2, 2, 1], &device);
        let mae: f32 = scaled_mae(pred, target, Some(&[10.0, 30.0])).into_scalar().elem();
        assert!((mae - 20.0).abs() < 1e-5);
    }

    /// Forecaster whose backend work fails on every call
    #[derive(Module, Debug)]
    struct FailingForecaster<B: Backend> {
        linear: Linear<B>,
    }

    impl<B: AutodiffBackend> EncoderGradients<B> for FailingForecaster<B> {}

    impl<B: Backend> BurnInForecaster<B> for FailingForecaster<B> {
        fn forward_burn_in(
            &self,
            _observations: Tensor<B, 4>,
            _covariates: Tensor<B, 3>,
            _known_steps: usize,
        ) -> Forecast<B> {
            panic!("out of device memory");
        }
    }

    #[test]
    fn test_backend_failure_surfaces_as_device_error() {
        let config = small_config(3, 1);
        let data = split(&config, 2);
        let device = Default::default();
        let model = FailingForecaster::<TestBackend> {
            linear: LinearConfig::new(1, 1).init(&device),
        };
        let mut trainer =
            TrainingLoop::new(model, NoRegularizer, &config, data.stats(), device).unwrap();

        let err = trainer.fit(&data).unwrap_err();
        match err {
            TrafficError::DeviceCompute { epoch, message } => {
                assert_eq!(epoch, 0);
                assert!(message.contains("out of device memory"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(trainer.state().phase, TrainingPhase::Epoch(0));
        assert_eq!(trainer.state().completed_epochs(), 0);
    }
}
