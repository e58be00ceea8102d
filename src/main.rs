//! Taxi demand forecasting CLI
//!
//! Trains burn-in sequence models on gridded pickup/dropoff counts and
//! weather covariates, then inspects and runs the saved experiments.

#![recursion_limit = "256"]

use clap::{Parser, Subcommand};
use traffic::{Config, DeviceKind, ModelKind, Result};

#[derive(Parser)]
#[command(name = "traffic")]
#[command(about = "Burn-in forecasting of taxi demand with weather covariates", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new project with default config
    Init,
    /// Train a model and save it as a new experiment
    Train(TrainArgs),
    /// Show what a saved experiment contains
    Inspect {
        /// Experiment folder
        experiment: String,
    },
    /// Forecast one window with a saved experiment
    Forecast {
        /// Experiment folder
        experiment: String,
        /// First timestamp of the window (defaults to the latest window)
        #[arg(long)]
        start: Option<String>,
        /// Output CSV (defaults to <experiment>/forecast.csv)
        #[arg(long)]
        output: Option<String>,
        /// Compute device
        #[arg(long)]
        device: Option<DeviceKind>,
    },
}

/// Command-line overrides for the config file
#[derive(clap::Args)]
struct TrainArgs {
    /// Experiment name
    #[arg(long)]
    name: Option<String>,
    /// Model to train: lstm, graph or fixed_graph
    #[arg(long)]
    model: Option<ModelKind>,
    /// Compute device: cpu or wgpu
    #[arg(long)]
    device: Option<DeviceKind>,
    #[arg(long)]
    pickup: Option<String>,
    #[arg(long)]
    dropoff: Option<String>,
    #[arg(long)]
    weather: Option<String>,
    /// Adjacency matrix for the fixed_graph model
    #[arg(long)]
    adjacency: Option<String>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    split_len: Option<usize>,
    #[arg(long)]
    burn_in_steps: Option<usize>,
    /// Feed only the first step of each window as ground truth
    #[arg(long)]
    no_burn_in: bool,
    #[arg(long)]
    train_frac: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
}

impl TrainArgs {
    fn apply(self, config: &mut Config) {
        if let Some(name) = self.name {
            config.experiment.name = name;
        }
        if let Some(kind) = self.model {
            config.model.kind = kind;
        }
        if let Some(device) = self.device {
            config.experiment.device = device;
        }
        if let Some(path) = self.pickup {
            config.data.pickup_path = path;
        }
        if let Some(path) = self.dropoff {
            config.data.dropoff_path = Some(path);
        }
        if let Some(path) = self.weather {
            config.data.weather_path = path;
        }
        if let Some(path) = self.adjacency {
            config.model.fixed_adj_matrix_path = Some(path);
        }
        if let Some(epochs) = self.epochs {
            config.training.n_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(lr) = self.lr {
            config.training.learning_rate = lr;
        }
        if let Some(split_len) = self.split_len {
            config.data.split_len = split_len;
        }
        if let Some(steps) = self.burn_in_steps {
            config.data.burn_in_steps = steps;
        }
        if self.no_burn_in {
            config.data.burn_in = false;
        }
        if let Some(frac) = self.train_frac {
            config.data.train_frac = frac;
        }
        if let Some(seed) = self.seed {
            config.training.seed = seed;
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load or create config
    let config = if std::path::Path::new(&cli.config).exists() {
        match Config::load(&cli.config) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error loading config: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    let result = match cli.command {
        Commands::Init => commands::init(&cli.config),
        Commands::Train(args) => {
            let mut config = config;
            args.apply(&mut config);
            commands::train(&config)
        }
        Commands::Inspect { experiment } => commands::inspect(&experiment),
        Commands::Forecast {
            experiment,
            start,
            output,
            device,
        } => commands::forecast(&experiment, start.as_deref(), output, device),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

mod commands {
    use super::*;
    use burn::backend::wgpu::WgpuDevice;
    use burn::backend::{Autodiff, NdArray, Wgpu};
    use burn::module::{AutodiffModule, Module};
    use burn::tensor::backend::{AutodiffBackend, Backend};
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use traffic::data::{load_adjacency, load_series, loader, SplitConfig, WindowedSplit};
    use traffic::experiment::{CheckpointManifest, ExperimentCheckpoint, ExperimentDir, ScalarLog};
    use traffic::model::{
        BurnInForecaster, EncoderGradients, FixedGraphForecaster, GraphForecaster, GraphForecasterConfig,
        LstmForecaster, LstmForecasterConfig,
    };
    use traffic::predict::Predictor;
    use traffic::training::{
        AuxiliaryRegularizer, KlCategorical, NoRegularizer, TrainingLoop, TrainingState,
    };
    use traffic::TrafficError;

    type CpuBackend = NdArray<f32>;
    type GpuBackend = Wgpu<f32, i32>;

    fn wgpu_device(index: Option<usize>) -> WgpuDevice {
        match index {
            Some(i) => WgpuDevice::DiscreteGpu(i),
            None => WgpuDevice::default(),
        }
    }

    pub fn init(config_path: &str) -> Result<()> {
        let config = Config::default();
        config.save(config_path)?;
        println!("Created default config at {}", config_path);

        std::fs::create_dir_all("data/procdata")?;
        std::fs::create_dir_all(&config.experiment.models_dir)?;
        println!(
            "Created data/procdata/ and {}/ directories",
            config.experiment.models_dir
        );

        println!("\nNext steps:");
        println!("  1. Put the pickup/dropoff .npy files and the weather CSV in data/procdata/");
        println!("  2. Edit {} to customize settings", config_path);
        println!("  3. Run 'traffic train' to train a model");
        println!("  4. Run 'traffic forecast {}/<experiment>' to forecast", config.experiment.models_dir);

        Ok(())
    }

    pub fn train(config: &Config) -> Result<()> {
        config.validate()?;
        match config.experiment.device {
            DeviceKind::Cpu => train_on::<Autodiff<CpuBackend>>(config, Default::default()),
            DeviceKind::Wgpu => {
                train_on::<Autodiff<GpuBackend>>(config, wgpu_device(config.experiment.gpu_index))
            }
        }
    }

    fn train_on<B>(config: &Config, device: B::Device) -> Result<()>
    where
        B: AutodiffBackend,
        <B::InnerBackend as Backend>::FloatElem: Serialize + DeserializeOwned,
        <B::InnerBackend as Backend>::IntElem: Serialize + DeserializeOwned,
    {
        println!("Loading data...");
        let series = load_series(&config.data)?;
        let shape = series.shape();
        println!(
            "  {} steps, {} nodes x {} features, {} covariates",
            series.len(),
            shape.num_nodes,
            shape.node_features,
            shape.covariate_dim
        );

        let split = WindowedSplit::build(series, &SplitConfig::from(&config.data))?;
        println!(
            "  {} windows: {} train, {} test",
            split.num_windows(),
            split.train().len(),
            split.test().len()
        );

        let experiment =
            ExperimentDir::create(&config.experiment.models_dir, &config.experiment.name)?;
        config.save(&experiment.path().join("config.toml").to_string_lossy())?;

        let dropout = config.training.dropout_p;
        match config.model.kind {
            ModelKind::Lstm => {
                let model_config = LstmForecasterConfig::new(shape, &config.model, dropout);
                let model = LstmForecaster::<B>::new(&device, model_config);
                run(model, NoRegularizer, config, &split, &experiment, device, None)
            }
            ModelKind::Graph => {
                let model_config = GraphForecasterConfig::new(shape, &config.model, dropout);
                let model = GraphForecaster::<B>::new(&device, model_config);
                let kl = KlCategorical::new(
                    config.model.edge_rate,
                    config.model.n_edge_types,
                    shape.num_nodes,
                );
                run(model, kl, config, &split, &experiment, device, None)
            }
            ModelKind::FixedGraph => {
                let adjacency = read_adjacency(config, shape.num_nodes)?;
                let model =
                    FixedGraphForecaster::<B>::new(&device, shape, &config.model, dropout, adjacency)?;
                println!("  Fixed graph with {} directed edges", model.num_edges());
                let adjacency = model.adjacency().to_vec();
                run(model, NoRegularizer, config, &split, &experiment, device, Some(adjacency))
            }
        }
    }

    fn read_adjacency(config: &Config, num_nodes: usize) -> Result<Vec<f32>> {
        let path = config.model.fixed_adj_matrix_path.as_deref().ok_or_else(|| {
            TrafficError::Configuration(
                "model.fixed_adj_matrix_path is required for the fixed_graph model".to_string(),
            )
        })?;
        load_adjacency(path, num_nodes)
    }

    fn run<B, M, R>(
        model: M,
        regularizer: R,
        config: &Config,
        split: &WindowedSplit,
        experiment: &ExperimentDir,
        device: B::Device,
        fixed_adjacency: Option<Vec<f32>>,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + BurnInForecaster<B> + EncoderGradients<B>,
        M::InnerModule: BurnInForecaster<B::InnerBackend>,
        R: AuxiliaryRegularizer<B> + AuxiliaryRegularizer<B::InnerBackend>,
        <B::InnerBackend as Backend>::FloatElem: Serialize + DeserializeOwned,
        <B::InnerBackend as Backend>::IntElem: Serialize + DeserializeOwned,
    {
        let manifest_for = |state: &TrainingState| {
            let manifest = CheckpointManifest::new(experiment.name(), config, split, state);
            match &fixed_adjacency {
                Some(adjacency) => manifest.with_fixed_adjacency(adjacency.clone()),
                None => manifest,
            }
        };

        let mut scalars = ScalarLog::create(experiment.runs_dir())?;
        let mut trainer = TrainingLoop::new(model, regularizer, config, split.stats(), device)?;

        println!("\nStarting training...\n");
        let mut log_error = None;
        let outcome = trainer.fit_with(split, |report| {
            if let Err(e) = scalars.log_epoch(report) {
                log_error.get_or_insert(e);
            }
        });

        if let Err(e) = outcome {
            // Keep what the completed epochs produced
            let manifest = manifest_for(trainer.state());
            ExperimentCheckpoint::save(&trainer.model().valid(), &manifest, experiment.path())?;
            log::warn!(
                "Saved partial checkpoint after {} epochs",
                trainer.state().completed_epochs()
            );
            return Err(e);
        }
        if let Some(e) = log_error {
            return Err(e);
        }

        let (model, state) = trainer.finalize();
        let manifest = manifest_for(&state);
        ExperimentCheckpoint::save(&model.valid(), &manifest, experiment.path())?;

        println!("\nTraining complete!");
        println!("  Experiment:      {}", experiment.path().display());
        if let Some(loss) = state.history.train_loss.last() {
            println!("  Final train loss: {:.5}", loss);
        }
        if let (Some(loss), Some(epoch)) = (state.history.best_test_loss, state.history.best_epoch) {
            println!("  Best test loss:   {:.5} (epoch {})", loss, epoch + 1);
        }
        if let Some(mae) = state.history.test_mae.last() {
            println!("  Last test MAE:    {:.3}", mae);
        }

        Ok(())
    }

    pub fn inspect(dir: &str) -> Result<()> {
        let manifest = ExperimentCheckpoint::load_manifest(dir)?;
        let history = &manifest.history;
        let data = &manifest.config.data;

        println!("Experiment {}", manifest.experiment);
        println!("───────────────────────────────");
        println!("  Created:     {}", manifest.created_at);
        println!("  Model:       {}", manifest.model_kind);
        println!("  Status:      {:?}", manifest.phase);
        println!(
            "  Shape:       {} nodes x {} features, {} covariates",
            manifest.shape.num_nodes, manifest.shape.node_features, manifest.shape.covariate_dim
        );
        if let (Some(start), Some(end)) = (manifest.series_start, manifest.series_end) {
            println!("  Series:      {} to {}", start, end);
        }
        println!(
            "  Windows:     {} train, {} test (split_len {}, burn-in {})",
            manifest.train_windows, manifest.test_windows, data.split_len, data.known_steps()
        );
        match &manifest.normalization {
            Some(stats) => println!(
                "  Normalized:  yes ({} constant channels)",
                stats.degenerate_channels().len()
            ),
            None => println!("  Normalized:  no"),
        }
        println!(
            "  Epochs:      {} ({} optimizer steps)",
            history.epochs(),
            manifest.global_step
        );
        if let Some(loss) = history.train_loss.last() {
            println!("  Train loss:  {:.5}", loss);
        }
        for ((epoch, loss), mae) in history
            .test_epochs
            .iter()
            .zip(&history.test_loss)
            .zip(&history.test_mae)
        {
            println!("  Test @ {:>4}: loss {:.5}, MAE {:.3}", epoch + 1, loss, mae);
        }

        Ok(())
    }

    pub fn forecast(
        dir: &str,
        start: Option<&str>,
        output: Option<String>,
        device: Option<DeviceKind>,
    ) -> Result<()> {
        let manifest = ExperimentCheckpoint::load_manifest(dir)?;
        match device.unwrap_or(manifest.config.experiment.device) {
            DeviceKind::Cpu => forecast_on::<CpuBackend>(dir, &manifest, start, output, Default::default()),
            DeviceKind::Wgpu => {
                let device = wgpu_device(manifest.config.experiment.gpu_index);
                forecast_on::<GpuBackend>(dir, &manifest, start, output, device)
            }
        }
    }

    fn forecast_on<B>(
        dir: &str,
        manifest: &CheckpointManifest,
        start: Option<&str>,
        output: Option<String>,
        device: B::Device,
    ) -> Result<()>
    where
        B: Backend,
        B::FloatElem: Serialize + DeserializeOwned,
        B::IntElem: Serialize + DeserializeOwned,
    {
        let config = &manifest.config;
        let shape = manifest.shape;
        match manifest.model_kind {
            ModelKind::Lstm => {
                let template = LstmForecaster::<B>::new(
                    &device,
                    LstmForecasterConfig::new(shape, &config.model, 0.0),
                );
                forecast_with(template, dir, manifest, start, output, device)
            }
            ModelKind::Graph => {
                let template = GraphForecaster::<B>::new(
                    &device,
                    GraphForecasterConfig::new(shape, &config.model, 0.0),
                );
                forecast_with(template, dir, manifest, start, output, device)
            }
            ModelKind::FixedGraph => {
                let adjacency = manifest.require_fixed_adjacency()?.to_vec();
                let template =
                    FixedGraphForecaster::<B>::new(&device, shape, &config.model, 0.0, adjacency)?;
                forecast_with(template, dir, manifest, start, output, device)
            }
        }
    }

    fn forecast_with<B, M>(
        template: M,
        dir: &str,
        manifest: &CheckpointManifest,
        start: Option<&str>,
        output: Option<String>,
        device: B::Device,
    ) -> Result<()>
    where
        B: Backend,
        M: Module<B> + BurnInForecaster<B>,
        B::FloatElem: Serialize + DeserializeOwned,
        B::IntElem: Serialize + DeserializeOwned,
    {
        let data = &manifest.config.data;
        let model = ExperimentCheckpoint::load_model(template, dir, &device)?;
        let series = load_series(data)?;
        if series.shape() != manifest.shape {
            return Err(TrafficError::DataShape(format!(
                "data has shape {:?}, the experiment was trained on {:?}",
                series.shape(),
                manifest.shape
            )));
        }

        let predictor = Predictor::new(
            model,
            manifest.normalization.clone(),
            data.split_len,
            data.known_steps(),
            device,
        );

        let start = match start {
            Some(text) => {
                let timestamp = loader::parse_timestamp(text).ok_or_else(|| {
                    TrafficError::Configuration(format!("cannot parse start timestamp {}", text))
                })?;
                series
                    .timestamps()
                    .iter()
                    .position(|t| *t == timestamp)
                    .ok_or_else(|| {
                        TrafficError::Configuration(format!("{} is not in the series", timestamp))
                    })?
            }
            None => predictor.latest_start(&series)?,
        };

        let forecast = predictor.forecast_window(&series, start)?;
        let output = output.unwrap_or_else(|| format!("{}/forecast.csv", dir.trim_end_matches('/')));
        forecast.write_csv(&output)?;

        println!(
            "Forecast {} steps from {} ({} channels)",
            forecast.steps(),
            series.timestamps()[start],
            forecast.channels
        );
        println!("  MAE:    {:.3}", forecast.mae());
        println!("  Output: {}", output);

        Ok(())
    }
}
