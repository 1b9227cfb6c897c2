use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnscan_core::{
    CaptureOrchestrator, CaptureParams, CreationOrchestrator, FileRepository,
    FilesystemFileRepository, ImageSet, ModelSet, PeripheralConfigProvider, PeripheralRegistry,
    ProcessGateway, ProgressMonitor, ProjectDirs, TurnscanConfig,
};

mod config;

use config::{ConfigSource, ReloadingPeripheralConfig};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(
    name = "turnscan",
    version,
    about = "Capture objects on a turntable and turn the photos into 3D models"
)]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Project root holding items/, temp/ and utils/
    #[arg(long, global = true, env = "TURNSCAN_PROJECT_ROOT")]
    project_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture photos of an item
    Capture {
        #[arg(long)]
        item: String,
        #[arg(long, default_value_t = 30)]
        photos: u32,
        /// Rotate the turntable between photos
        #[arg(long)]
        turntable: bool,
        #[arg(long, default_value_t = 0)]
        turntable_delay_ms: u64,
        #[arg(long)]
        remove_backgrounds: bool,
    },
    /// Remove backgrounds from already captured images
    RemoveBackgrounds {
        #[arg(long)]
        item: String,
        /// Image file names inside the item's images directory
        #[arg(long, value_delimiter = ',', required = true)]
        files: Vec<String>,
    },
    /// Create a model from captured images
    CreateModel {
        #[arg(long)]
        item: String,
        /// Image file names inside the item's images directory
        #[arg(long, value_delimiter = ',', required = true)]
        images: Vec<String>,
    },
    /// Open a model directory in the configured editor
    EditModel {
        /// Project-relative model directory
        #[arg(long)]
        directory: String,
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Show the status of the configured peripherals
    Status,
    /// Detect locally installed peripherals
    Scan,
}

struct Pipeline {
    config: TurnscanConfig,
    registry: Arc<PeripheralRegistry>,
    provider: Arc<dyn PeripheralConfigProvider>,
    fs: Arc<dyn FileRepository>,
}

impl Pipeline {
    fn new(config: TurnscanConfig, source: &ConfigSource) -> Self {
        let fs: Arc<dyn FileRepository> = Arc::new(FilesystemFileRepository);
        let registry = Arc::new(PeripheralRegistry::with_builtin(
            Arc::clone(&fs),
            Arc::new(ProcessGateway),
        ));
        let provider = Arc::new(ReloadingPeripheralConfig::new(source, config.peripherals.clone()));
        Self {
            config,
            registry,
            provider,
            fs,
        }
    }

    fn dirs(&self) -> ProjectDirs {
        ProjectDirs::new(&self.config.project_root)
    }

    fn capture(&self) -> CaptureOrchestrator {
        CaptureOrchestrator::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.provider),
            Arc::clone(&self.fs),
            self.dirs(),
            self.config.capture.clone(),
            self.config.watch.clone(),
        )
    }

    fn creation(&self) -> CreationOrchestrator {
        CreationOrchestrator::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.provider),
            Arc::clone(&self.fs),
            self.dirs(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_file_loaded = dotenvy::dotenv().is_ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,turnscan_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if env_file_loaded {
        info!("loaded .env file");
    }

    let (mut config, source) =
        config::load(cli.config.as_deref()).context("failed to load configuration")?;
    match &source {
        ConfigSource::Default => info!("using default configuration"),
        ConfigSource::EnvInline => info!("configuration loaded from inline environment json"),
        ConfigSource::Flag(path) | ConfigSource::EnvPath(path) | ConfigSource::File(path) => {
            info!(path = %path.display(), "configuration loaded from file")
        }
    }
    if let Some(root) = cli.project_root {
        config.project_root = root;
    }

    let pipeline = Pipeline::new(config, &source);
    run(cli.command, &pipeline).await
}

async fn run(command: Command, pipeline: &Pipeline) -> Result<()> {
    match command {
        Command::Capture {
            item,
            photos,
            turntable,
            turntable_delay_ms,
            remove_backgrounds,
        } => {
            let params = CaptureParams {
                num_photos: photos,
                use_turntable: turntable,
                turntable_delay_ms,
                remove_backgrounds,
            };
            let monitor = Arc::new(ProgressMonitor::new("CaptureImages", "start"));
            let orchestrator = pipeline.capture();
            let sets = supervise(
                Arc::clone(&monitor),
                orchestrator.capture_photos(&item, &params, monitor),
            )
            .await
            .with_context(|| format!("capture of item {item} failed"))?;
            print_json(&sets)
        }
        Command::RemoveBackgrounds { item, files } => {
            let set = ImageSet {
                files,
                model_input: false,
                background_removed: false,
            };
            let monitor = Arc::new(ProgressMonitor::new("ManipulateImages", "start"));
            let orchestrator = pipeline.capture();
            let derivatives = supervise(
                Arc::clone(&monitor),
                orchestrator.remove_backgrounds(&item, &set, monitor),
            )
            .await
            .with_context(|| format!("background removal for item {item} failed"))?;
            let derived = ImageSet::from_paths(&derivatives, true, true);
            print_json(&derived)
        }
        Command::CreateModel { item, images } => {
            let set = ImageSet {
                files: images,
                model_input: true,
                background_removed: false,
            };
            let monitor = Arc::new(ProgressMonitor::new("CreateModel", "start"));
            let orchestrator = pipeline.creation();
            let model = supervise(
                Arc::clone(&monitor),
                orchestrator.create_model(&item, &[set], monitor),
            )
            .await
            .with_context(|| format!("model creation for item {item} failed"))?;
            if model.is_none() {
                warn!(item, "model creator produced no model");
            }
            print_json(&model)
        }
        Command::EditModel { directory, comment } => {
            let model_set = ModelSet { directory, comment };
            let monitor = Arc::new(ProgressMonitor::new("EditModel", "start"));
            let orchestrator = pipeline.creation();
            supervise(
                Arc::clone(&monitor),
                orchestrator.edit_model(&model_set, monitor),
            )
            .await
            .context("opening the model editor failed")?;
            print_json(&model_set)
        }
        Command::Status => {
            let peripherals = pipeline
                .provider
                .peripherals()
                .context("failed to read peripheral configuration")?;
            let report = pipeline.registry.status_report(&peripherals).await;
            print_json(&report)
        }
        Command::Scan => {
            let found = pipeline.registry.scan().await;
            info!(count = found.len(), "peripheral scan finished");
            print_json(&found)
        }
    }
}

/// Runs `operation` while logging progress and turning Ctrl-C into a
/// cooperative cancellation.
async fn supervise<T>(
    monitor: Arc<ProgressMonitor>,
    operation: impl Future<Output = turnscan_core::Result<T>>,
) -> Result<T> {
    let cancel_monitor = Arc::clone(&monitor);
    let cancel_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancellation requested, finishing current step");
            cancel_monitor.cancel();
        }
    });

    let progress_monitor = Arc::clone(&monitor);
    let progress_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PROGRESS_LOG_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot = progress_monitor.snapshot();
            info!(
                label = %snapshot.label_key,
                current = snapshot.current_amount,
                target = snapshot.target_amount,
                "progress"
            );
        }
    });

    let result = operation.await;
    cancel_task.abort();
    progress_task.abort();

    if monitor.is_cancelled() {
        info!("operation cancelled, returning partial result");
    }
    Ok(result?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render result as json")?;
    println!("{rendered}");
    Ok(())
}
