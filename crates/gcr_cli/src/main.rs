use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use review_pipeline::{
    config::PipelineConfig,
    runner::{run_flatten_configured, run_predict, run_training, run_warm_cache},
    ExecutionContext, PipelineTelemetry, RewritePath,
};
use serde_json::json;
use shared_logging::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "gcr", version, about = "Gift-card review rating pipeline")]
struct Cli {
    /// Structured JSON-lines run log.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    /// Worker threads for row-level work (defaults to all cores).
    #[arg(long, global = true)]
    workers: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Cleans raw reviews and writes the flattened CSV.
    ///
    /// Paths and rewrite path come from `--config` unless given explicitly.
    Flatten {
        /// Pipeline config supplying `input`, `flattened_csv` and `rewrite_path`.
        #[arg(long, required_unless_present_all = ["input", "output"])]
        config: Option<PathBuf>,
        /// Line-delimited JSON reviews, optionally gzip compressed.
        #[arg(long)]
        input: Option<PathBuf>,
        /// Flattened CSV destination.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Rewrite path that cleans the gift amount.
        #[arg(long, value_enum)]
        rewrite_path: Option<PathArg>,
    },
    /// Computes and persists the sentence encoding of every review.
    WarmCache {
        /// Pipeline config (JSON).
        #[arg(long)]
        config: PathBuf,
    },
    /// Trains, evaluates and saves the rating model.
    Train {
        /// Pipeline config (JSON).
        #[arg(long)]
        config: PathBuf,
    },
    /// Scores a flattened CSV with a saved model, one JSON line per row.
    Predict {
        /// Saved model artifact.
        #[arg(long)]
        model: PathBuf,
        /// Flattened CSV to score.
        #[arg(long)]
        input: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PathArg {
    Expression,
    RowLevel,
}

impl From<PathArg> for RewritePath {
    fn from(arg: PathArg) -> Self {
        match arg {
            PathArg::Expression => Self::Expression,
            PathArg::RowLevel => Self::RowLevel,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Cli {
        log_file,
        workers,
        command,
    } = Cli::parse();
    match command {
        Commands::Flatten {
            config,
            input,
            output,
            rewrite_path,
        } => {
            let mut config = match config {
                Some(path) => load_config(&path, log_file, workers)?,
                None => PipelineConfig {
                    log_file,
                    workers,
                    ..PipelineConfig::default()
                },
            };
            if let Some(input) = input {
                config.input = input;
            }
            if let Some(output) = output {
                config.flattened_csv = output;
            }
            if let Some(rewrite_path) = rewrite_path {
                config.rewrite_path = rewrite_path.into();
            }
            let ctx = with_telemetry(config.context()?, config.log_file.as_deref(), "flatten")?;
            let summary = run_flatten_configured(&ctx, &config)?;
            println!(
                "wrote {} rows ({}) to {}",
                summary.rows,
                summary.columns.join(", "),
                config.flattened_csv.display()
            );
        }
        Commands::WarmCache { config } => {
            let config = load_config(&config, log_file, workers)?;
            let ctx =
                with_telemetry(config.context()?, config.log_file.as_deref(), "warm-cache")?;
            let summary = run_warm_cache(&ctx, &config)?;
            println!(
                "computed {}, cached {}, skipped {}",
                summary.computed, summary.cached, summary.skipped
            );
        }
        Commands::Train { config } => {
            let config = load_config(&config, log_file, workers)?;
            let ctx =
                with_telemetry(config.context()?, config.log_file.as_deref(), "train")?;
            let report = run_training(&ctx, &config)?;
            print!("{}", report.summary());
            println!("model saved to {}", config.model_path.display());
        }
        Commands::Predict { model, input } => {
            let ctx = with_telemetry(pool(workers)?, log_file.as_deref(), "predict")?;
            for prediction in run_predict(&ctx, &model, &input)? {
                println!(
                    "{}",
                    json!({ "identifier": prediction.identifier, "rating": prediction.rating })
                );
            }
        }
    }
    Ok(())
}

fn load_config(
    path: &Path,
    log_file: Option<PathBuf>,
    workers: Option<usize>,
) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(path)?;
    if log_file.is_some() {
        config.log_file = log_file;
    }
    if workers.is_some() {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn pool(workers: Option<usize>) -> Result<ExecutionContext> {
    match workers {
        Some(workers) => ExecutionContext::new(workers),
        None => ExecutionContext::local(),
    }
    .context("building worker pool")
}

fn with_telemetry(
    ctx: ExecutionContext,
    log_file: Option<&Path>,
    stage: &str,
) -> Result<ExecutionContext> {
    let mut telemetry = PipelineTelemetry::builder(stage).min_level(LogLevel::Info);
    if let Some(path) = log_file {
        telemetry = telemetry.log_path(path);
    }
    let telemetry = telemetry.build()?;
    tracing::info!("{stage} run {}", telemetry.run_id());
    Ok(ctx.with_telemetry(telemetry))
}
