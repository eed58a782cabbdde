use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use floorcast::{
    config::AppConfig,
    ml::{FileModelRepository, ModelRegistry},
    observation::CalendarRow,
    pipeline::{FloorPipeline, RunMode, latest_date},
    preprocess::{preprocess, read_raw_readings},
    storage::{ForecastStore, LocalCsvStore, PartitionedCsvStore},
    traits::SystemClock,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "floorcast")]
#[command(about = "Per-floor power quantile forecasts with walk-forward model selection")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Select a model per floor and write the two-week forecast
    Run {
        /// CSV of raw meter readings
        #[arg(long)]
        input: PathBuf,
        /// No previous model exists for the floors
        #[arg(long)]
        first_model: bool,
        /// Floors to run (defaults to the configured floors)
        #[arg(long = "floor")]
        floors: Vec<u32>,
        /// Ignore readings on or after this date
        #[arg(long)]
        before: Option<NaiveDate>,
        /// Forecast CSV (defaults to storage.forecast_csv)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the walk-forward folds for a number of weeks
    Folds {
        #[arg(long)]
        weeks: usize,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .parse_lossy("floorcast=debug");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;

    match args.command {
        Command::Run {
            input,
            first_model,
            floors,
            before,
            output,
        } => {
            let mode = if first_model {
                RunMode::FirstModel
            } else {
                RunMode::Continuation
            };
            run(&config, &input, mode, floors, before, output)
        }
        Command::Folds { weeks } => print_folds(&config, weeks),
    }
}

fn run(
    config: &AppConfig,
    input: &Path,
    mode: RunMode,
    floors: Vec<u32>,
    before: Option<NaiveDate>,
    output: Option<PathBuf>,
) -> Result<()> {
    let settings = config.pipeline_settings()?;
    let readings = read_raw_readings(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let mut history = preprocess(&readings, config.preprocess.energy_scale_factor)?;
    if let Some(before) = before {
        history.retain(|row| row.date() < before);
    }
    let run_date = latest_date(&history).context("No observations left to train on")?;
    let floors = if floors.is_empty() {
        config.pipeline.floors.clone()
    } else {
        floors
    };

    let registry = ModelRegistry::default();
    let repository = FileModelRepository::new(&config.storage.model_dir, &config.storage.experiment);
    let clock = SystemClock;
    let pipeline = FloorPipeline {
        settings: &settings,
        registry: &registry,
        repository: &repository,
        clock: &clock,
    };

    let results = pipeline.run_floors(&history, &floors, run_date, mode);

    let mut forecast = Vec::new();
    let mut failed = Vec::new();
    for (floor, result) in results {
        match result {
            Ok(report) => {
                tracing::info!(
                    "Floor {}: {} ({}), test MWIS {:.4}, MAE {:.4}, {} trials",
                    floor,
                    report.run_name,
                    report.winner,
                    report.metrics.mwis,
                    report.metrics.mae,
                    report.trials
                );
                forecast.extend(report.forecast);
            }
            Err(e) => failed.push(format!("floor {floor}: {e}")),
        }
    }

    if !forecast.is_empty() {
        let path = output.unwrap_or_else(|| config.storage.forecast_csv.clone());
        LocalCsvStore::new(path).write(&forecast)?;
        if let Some(dir) = &config.storage.partition_dir {
            PartitionedCsvStore::new(dir, config.storage.write_mode).write(&forecast)?;
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("{} floor(s) failed: {}", failed.len(), failed.join("; "));
    }
    Ok(())
}

fn print_folds(config: &AppConfig, weeks: usize) -> Result<()> {
    let walk = config.cross_validation.walk_forward()?;
    let folds = walk.bounds(weeks);
    println!(
        "{} folds ({}, window {} weeks, step {}, horizon {:?})",
        folds.len(),
        walk.policy,
        walk.window_weeks,
        walk.step_weeks,
        walk.horizon
    );
    for (i, fold) in folds.iter().enumerate() {
        println!(
            "fold {i}: train weeks {}..{} ({}), validation weeks {:?}",
            fold.train.start,
            fold.train.end,
            fold.train.len(),
            fold.validation
        );
    }
    Ok(())
}
