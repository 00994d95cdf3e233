//! Command-line interface for device risk estimation.
//!
//! Usage:
//!     medrisk train --dataset realistic_risk_data.csv
//!     medrisk predict --manufacturer "Acme" --device "Infusion Pump"
//!     medrisk alternatives --manufacturer "Acme" --device "Infusion Pump" --top-k 5
//!     medrisk index --dataset realistic_risk_data.csv
//!     medrisk health

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use medrisk_alternatives::RankConfig;
use medrisk_classifier::{BoosterConfig, TrainConfig, TrainingReport};
use medrisk_dataset::load_dataset;
use medrisk_explain::describe_alternatives;
use medrisk_model::RiskClass;
use medrisk_service::{ArtifactPaths, RiskService};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "medrisk")]
#[command(about = "Estimate medical device recall risk and suggest alternatives")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding the model and alternatives index
    #[arg(long, env = "MEDRISK_ARTIFACTS_DIR", default_value = "artifacts", global = true)]
    artifacts_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the model and rebuild the alternatives index
    Train {
        /// Path to the dataset CSV
        #[arg(short, long)]
        dataset: PathBuf,

        /// Fraction of rows held out for evaluation
        #[arg(long, default_value = "0.2")]
        test_size: f64,

        /// Seed for split and fold shuffles
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Cross-validation folds (0 disables)
        #[arg(long, default_value = "5")]
        cv_folds: usize,

        /// Boosting stages
        #[arg(long, default_value = "100")]
        n_estimators: usize,

        /// Boosting learning rate
        #[arg(long, default_value = "0.1")]
        learning_rate: f64,

        /// Maximum tree depth
        #[arg(long, default_value = "3")]
        max_depth: usize,

        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Predict the risk of a device
    Predict {
        #[arg(short, long)]
        manufacturer: String,

        #[arg(short, long)]
        device: String,

        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Suggest lower-risk alternatives
    Alternatives {
        #[arg(short, long)]
        manufacturer: String,

        #[arg(short, long)]
        device: String,

        /// Maximum suggestions
        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,

        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Rebuild the alternatives index from the current model
    Index {
        /// Path to the dataset CSV
        #[arg(short, long)]
        dataset: PathBuf,
    },

    /// Check which artifacts are loadable
    Health,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "medrisk=debug" } else { "medrisk=info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.parse()?),
        )
        .init();

    let paths = ArtifactPaths::new(&cli.artifacts_dir);
    // Training writes a fresh pair, so a broken one on disk must not block it
    let service = if matches!(cli.command, Commands::Train { .. }) {
        RiskService::empty(paths, RankConfig::default())
    } else {
        RiskService::open(paths, RankConfig::default())?
    };

    match cli.command {
        Commands::Train {
            dataset,
            test_size,
            seed,
            cv_folds,
            n_estimators,
            learning_rate,
            max_depth,
            format,
        } => {
            let config = TrainConfig {
                test_size,
                seed,
                cv_folds,
                booster: BoosterConfig {
                    n_estimators,
                    learning_rate,
                    max_depth,
                    ..Default::default()
                },
                ..Default::default()
            };
            run_train(&service, &dataset, &config, format)?;
        }
        Commands::Predict {
            manufacturer,
            device,
            format,
        } => {
            run_predict(&service, &manufacturer, &device, format)?;
        }
        Commands::Alternatives {
            manufacturer,
            device,
            top_k,
            format,
        } => {
            run_alternatives(&service, &manufacturer, &device, top_k, format)?;
        }
        Commands::Index { dataset } => {
            let dataset = load_dataset(&dataset)?;
            let entries = service.rebuild_index(&dataset)?;
            println!("Rebuilt alternatives index with {} entries", entries);
        }
        Commands::Health => {
            run_health(&service);
        }
    }

    Ok(())
}

fn run_train(
    service: &RiskService<ArtifactPaths>,
    dataset: &Path,
    config: &TrainConfig,
    format: Format,
) -> Result<()> {
    let dataset = load_dataset(dataset)?;
    let report = service.retrain(&dataset, config)?;

    match format {
        Format::Json => print_json(&report)?,
        Format::Text => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &TrainingReport) {
    println!("Train rows: {} | Test rows: {}", report.n_train, report.n_test);
    if let Some(cv) = &report.cross_validation {
        println!("CV accuracy: {:.4} ± {:.4}", cv.mean_score, cv.std_score);
    }
    println!("Test accuracy: {:.4}", report.test.accuracy);
    println!("Weighted F1: {:.4}", report.test.weighted_f1);
    println!("{}", report.test);
}

fn run_predict(
    service: &RiskService<ArtifactPaths>,
    manufacturer: &str,
    device: &str,
    format: Format,
) -> Result<()> {
    let assessment = service.assess(manufacturer, device)?;

    if format == Format::Json {
        return print_json(&assessment);
    }

    println!("=== Risk Assessment ===");
    println!("Device: {}", device);
    println!("Manufacturer: {}", manufacturer);
    println!("Risk Class: {}", assessment.prediction.risk_class);
    println!("Risk Percent: {:.2}%", assessment.prediction.risk_percent);
    for class in RiskClass::ALL {
        println!(
            "   {:<6} {:>6.2}%",
            class.short_name(),
            assessment.prediction.class_probabilities.get(class) * 100.0
        );
    }
    if let Some(warning) = &assessment.details.warning {
        println!("WARNING: {}", warning);
    }

    if !assessment.alternatives.is_empty() {
        println!("\nSuggested Alternatives:");
        for line in describe_alternatives(&assessment.alternatives) {
            println!(" - {}", line);
        }
    }
    Ok(())
}

fn run_alternatives(
    service: &RiskService<ArtifactPaths>,
    manufacturer: &str,
    device: &str,
    top_k: usize,
    format: Format,
) -> Result<()> {
    let alternatives = service.suggest(manufacturer, device, top_k)?;

    match format {
        Format::Json => print_json(&alternatives)?,
        Format::Text => {
            for line in describe_alternatives(&alternatives) {
                println!("{}", line);
            }
            println!("---");
            println!("Total: {} alternatives", alternatives.len());
        }
    }
    Ok(())
}

fn run_health(service: &RiskService<ArtifactPaths>) {
    let health = service.health();

    match health.model_features {
        Some(features) => println!("Model: OK ({} features)", features),
        None => println!("Model: MISSING"),
    }
    match health.index_entries {
        Some(entries) => println!("Alternatives index: OK ({} entries)", entries),
        None => println!("Alternatives index: MISSING"),
    }

    if !health.model_loaded {
        std::process::exit(1);
    }
}
