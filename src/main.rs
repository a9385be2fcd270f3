//! Shelfpost binary entry point

use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use shelfpost::config::AppConfig;
use shelfpost::data::{ActivityRecord, ApActivityType, Follower};
use shelfpost::error::AppError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "shelfpost", version, about = "Publish activity records to followers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign and deliver an activity record to its followers
    Publish {
        /// Activity record JSON file
        #[arg(long)]
        record: PathBuf,
        /// Follower list JSON file
        #[arg(long)]
        followers: PathBuf,
        /// Create, Update or Delete
        #[arg(long, default_value = "Create")]
        ap_type: ApActivityType,
    },
    /// Print the unsigned envelope for an activity record
    Render {
        /// Activity record JSON file
        #[arg(long)]
        record: PathBuf,
        #[arg(long, default_value = "Create")]
        ap_type: ApActivityType,
    },
}

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics
/// 4. Run the requested command
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = AppConfig::load()?;

    // 2. Initialize tracing/logging
    let default_filter = format!("shelfpost={}", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.clone().into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.clone().into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 3. Initialize metrics
    shelfpost::metrics::init_metrics();

    // 4. Run command
    match cli.command {
        Command::Publish {
            record,
            followers,
            ap_type,
        } => {
            let record = ActivityRecord::from_json(&read_file(&record).await?)?;
            let followers: Vec<Follower> = read_json(&followers).await?;
            let outbox = shelfpost::build_outbox(&config)?;

            let report = outbox.publish(&record, ap_type, &followers).await?;
            for result in &report.results {
                match &result.error {
                    None => println!("ok      {}", result.inbox_uri),
                    Some(error) => println!("failed  {}  {}", result.inbox_uri, error),
                }
            }
            println!(
                "{} {:?}: {} delivered, {} failed",
                report.record_id,
                report.state,
                report.succeeded(),
                report.failed()
            );
        }
        Command::Render { record, ap_type } => {
            let record = ActivityRecord::from_json(&read_file(&record).await?)?;
            let outbox = shelfpost::build_outbox(&config)?;
            let envelope = outbox.preview(&record, ap_type, Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
    }

    Ok(())
}

async fn read_file(path: &Path) -> Result<String, AppError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AppError::Configuration(format!("Cannot read {}: {}", path.display(), e)))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, AppError> {
    Ok(serde_json::from_str(&read_file(path).await?)?)
}
