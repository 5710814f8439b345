//! CLI command implementations

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

use crate::batch::BatchStore;
use crate::config::AppConfig;
use crate::metrics;
use crate::shutdown::SharedShutdown;

pub mod error;
pub mod ingest;
pub mod jobs;

pub use error::CliError;
pub use ingest::IngestArgs;
pub use jobs::{ListArgs, SubmitArgs, WorkerArgs};

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

/// Carbon ingest CLI
#[derive(Parser, Debug)]
#[command(name = "carbon-ingest")]
#[command(about = "Ingest cloud emissions data and process activity batches", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// YAML configuration file
    #[arg(long, short, global = true, env = "CARBON_INGEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database URL; overrides `database.url` from the configuration
    #[arg(long, global = true, env = "CARBON_INGEST_DATABASE")]
    pub database: Option<String>,

    /// Prometheus scrape address; overrides `metrics_addr`
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,

    /// Output format (json or human)
    #[arg(long, global = true, value_enum, default_value = "human")]
    pub output_format: OutputFormat,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pull activities from a provider, store them and optionally submit a job
    Ingest(IngestArgs),

    /// Run the batch scheduler until Ctrl+C
    Worker(WorkerArgs),

    /// Submit a job for already stored activities
    Submit(SubmitArgs),

    /// Show a job with its activities and transitions
    Status {
        /// Job id
        job_id: String,
    },

    /// List jobs
    List(ListArgs),

    /// Cancel a job
    Cancel {
        /// Job id
        job_id: String,
    },

    /// Re-queue a failed job
    Retry {
        /// Job id
        job_id: String,
    },

    /// Database and queue health
    Health,
}

impl Cli {
    /// Configuration file (or defaults) with command-line overrides applied
    pub fn load_config(&self) -> Result<AppConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };
        if let Some(url) = &self.database {
            config.database.url = url.clone();
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics_addr = Some(addr);
        }
        config.validate()?;
        Ok(config)
    }

    /// Run the selected command
    pub async fn execute(&self, shutdown: SharedShutdown) -> Result<(), CliError> {
        let config = self.load_config()?;
        if let Some(addr) = config.metrics_addr {
            metrics::init_metrics(addr).await?;
        }

        let store =
            BatchStore::connect_with(&config.database.url, config.database.max_connections)
                .await?;
        info!(database = %config.database.url, "Connected to job store");

        let out = Output(self.output_format);
        match &self.command {
            Commands::Ingest(args) => args.execute(&config, store, shutdown, out).await,
            Commands::Worker(args) => args.execute(&config, store, shutdown, out).await,
            Commands::Submit(args) => args.execute(&config, store, out).await,
            Commands::Status { job_id } => jobs::status(&config, store, job_id, out).await,
            Commands::List(args) => args.execute(&config, store, out).await,
            Commands::Cancel { job_id } => jobs::cancel(&config, store, job_id, out).await,
            Commands::Retry { job_id } => jobs::retry(&config, store, job_id, out).await,
            Commands::Health => jobs::health(&config, store, out).await,
        }
    }
}

/// Prints command results in the selected format
#[derive(Debug, Clone, Copy)]
pub struct Output(pub OutputFormat);

impl Output {
    /// Print `value` as JSON, or the human rendering
    pub fn emit<T: Serialize>(
        &self,
        value: &T,
        human: impl FnOnce(&T) -> String,
    ) -> Result<(), CliError> {
        match self.0 {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Human => println!("{}", human(value)),
        }
        Ok(())
    }
}
