use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use agol_core::DbCredentials;
use agol_sync::{load_config, EtlPipeline, RunContext, Stages};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{error, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "agol-cli")]
#[command(about = "Fetch AGOL survey layers, type them and upsert them into the warehouse")]
struct Cli {
    /// ETL configuration file
    #[arg(long, env = "AGOL_CONFIG", default_value = "yaml/etl_variables.yaml")]
    config: PathBuf,

    /// Run date used to name raw and staged files (defaults to today)
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Only process these surveys; repeatable
    #[arg(long = "survey")]
    surveys: Vec<String>,

    /// Append-mode log file
    #[arg(long, env = "AGOL_LOG_FILE", default_value = "log/agol_etl.log")]
    log_file: PathBuf,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Fetch, transform and load
    Run,
    /// Save raw responses only
    Fetch,
    /// Type the day's raw files and stage them as Parquet
    Transform,
    /// Load the day's staged Parquet files
    Load,
}

impl From<Commands> for Stages {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Run => Stages::All,
            Commands::Fetch => Stages::FetchOnly,
            Commands::Transform => Stages::TransformOnly,
            Commands::Load => Stages::LoadOnly,
        }
    }
}

/// `RUST_LOG` when it parses, `info` otherwise.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn init_tracing(log_file: &Path) -> Result<()> {
    if let Some(parent) = log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening log file {}", log_file.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_ansi(false)
        .with_writer(std::io::stderr.and(Mutex::new(file)))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_file)?;

    let stages = Stages::from(cli.command.unwrap_or(Commands::Run));
    let config = load_config(&cli.config).await?;
    let credentials = match DbCredentials::from_env() {
        Ok(credentials) => Some(credentials),
        Err(err) => {
            if matches!(stages, Stages::All | Stages::LoadOnly) {
                warn!(error = %err, "warehouse credentials unavailable");
            }
            None
        }
    };
    let run_date = cli
        .date
        .unwrap_or_else(|| chrono::Local::now().date_naive());

    let ctx = RunContext::new(config, credentials, run_date, ".");
    let pipeline = EtlPipeline::new(ctx)?;
    let summary = match pipeline.run(stages, &cli.surveys).await {
        Ok(summary) => summary,
        Err(err) => {
            let detail = format!("{err:#}");
            error!(error = %detail, "run aborted");
            return Err(err);
        }
    };

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serializing run summary")?
        );
    } else {
        println!(
            "etl complete: run_id={} date={} surveys={}",
            summary.run_id,
            summary.run_date,
            summary.surveys.len()
        );
        for survey in &summary.surveys {
            println!("  {}", survey.summary_line());
        }
    }

    if summary.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}
