//! HealthChain registry CLI
//!
//! Drives the registry facade against the ledgers named in configuration and
//! prints results as JSON.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::debug;

use healthchain::clock::SystemClock;
use healthchain::config;
use healthchain::models::ActorId;
use healthchain::{telemetry, Registry};

/// Exit status when records were returned but the access could not be audited.
const EXIT_UNAUDITED: u8 = 3;

#[derive(Parser)]
#[command(name = "healthchain", about = "Biometric-keyed medical record registry")]
struct Cli {
    /// File holding the patient's biometric template.
    #[arg(long, env = "HEALTHCHAIN_TEMPLATE_FILE", global = true)]
    template_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Content-address a record file and append it to the patient's log.
    Upload {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        author: String,
    },
    /// Append an externally issued pointer, such as an IPFS CID.
    UploadPointer {
        #[arg(long)]
        pointer: String,
        #[arg(long)]
        author: String,
    },
    /// Read the patient's records and record the access.
    Fetch {
        #[arg(long)]
        author: String,
    },
    /// List every recorded read of the patient's records.
    AccessLog,
    /// Check the hash chains of the patient's record and access logs.
    Verify,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<ExitCode> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;
    telemetry::init(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))?;
    debug!(?config, "Loaded configuration");

    run(cli, &config).await
}

async fn run(cli: Cli, config: &config::Config) -> Result<ExitCode> {
    // Resolve the patient before touching storage so a bad invocation creates no database files.
    let template_file = cli
        .template_file
        .context("--template-file (or HEALTHCHAIN_TEMPLATE_FILE) is required")?;
    let template = read_template(&template_file).await?;

    let registry = Registry::from_config(config, Arc::new(SystemClock))
        .await
        .context("Failed to open ledgers")?;

    match cli.command {
        Commands::Upload { file, author } => {
            let blob = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let entry = registry.upload(&template, &blob, &ActorId::new(author)?).await?;
            print_json(&entry)?;
        }
        Commands::UploadPointer { pointer, author } => {
            let entry = registry
                .upload_pointer(&template, &pointer, &ActorId::new(author)?)
                .await?;
            print_json(&entry)?;
        }
        Commands::Fetch { author } => {
            let outcome = registry.fetch(&template, &ActorId::new(author)?).await?;
            let audit = match &outcome.audit {
                Ok(entry) => serde_json::to_value(entry)?,
                Err(err) => json!({ "error": err.to_string(), "retryable": err.is_retryable() }),
            };
            print_json(&json!({ "records": outcome.records, "audit": audit }))?;
            if !outcome.is_audited() {
                return Ok(ExitCode::from(EXIT_UNAUDITED));
            }
        }
        Commands::AccessLog => {
            let history = registry.access_history(&template).await?;
            print_json(&history)?;
        }
        Commands::Verify => {
            let report = registry.verify_integrity(&template).await?;
            print_json(&report)?;
            if !report.is_intact() {
                bail!("ledger hash chain is broken");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn read_template(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read template file {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
