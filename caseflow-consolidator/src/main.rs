//! caseflow-consolidator - case record consolidation
//!
//! Runs the consolidation pipeline and its maintenance passes against the
//! SQLite database in the resolved root folder. Results are printed as JSON.

use anyhow::{Context, Result};
use caseflow_common::config::{DedupScope, RootFolderInitializer, RootFolderResolver, TomlConfig};
use caseflow_common::db::Client;
use caseflow_consolidator::ingest::IngestRow;
use caseflow_consolidator::services::normalizer::normalize_client_code;
use caseflow_consolidator::services::scan_client;
use caseflow_consolidator::AppState;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "caseflow-consolidator")]
#[command(version, about = "Consolidate multiply-ingested case records", long_about = None)]
struct Cli {
    /// Root folder holding the database
    #[arg(long, env = "CASEFLOW_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Path to config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Normalize, resolve duplicates and integrate billing status for one client
    Run {
        /// Client code (defaults to the configured default client)
        #[arg(long)]
        client: Option<String>,
    },

    /// Classification counts per client and in total
    Rollup {
        /// Clients to include (defaults to every active client)
        #[arg(long = "client")]
        clients: Vec<String>,
    },

    /// Repair persisted duplicate groups
    Repair {
        /// Grouping key: per-client or global
        #[arg(long)]
        scope: Option<DedupScope>,

        /// Restrict to one client
        #[arg(long)]
        client: Option<String>,
    },

    /// Map service types onto the canonical vocabulary
    NormalizeServiceTypes {
        #[arg(long)]
        client: Option<String>,
    },

    /// Check that required raw source fields are preserved
    Integrity {
        #[arg(long)]
        client: String,
    },

    /// Report and reset invoiced flags
    BillingReset {
        /// Report only
        #[arg(long)]
        dry_run: bool,
    },

    /// Admit rows from a JSON file into the store
    Ingest {
        /// JSON array of rows
        #[arg(long)]
        file: PathBuf,

        /// Name of the ingestion source
        #[arg(long)]
        source: Option<String>,
    },

    /// Add or update a client
    RegisterClient {
        #[arg(long)]
        code: String,

        #[arg(long)]
        name: String,

        /// Register as inactive
        #[arg(long)]
        inactive: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, config_origin) = TomlConfig::load_or_default(cli.config.as_deref());

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!(
        "caseflow-consolidator v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    config_origin.log();

    // Step 1: Resolve root folder
    let root_folder = RootFolderResolver::new("consolidator")
        .with_cli_arg(cli.root_folder.clone())
        .with_config(&config)
        .resolve();

    // Step 2: Create root folder directory if missing
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;

    // Step 3: Open or create database
    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());

    let pool = caseflow_common::db::init_database(&db_path, config.consolidation.busy_timeout_ms)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let state = AppState::new(pool, config.consolidation.clone());

    match cli.command {
        Commands::Run { client } => {
            let client = client.unwrap_or_else(|| state.config.default_client.clone());
            match state.orchestrator().run_consolidation(&client).await {
                Ok(summary) => print_json(&summary)?,
                Err(aborted) => {
                    print_json(&serde_json::json!({
                        "run_id": aborted.run_id,
                        "stage": aborted.stage,
                        "error": aborted.error.to_string(),
                        "partial": aborted.partial,
                    }))?;
                    return Err(aborted.into());
                }
            }
        }
        Commands::Rollup { clients } => {
            let clients = if clients.is_empty() { None } else { Some(clients) };
            let rollup = state
                .orchestrator()
                .run_multi_source_consolidation(clients)
                .await
                .context("Rollup failed")?;
            print_json(&rollup)?;
        }
        Commands::Repair { scope, client } => {
            let scope = scope.unwrap_or(state.config.dedup_scope);
            let report = state
                .duplicate_repair()
                .repair(scope, client.as_deref())
                .await
                .context("Duplicate repair failed")?;
            print_json(&report)?;
        }
        Commands::NormalizeServiceTypes { client } => {
            let report = state
                .service_type_pass()
                .run(client.as_deref())
                .await
                .context("Service type normalization failed")?;
            print_json(&report)?;
        }
        Commands::Integrity { client } => {
            let report = scan_client(&state.store, &client, &state.config.required_raw_fields)
                .await
                .context("Integrity check failed")?;
            print_json(&report)?;
        }
        Commands::BillingReset { dry_run } => {
            let report = state
                .billing_reset()
                .reset(dry_run)
                .await
                .context("Billing reset failed")?;
            print_json(&report)?;
        }
        Commands::Ingest { file, source } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let rows: Vec<IngestRow> = serde_json::from_str(&content)
                .with_context(|| format!("Invalid ingest file {}", file.display()))?;
            let report = state
                .ingest_admission()
                .ingest_batch(&rows, source.as_deref())
                .await
                .context("Ingestion failed")?;
            print_json(&report)?;
        }
        Commands::RegisterClient { code, name, inactive } => {
            let client = Client {
                code: normalize_client_code(&code),
                name,
                active: !inactive,
            };
            state
                .clients
                .register(&client)
                .await
                .context("Failed to register client")?;
            print_json(&client)?;
        }
    }

    Ok(())
}
