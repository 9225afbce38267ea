//! `swarmflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`      : validate a flow JSON file.
//! - `simulate`      : run a flow on an in-process swarm.
//! - `verify-ledger` : reload an archived execution ledger and re-validate it.
//! - `migrate`       : run pending database migrations.

mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use engine::{
    ExecutionLedger, ExecutionRecord, FlowDefinition, LedgerConfig, PgLedgerArchive, SwarmConfig,
};
use fabric::{Ed25519Signer, MemoryBlobStore};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::simulate::Simulation;

#[derive(Parser)]
#[command(
    name = "swarmflow",
    about = "Peer-to-peer swarm flow coordination",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a flow definition JSON file.
    Validate {
        /// Path to the flow JSON file.
        path: PathBuf,
    },
    /// Run a flow on an in-process swarm and print the outcome.
    Simulate {
        path: PathBuf,
        #[arg(long, default_value_t = 3)]
        nodes: usize,
        #[arg(long, default_value_t = 4)]
        validators: usize,
        /// Swarm configuration JSON; defaults apply to anything it omits.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Flow input as a JSON document.
        #[arg(long, default_value = "{}")]
        input: String,
        /// Write the execution's ledger records to this file.
        #[arg(long)]
        ledger_out: Option<PathBuf>,
    },
    /// Validate an execution ledger and replay it.
    ///
    /// Reads exported records from a file, or with `--execution-id` loads the
    /// chain from the ledger archive.
    VerifyLedger {
        #[arg(required_unless_present = "execution_id", conflicts_with = "execution_id")]
        path: Option<PathBuf>,
        #[arg(long, requires = "database_url")]
        execution_id: Option<Uuid>,
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        /// Public key whose records are accepted; repeatable. Without any,
        /// every record need only be signed by its own actor.
        #[arg(long = "trusted-key")]
        trusted_keys: Vec<String>,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

fn read_flow(path: &Path) -> anyhow::Result<FlowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).context("invalid flow JSON")
}

/// Rebuild a ledger from exported records. Every record is checked as it is
/// ingested, so a broken chain fails here with the offending index.
async fn load_exported(path: &Path, config: LedgerConfig) -> anyhow::Result<(ExecutionLedger, Uuid)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let records: Vec<ExecutionRecord> = serde_json::from_str(&content).context("invalid ledger JSON")?;
    let execution_id = records
        .first()
        .map(|r| r.execution_id)
        .context("ledger file holds no records")?;
    if records.iter().any(|r| r.execution_id != execution_id) {
        anyhow::bail!("ledger file mixes executions");
    }

    let ledger = ExecutionLedger::new(
        Arc::new(Ed25519Signer::generate()),
        Arc::new(MemoryBlobStore::new()),
    )
    .with_config(config);
    for record in records {
        ledger.ingest_record(record).await?;
    }
    Ok((ledger, execution_id))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let flow = read_flow(&path)?;
            match engine::validate_flow(&flow) {
                Ok(order) => {
                    println!("✅ Flow is valid. Execution order: {order:?}");
                }
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Simulate {
            path,
            nodes,
            validators,
            config,
            input,
            ledger_out,
        } => {
            let flow = read_flow(&path)?;
            let config = match config {
                Some(path) => SwarmConfig::from_json_file(&path)?,
                None => SwarmConfig::default(),
            };
            let input: Value = serde_json::from_str(&input).context("invalid --input JSON")?;

            let simulation = Simulation {
                workers: nodes,
                validators,
                config,
            };
            let (outcome, records) = simulation.run(&flow, input).await?;
            if let Some(out) = ledger_out {
                std::fs::write(&out, serde_json::to_vec_pretty(&records)?)
                    .with_context(|| format!("cannot write {}", out.display()))?;
                info!(path = %out.display(), records = records.len(), "ledger exported");
            }
            let summary = json!({
                "execution_id": outcome.execution_id,
                "status": outcome.status,
                "failed_steps": outcome.failed_steps,
                "skipped_steps": outcome.skipped_steps,
                "records": outcome.records,
                "ledger_head": outcome.ledger_head,
                "state_hash": outcome.state_hash,
                "state": outcome.final_state,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::VerifyLedger {
            path,
            execution_id,
            database_url,
            trusted_keys,
        } => {
            let config = LedgerConfig {
                trusted_signers: trusted_keys,
                ..LedgerConfig::default()
            };
            let (ledger, execution_id) = match (path, execution_id, database_url) {
                (Some(path), _, _) => load_exported(&path, config).await?,
                (None, Some(execution_id), Some(database_url)) => {
                    let pool = db::pool::create_pool(&database_url, 2).await?;
                    let ledger = ExecutionLedger::new(
                        Arc::new(Ed25519Signer::generate()),
                        Arc::new(db::PgBlobStore::new(pool.clone())),
                    )
                    .with_config(config)
                    .with_archive(Arc::new(PgLedgerArchive::new(pool)));
                    let loaded = ledger.restore(execution_id).await?;
                    info!(%execution_id, records = loaded, "ledger restored");
                    (ledger, execution_id)
                }
                _ => anyhow::bail!("either a records file or --execution-id with --database-url is required"),
            };

            let replay = ledger.start_replay(execution_id).await?;
            let finished = ledger.complete_replay(replay.replay_id)?;
            println!(
                "✅ Ledger for {execution_id} is valid: {} records, replay hash {}",
                finished.total, finished.state_hash
            );
        }
        Command::Migrate { database_url } => {
            info!("Running migrations against {database_url}");
            let pool = db::pool::create_pool(&database_url, 2).await?;
            db::pool::run_migrations(&pool).await?;
            info!("Migrations applied successfully");
        }
    }

    Ok(())
}
