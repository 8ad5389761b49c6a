// ABOUTME: CLI entry point for trigger-replicator
// ABOUTME: Parses commands and routes them to the apply engine, replay driver, or log store

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use trigger_replicator::apply::{LogApplyEngine, ReplicaTarget};
use trigger_replicator::capture::{LogGeneration, LogStore};
use trigger_replicator::catalog::Catalog;
use trigger_replicator::change::QualifiedName;
use trigger_replicator::codec;
use trigger_replicator::config::ReplicatorConfig;
use trigger_replicator::postgres::{self, PgLogStore, PgReplica};
use trigger_replicator::replay::{self, ReplayCheckpoint};
use trigger_replicator::session::SessionContext;
use trigger_replicator::sqlite::SqliteReplica;
use trigger_replicator::utils::{sanitize_url, validate_connection_string};

#[derive(Parser)]
#[command(name = "trigger-replicator")]
#[command(about = "Trigger-based change capture and single-row log replay", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to a TOML configuration file
    #[arg(long, global = true, env = "TRIGGER_REPLICATOR_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a single log entry to a replica
    Apply {
        /// Replica: postgres:// URL or sqlite:<path>
        #[arg(long, env = "TARGET_URL")]
        target: String,
        /// Command code: I, U, or D
        #[arg(long)]
        command: String,
        /// Schema-qualified table name
        #[arg(long)]
        table: String,
        /// Serialized column info
        #[arg(long)]
        info: String,
    },
    /// Replay a JSON-lines file of log records, resuming from a checkpoint
    Replay {
        /// Replica: postgres:// URL or sqlite:<path>
        #[arg(long, env = "TARGET_URL")]
        target: String,
        /// Log records, one JSON object per line
        #[arg(long)]
        file: PathBuf,
        /// Snapshot records from export-log, used to order transactions by commit
        #[arg(long)]
        snapshots: Option<PathBuf>,
        /// Checkpoint file (defaults to the configured path)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Ignore any existing checkpoint and start from the first record
        #[arg(long, default_value_t = false)]
        no_resume: bool,
    },
    /// Decode serialized column info and print it as JSON
    Inspect {
        #[arg(long)]
        info: String,
    },
    /// Create the log schema on a source database and start a new log generation
    InitLog {
        #[arg(long, env = "SOURCE_URL")]
        source: String,
        /// Schema for the log tables (defaults to the configured schema)
        #[arg(long)]
        schema: Option<String>,
    },
    /// Write the records of a log generation as JSON lines
    ExportLog {
        #[arg(long, env = "SOURCE_URL")]
        source: String,
        #[arg(long)]
        schema: Option<String>,
        /// Generation to export (defaults to the current one)
        #[arg(long)]
        generation: Option<i64>,
        #[arg(long)]
        out: PathBuf,
        /// Also write the generation's snapshot records here
        #[arg(long)]
        snapshots_out: Option<PathBuf>,
    },
    /// Reject writes to a PostgreSQL table unless the session is in daemon mode
    InstallGuard {
        #[arg(long, env = "TARGET_URL")]
        target: String,
        /// Schema-qualified table name
        #[arg(long)]
        table: String,
    },
}

/// A replica named on the command line.
enum Target {
    Postgres(String),
    Sqlite(PathBuf),
}

fn parse_target(target: &str) -> anyhow::Result<Target> {
    if target.starts_with("postgres://") || target.starts_with("postgresql://") {
        validate_connection_string(target)?;
        return Ok(Target::Postgres(target.to_string()));
    }
    if let Some(path) = target.strip_prefix("sqlite:") {
        if path.is_empty() {
            bail!("SQLite target needs a path: sqlite:<path>");
        }
        return Ok(Target::Sqlite(PathBuf::from(path)));
    }
    bail!(
        "Unsupported target '{}': expected a postgres:// URL or sqlite:<path>",
        sanitize_url(target)
    )
}

fn open_sqlite(path: &Path, config: &ReplicatorConfig) -> anyhow::Result<SqliteReplica> {
    let mut replica = SqliteReplica::open(path)?;
    for table in config.guarded()? {
        replica.guard_table(table);
    }
    Ok(replica)
}

async fn apply_entry<H: Catalog + ReplicaTarget>(
    host: &mut H,
    command: &str,
    table: &str,
    info: &str,
) -> anyhow::Result<()> {
    let session = SessionContext::daemon();
    LogApplyEngine::new()
        .apply(&session, host, command, table, info)
        .await
        .with_context(|| format!("Failed to apply {} on {}", command, table))?;
    println!("Applied {} on {}", command, table);
    Ok(())
}

async fn replay_file<H: Catalog + ReplicaTarget>(
    host: &mut H,
    target: &str,
    file: &Path,
    snapshots: Option<&Path>,
    checkpoint_path: &Path,
    no_resume: bool,
) -> anyhow::Result<()> {
    let records = replay::read_records(file).await?;
    let snapshots = match snapshots {
        Some(path) => replay::read_snapshots(path).await?,
        None => Vec::new(),
    };
    let mut checkpoint = if no_resume {
        ReplayCheckpoint::new(file, target)
    } else {
        ReplayCheckpoint::load_or_new(checkpoint_path, file, target).await?
    };

    tracing::info!(
        "Replaying {} records from {:?} into {}",
        records.len(),
        file,
        sanitize_url(target)
    );
    let summary = replay::replay_records(
        host,
        &records,
        &snapshots,
        &mut checkpoint,
        Some(checkpoint_path),
    )
    .await?;
    println!(
        "Replay complete: {} transactions applied, {} skipped",
        summary.applied, summary.skipped
    );
    Ok(())
}

async fn write_json_lines<T: serde::Serialize>(path: &Path, items: &[T]) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create {:?}", path))?;
    for item in items {
        let mut line = serde_json::to_string(item).context("Failed to serialize export line")?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;
    }
    file.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    postgres::init_tls_policy(cli.allow_self_signed_certs);

    let config = ReplicatorConfig::load_optional(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Apply {
            target,
            command,
            table,
            info,
        } => match parse_target(&target)? {
            Target::Postgres(url) => {
                let mut client = postgres::connect_with_retry(&url, config.connect_retries)
                    .await
                    .context("Failed to connect to target")?;
                let mut replica = PgReplica::new(&mut client);
                apply_entry(&mut replica, &command, &table, &info).await
            }
            Target::Sqlite(path) => {
                let mut replica = open_sqlite(&path, &config)?;
                apply_entry(&mut replica, &command, &table, &info).await
            }
        },
        Commands::Replay {
            target,
            file,
            snapshots,
            checkpoint,
            no_resume,
        } => {
            let snapshots = snapshots.as_deref();
            let checkpoint_path = checkpoint.unwrap_or_else(|| config.checkpoint_path());
            match parse_target(&target)? {
                Target::Postgres(url) => {
                    let mut client = postgres::connect_with_retry(&url, config.connect_retries)
                        .await
                        .context("Failed to connect to target")?;
                    let mut replica = PgReplica::new(&mut client);
                    replay_file(
                        &mut replica,
                        &target,
                        &file,
                        snapshots,
                        &checkpoint_path,
                        no_resume,
                    )
                    .await
                }
                Target::Sqlite(path) => {
                    let mut replica = open_sqlite(&path, &config)?;
                    replay_file(
                        &mut replica,
                        &target,
                        &file,
                        snapshots,
                        &checkpoint_path,
                        no_resume,
                    )
                    .await
                }
            }
        }
        Commands::Inspect { info } => {
            let columns = codec::parse_column_info(&info).context("Failed to decode column info")?;
            let json = serde_json::to_string_pretty(&columns)
                .context("Failed to serialize decoded columns")?;
            println!("{}", json);
            Ok(())
        }
        Commands::InitLog { source, schema } => {
            validate_connection_string(&source)?;
            let schema = schema.unwrap_or_else(|| config.log_schema.clone());
            let client = postgres::connect_with_retry(&source, config.connect_retries)
                .await
                .context("Failed to connect to source")?;
            let store = PgLogStore::new(&client, schema);
            store.install().await?;
            let generation = store.start_generation().await?;
            println!("Log generation {} is active", generation);
            Ok(())
        }
        Commands::ExportLog {
            source,
            schema,
            generation,
            out,
            snapshots_out,
        } => {
            validate_connection_string(&source)?;
            let schema = schema.unwrap_or_else(|| config.log_schema.clone());
            let client = postgres::connect_with_retry(&source, config.connect_retries)
                .await
                .context("Failed to connect to source")?;
            let store = PgLogStore::new(&client, schema);
            let generation = match generation {
                Some(id) => LogGeneration(id),
                None => store.current_generation().await?,
            };

            let records = store.read_transactions(generation).await?;
            write_json_lines(&out, &records).await?;
            println!(
                "Exported {} records from generation {} to {:?}",
                records.len(),
                generation,
                out
            );

            if let Some(path) = snapshots_out {
                let snapshots = store.read_snapshots(generation).await?;
                write_json_lines(&path, &snapshots).await?;
                println!(
                    "Exported {} snapshot records from generation {} to {:?}",
                    snapshots.len(),
                    generation,
                    path
                );
            }
            Ok(())
        }
        Commands::InstallGuard { target, table } => {
            let Target::Postgres(url) = parse_target(&target)? else {
                bail!("install-guard needs a PostgreSQL target; SQLite tables are guarded through guarded_tables in the config file");
            };
            let table = QualifiedName::parse(&table)?;
            let mut client = postgres::connect_with_retry(&url, config.connect_retries)
                .await
                .context("Failed to connect to target")?;
            PgReplica::new(&mut client)
                .install_access_guard(&table)
                .await?;
            println!("Access guard installed on {}", table);
            Ok(())
        }
    }
}
