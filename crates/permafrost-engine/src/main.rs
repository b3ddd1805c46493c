//! permafrost - age-based data lifecycle pipeline
//!
//! For each configured table, one run advances all eligible rows one tier
//! colder: online database → history database → cold CSV archives. Runs are
//! user-triggered; there is no scheduler.
//!
//! ```text
//! # execute one run
//! permafrost -c permafrost.yaml run
//!
//! # validate configuration and probe connections
//! permafrost -c permafrost.yaml validate
//!
//! # list the settings a run would process
//! permafrost -c permafrost.yaml settings
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use permafrost_db::{Connection, DatabaseGateway};
use permafrost_engine::audit::SqlAuditWriter;
use permafrost_engine::config::EngineConfig;
use permafrost_engine::retry::RetryExecutor;
use permafrost_engine::settings::{SqlSettingsProvider, StaticSettingsProvider};
use permafrost_engine::{ArchiveEngine, SettingsProvider};

#[derive(Parser)]
#[command(name = "permafrost")]
#[command(version, about = "Age-based data lifecycle pipeline: online tier → history tier → cold CSV archives")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "permafrost.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one archive run over all enabled settings (default)
    Run,
    /// Validate the configuration file and probe the named connections
    Validate,
    /// List the settings a run would process
    Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "permafrost=debug,permafrost_engine=debug,permafrost_db=debug,info"
    } else {
        "permafrost=info,permafrost_engine=info,permafrost_db=info,warn"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Validate => validate(config).await,
        Commands::Settings => list_settings(config).await,
    }
}

fn settings_provider(
    config: &EngineConfig,
    gateway: &Arc<DatabaseGateway>,
) -> Arc<dyn SettingsProvider> {
    match &config.settings.table {
        Some(table) => Arc::new(SqlSettingsProvider::new(
            Arc::clone(gateway),
            table.connection.clone(),
            table.name.clone(),
        )),
        None => Arc::new(StaticSettingsProvider::new(config.settings.inline.clone())),
    }
}

async fn run(config: EngineConfig) -> Result<()> {
    let gateway = Arc::new(DatabaseGateway::new(config.connections.clone()));
    let provider = settings_provider(&config, &gateway);

    let mut engine = ArchiveEngine::new(Arc::clone(&gateway), provider)
        .with_retry(RetryExecutor::new(config.retry.clone()))
        .with_csv_options(config.csv.clone())
        .with_batch_policy(config.batch)
        .with_delete_timeout(config.delete_timeout_seconds.map(Duration::from_secs));
    if let Some(audit) = &config.audit {
        engine = engine.with_audit_writer(Arc::new(SqlAuditWriter::new(
            Arc::clone(&gateway),
            audit.connection.clone(),
        )));
    }

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next suspension point");
            ctrl_c_token.cancel();
        }
    });

    let report = engine.run_once(&cancel).await;
    for message in &report.messages {
        println!("{message}");
    }

    if !report.succeeded {
        std::process::exit(1);
    }
    Ok(())
}

async fn validate(config: EngineConfig) -> Result<()> {
    let gateway = Arc::new(DatabaseGateway::new(config.connections.clone()));

    let mut failures = 0_u32;
    for name in config.connections.keys() {
        match gateway.open(name).await {
            Ok(conn) => match conn.query_scalar("SELECT 1", &[]).await {
                Ok(_) => println!("connection '{name}': ok"),
                Err(e) => {
                    failures += 1;
                    println!("connection '{name}': probe failed: {e}");
                }
            },
            Err(e) => {
                failures += 1;
                println!("connection '{name}': {e}");
            }
        }
    }

    println!(
        "configuration ok: {} connections, {} inline settings{}",
        config.connections.len(),
        config.settings.inline.len(),
        config
            .settings
            .table
            .as_ref()
            .map(|t| format!(", settings table '{}' on '{}'", t.name, t.connection))
            .unwrap_or_default()
    );

    if failures > 0 {
        anyhow::bail!("{failures} connection(s) failed their probe");
    }
    Ok(())
}

async fn list_settings(config: EngineConfig) -> Result<()> {
    let gateway = Arc::new(DatabaseGateway::new(config.connections.clone()));
    let provider = settings_provider(&config, &gateway);

    let cancel = CancellationToken::new();
    let settings = provider
        .list_all(&cancel)
        .await
        .context("failed to load settings")?;

    if settings.is_empty() {
        println!("no settings configured");
        return Ok(());
    }

    info!(count = settings.len(), "loaded settings");
    for s in &settings {
        println!(
            "[{}] {} ({} -> {}) online<{} history<{} batch={} csv={} delete={}",
            if s.enabled { "enabled " } else { "disabled" },
            s.table_name,
            s.source_connection,
            s.target_connection,
            s.online_cutoff,
            s.history_cutoff,
            s.effective_batch_size(),
            s.csv_enabled,
            s.physical_delete_enabled,
        );
    }
    Ok(())
}
