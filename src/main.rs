//! Constituent hub CLI entry point.

use constituent_hub::api::{ApiState, start_http_server};
use constituent_hub::config::Config;
use constituent_hub::db::Db;
use constituent_hub::{Hub, HubDeps, Provider};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::sync::Arc;

#[derive(Parser)]
#[command(name = "constituent-hub")]
#[command(about = "Ingests constituent email, SMS, and calls, classifies them, and reports on trends")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and the background loop (default)
    Serve,
    /// Pull new messages from a provider once
    Sync {
        #[arg(default_value = "gmail")]
        provider: String,
    },
    /// Classify pending communications once
    AnalyzePending {
        /// Specific ids; all pending rows when omitted
        ids: Vec<String>,
    },
    /// Generate a strategic analysis
    Rollup {
        /// Ignore the rollup gate
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = if let Some(config_path) = cli.config {
        Config::load_from_path(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::load().with_context(|| "failed to load configuration from environment")?
    };
    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");

    let db = Db::connect(&config.data_dir)
        .await
        .with_context(|| "failed to connect to database")?;

    let config = Arc::new(config);
    let deps = HubDeps::from_config(&config, db.sqlite.clone())
        .with_context(|| "failed to initialize provider clients")?;
    let hub = Hub::new(config.clone(), deps).with_context(|| "failed to initialize hub")?;

    hub.recover_stale()
        .await
        .with_context(|| "failed to recover stale classifications")?;

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(hub, &config).await,
        Command::Sync { provider } => {
            let provider = Provider::parse(&provider)
                .with_context(|| format!("unknown provider: {provider}"))?;
            let report = hub.sync_now(provider).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::AnalyzePending { ids } => {
            let outcome = if ids.is_empty() {
                hub.analyze_all_pending(hub.default_user()).await?
            } else {
                hub.analyze_pending(&ids).await
            };
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Rollup { force } => {
            match hub.refresh_strategic(hub.default_user(), force).await? {
                Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                None => println!("rollup not due; pass --force to generate anyway"),
            }
            Ok(())
        }
    };

    db.close().await;
    result
}

async fn serve(hub: Hub, config: &Config) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let background = hub.spawn_background(shutdown_rx.clone());
    let state = Arc::new(ApiState::new(hub));
    let server = start_http_server(config.bind_addr()?, state, shutdown_rx).await?;

    tracing::info!("constituent hub started");
    tokio::signal::ctrl_c()
        .await
        .with_context(|| "failed to listen for shutdown signal")?;

    tracing::info!("shutting down");
    shutdown_tx.send(true).ok();
    let _ = tokio::join!(server, background);

    tracing::info!("constituent hub stopped");
    Ok(())
}
