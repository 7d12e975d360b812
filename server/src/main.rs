use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use marcus_core::core::Core;
use marcus_core::oracle::HeuristicOracle;
use marcus_protocol::ToolHandler;
use marcus_server::config::Config;
use marcus_server::telemetry::{init_telemetry, log_startup_info};
use marcus_server::{stdio, workers};

#[derive(Parser)]
#[command(name = "marcus")]
#[command(about = "Coordination server for autonomous agents")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Storage location override (directory or database URL)
    #[arg(long, env = "MARCUS_STORAGE__LOCATION")]
    storage: Option<String>,

    /// Log level override
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(storage) = &cli.storage {
        config.storage.location = storage.clone();
    }
    if let Some(log_level) = &cli.log_level {
        config.logging.level = log_level.clone();
    }

    init_telemetry(&config.logging).context("failed to initialize telemetry")?;
    config.validate().context("configuration validation failed")?;
    log_startup_info(&config);

    let store = marcus_storage::open_store(config.core.persistence_backend, &config.storage.location)
        .await
        .context("failed to open the state store")?;
    let provider = marcus_providers::open_provider(config.core.provider, &config.provider)
        .context("failed to build the kanban provider")?;
    let oracle = Arc::new(HeuristicOracle::new(config.core.fit_weights));

    let core = Arc::new(
        Core::new(config.core.clone(), store, provider, oracle)
            .context("failed to build the core")?,
    );
    core.recover().await.context("failed to recover persisted state")?;

    let sweeper = workers::spawn_sweeper(core.clone());
    let reconciler = workers::spawn_reconciler(core.clone());
    info!("background workers running; serving NDJSON on stdio");

    let handler = ToolHandler::new(core);
    let serve = stdio::serve(handler, tokio::io::stdin(), tokio::io::stdout());

    tokio::select! {
        result = serve => {
            match result {
                Ok(()) => info!("stdin closed; shutting down"),
                Err(err) => error!(error = %err, "stdio transport failed"),
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    sweeper.abort();
    reconciler.abort();
    info!("marcus server stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                error!(error = %err, "failed to register SIGTERM handler");
                return std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
