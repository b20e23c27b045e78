use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use revwatch_core::DEFAULT_WINDOW_HOURS;
use revwatch_storage::{QueryError, ReviewStore};
use revwatch_sync::{build_poller, load_apps, SyncConfig};
use revwatch_web::AppState;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "revwatch")]
#[command(about = "Poll App Store review feeds and serve recent reviews")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll on a schedule and serve the HTTP API (default)
    Serve,
    /// Run a single poll cycle and exit
    Poll,
    /// Print reviews for one app from the local store
    Query {
        app_id: String,
        #[arg(long, default_value_t = DEFAULT_WINDOW_HOURS)]
        hours: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(SyncConfig::from_env()).await?,
        Commands::Poll => {
            let summary = revwatch_sync::run_poll_once_from_env().await?;
            println!(
                "poll complete: cycle_id={} apps={} updated={} failed={}",
                summary.cycle_id,
                summary.outcomes.len(),
                summary.updated(),
                summary.failed()
            );
            for outcome in &summary.outcomes {
                println!("{}", serde_json::to_string(outcome)?);
            }
        }
        Commands::Query { app_id, hours } => {
            let store = ReviewStore::new(SyncConfig::from_env().data_dir);
            match store.query_app(&app_id, hours).await {
                Ok(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                Err(QueryError::NotFound(id)) => {
                    anyhow::bail!("no reviews recorded for app {id}; has it been polled yet?")
                }
                Err(err) => return Err(err).context("querying reviews"),
            }
        }
    }

    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    let interval = config
        .poll_interval()
        .context("REVWATCH_POLL_INTERVAL_MINUTES")?;
    let apps = load_apps(&config).await?;
    let poller = Arc::new(build_poller(&config)?);
    let state = AppState::new(poller.store().clone(), apps.clone());

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, apps = apps.len(), "server running");

    let polling = {
        let poller = Arc::clone(&poller);
        tokio::spawn(async move {
            match poller.start_with_interval(apps, interval).await {
                Ok(first) => info!(
                    cycle_id = %first.cycle_id,
                    updated = first.updated(),
                    failed = first.failed(),
                    "initial poll finished"
                ),
                Err(err) => {
                    error!(error = %err, "poller failed to start; serving stored reviews only")
                }
            }
        })
    };

    revwatch_web::serve(listener, state, shutdown_signal()).await?;

    poller.stop().await.context("stopping poller")?;
    if let Err(err) = polling.await {
        warn!(error = %err, "poller task aborted");
    }
    info!("poller shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "installing Ctrl-C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "installing SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
