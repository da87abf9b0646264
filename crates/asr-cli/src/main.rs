use std::sync::Arc;

use anyhow::{Context, Result};
use asr_storage::ReviewStore;
use asr_sync::{AppConfig, Poller};
use asr_web::{AppState, ReviewQueryService, ReviewsQuery};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "asr-cli")]
#[command(about = "App Store Review Radar command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the feed and serve the HTTP API until interrupted
    Serve,
    /// Run a single poll cycle against the configured store
    Poll,
    /// Print stored reviews inside a time window
    Latest {
        #[arg(long)]
        hours: Option<u32>,
        #[arg(long)]
        rating: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await?,
        Commands::Poll => {
            let outcome = asr_sync::run_cycle_once_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Latest { hours, rating } => {
            let config = AppConfig::from_env().context("loading configuration")?;
            let store = Arc::new(ReviewStore::load(config.storage_file_path.clone()).await);
            let service = ReviewQueryService::new(store, config.app_id.clone(), config.default_hours);
            let query = ReviewsQuery {
                rating: rating.map(|r| r.to_string()),
                hours: hours.map(|h| h.to_string()),
            };
            let page = service.list_latest(&query).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
    }

    Ok(())
}

async fn serve() -> Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;
    info!(
        port = config.port,
        polling_interval_secs = config.polling_interval.as_secs(),
        app_id = %config.app_id,
        storage_file_path = %config.storage_file_path.display(),
        "config loaded"
    );

    let store = Arc::new(ReviewStore::load(config.storage_file_path.clone()).await);
    let poller = Poller::from_config(&config, store.clone())?;
    let state = AppState::new(ReviewQueryService::new(
        store,
        config.app_id.clone(),
        config.default_hours,
    ));
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;

    let shutdown = CancellationToken::new();
    let poller_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { poller.run(shutdown).await }
    });
    let mut server_task = tokio::spawn(asr_web::serve(listener, state, shutdown.clone()));

    tokio::select! {
        _ = wait_for_signal() => info!("shutdown signal received"),
        res = &mut server_task => {
            shutdown.cancel();
            poller_task.await?;
            return res?.context("http server exited unexpectedly");
        }
    }
    shutdown.cancel();

    match tokio::time::timeout(config.shutdown_grace, &mut server_task).await {
        Ok(res) => res??,
        Err(_) => {
            warn!(grace_secs = config.shutdown_grace.as_secs(), "http server did not drain in time, aborting");
            server_task.abort();
        }
    }
    // A cycle already in flight finishes before the poller observes the cancel.
    poller_task.await?;

    info!("exited gracefully");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "installing ctrl-c handler failed");
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
