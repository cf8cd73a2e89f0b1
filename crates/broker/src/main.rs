use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tokenbroker::auth::AuthGuard;
use tokenbroker::cli::Cli;
use tokenbroker::config;
use tokenbroker::middleware::RequestCounter;
use tokenbroker::once::OnceGuard;
use tokenbroker::server::{self, AppState};
use tokenbroker::shutdown::{ShutdownController, spawn_ctrl_c_handler};
use tokenbroker_engine::{RestartStrategy, WorkerPool};

/// Restart hook for quarantined workers. The orchestrator integration is a
/// stub; it only records that a restart was wanted.
struct RestartLogger;

impl RestartStrategy for RestartLogger {
    fn restart(&self, host: &str) {
        warn!(host = %host, "restart requested for quarantined worker (no orchestrator wired)");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load(&cli.config)?;
    anyhow::ensure!(!config.workers.is_empty(), "no workers configured");

    let auth = config
        .middleware
        .auth
        .as_ref()
        .map(|cfg| Arc::new(AuthGuard::new(cfg)));
    let once = match &config.middleware.once {
        Some(cfg) => Some(Arc::new(OnceGuard::connect(cfg).await?)),
        None => None,
    };

    let pool = Arc::new(WorkerPool::new(config.workers, Arc::new(RestartLogger)));
    pool.run();

    let state = AppState {
        pool,
        counter: Arc::new(RequestCounter::new()),
        auth,
        once,
    };
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("bind {}", cli.listen))?;
    info!(addr = %cli.listen, "listening");

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel();
    spawn_ctrl_c_handler(shutdown, shutdown_tx);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;
    Ok(())
}
