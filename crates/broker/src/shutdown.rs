use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;
use tracing::info;

/// Tracks how many times the operator has asked the process to stop.
#[derive(Debug, Default)]
pub struct ShutdownController {
    forced: AtomicU8,
}

impl ShutdownController {
    /// Fresh controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more stop request and return the running total.
    pub fn bump_forced(&self) -> u8 {
        self.forced.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// First ctrl-c requests a graceful drain; a second exits immediately.
pub fn spawn_ctrl_c_handler(
    shutdown: Arc<ShutdownController>,
    shutdown_tx: mpsc::UnboundedSender<()>,
) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let n = shutdown.bump_forced();
            if n == 1 {
                info!("stop requested, draining connections (press ctrl-c again to exit immediately)");
                let _ = shutdown_tx.send(());
            } else {
                info!("stop requested again, exiting immediately");
                std::process::exit(130);
            }
        }
    });
}
