//! SIGINT/SIGTERM handling.
//!
//! The first signal cancels the running job through its token; the engines
//! notice at the next file or record and wind the session down.

use std::io;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    cancel: CancellationToken,
}

impl ShutdownCoordinator {
    /// `cancel` is the token of the job to stop on a signal.
    pub fn new(cancel: CancellationToken) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx, cancel }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for SIGINT or SIGTERM, then cancel the job and notify subscribers.
    pub async fn wait_for_signal(&self) -> io::Result<()> {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                info!("Received SIGINT, canceling job");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, canceling job");
            }
            _ = self.cancel.cancelled() => return Ok(()),
        }
        self.trigger();
        Ok(())
    }

    /// Cancel the job as if a signal had arrived.
    pub fn trigger(&self) {
        self.cancel.cancel();
        if self.shutdown_tx.send(()).is_err() {
            // Nobody subscribed
            warn!("Shutdown requested with no listeners");
        }
    }

    /// Run [`Self::wait_for_signal`] on its own task. The task also ends
    /// when the job token is canceled for another reason.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.wait_for_signal().await {
                error!("Failed to install signal handlers: {}", e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_job() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let coordinator = ShutdownCoordinator::new(token.clone());
        let mut rx = coordinator.subscribe();

        let handle = tokio::spawn(async move {
            rx.recv().await.ok();
        });
        coordinator.trigger();
        handle.await?;
        assert!(token.is_cancelled());
        Ok(())
    }

    #[tokio::test]
    async fn test_watcher_exits_with_job() -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let handle = ShutdownCoordinator::new(token.clone()).spawn();
        token.cancel();
        handle.await?;
        Ok(())
    }
}
