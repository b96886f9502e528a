use std::sync::Arc;
use std::time::Duration;

use crate::config::NodeConfig;
use pool::{AtomicScheduler, Handle, PlaintextAuthenticator};
use tokio::net::TcpListener;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// The limit of time to wait for the node to shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Wraps a [`pool::Handle`] with the accept loop and process lifecycle
/// plumbing that a standalone binary needs but the library itself has no
/// opinion on (spec §1: listening, signal handling, config loading are all
/// caller responsibilities).
pub struct Node {
    config: NodeConfig,
    pool: Handle,

    cancelation: CancellationToken,
    pub(crate) task_tracker: TaskTracker,
}

impl Node {
    pub async fn new(config: NodeConfig) -> eyre::Result<Self> {
        let pool = Handle::create(
            config.pool.clone(),
            Arc::new(PlaintextAuthenticator::new(config.pool.binary_chunks_size)),
            Arc::new(AtomicScheduler::new()),
            pool::message::CodecRegistry::new(),
        )
        .await?;

        Ok(Self {
            config,
            pool,
            cancelation: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        })
    }

    /// Wait for the signal from the pool about an unrecoverable failure.
    pub async fn cancelled(&self) {
        self.cancelation.cancelled().await
    }

    pub async fn run(&self) -> eyre::Result<()> {
        self.spawn_accept_loop().await?;

        self.task_tracker.close();

        Ok(())
    }

    async fn spawn_accept_loop(&self) -> eyre::Result<()> {
        let listener = TcpListener::bind(self.config.listen_address).await?;
        info!(address = %self.config.listen_address, "listening for inbound connections");

        let pool = self.pool.clone();
        let cancelation = self.cancelation.clone();

        self.task_tracker.spawn(async move {
            loop {
                select! {
                    _ = cancelation.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => pool.accept(stream, addr).await,
                            Err(err) => {
                                error!(%err, "failed to accept inbound connection");
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down node, finishing received requests...");

        self.cancelation.cancel();
        self.pool.destroy().await;

        let timeout = self
            .config
            .shutdown_timeout
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS);

        select! {
            _ = self.task_tracker.wait() => {},
            _ = sleep(Duration::from_secs(timeout)) => {
                info!("Shutdown timeout reached, exiting...");
            },
        }
    }
}
