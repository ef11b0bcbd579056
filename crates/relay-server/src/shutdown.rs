//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::directory::{DepartReason, RoomDirectory};

/// Default timeout for graceful shutdown before evicting stragglers.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the drain loop re-checks the directory.
const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Coordinates graceful shutdown across all server tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the server and drain every session.
    ///
    /// 1. Cancel the token: the listener stops accepting and each connection
    ///    departs with reason `shutdown`
    /// 2. Wait up to `timeout` for the directory to empty and `handles` to finish
    /// 3. Depart whatever is still registered after the timeout
    pub async fn graceful_shutdown(
        &self,
        directory: &RoomDirectory,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        info!(
            sessions = directory.connection_count(),
            task_count = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "draining relay"
        );

        let drain = async {
            while directory.connection_count() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
            let _ = futures::future::join_all(handles).await;
        };

        if tokio::time::timeout(timeout, drain).await.is_err() {
            let stragglers = directory.sessions();
            warn!(
                remaining = stragglers.len(),
                "shutdown timed out after {timeout:?}, evicting remaining sessions"
            );
            for session in stragglers {
                let _ = directory.depart(&session, DepartReason::Shutdown);
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
