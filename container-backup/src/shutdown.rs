//! SIGINT/SIGTERM handling.
//!
//! The first signal cancels the shared token, which every archive loop,
//! runtime call and health wait observes. Scratch directories are removed as
//! the cancelled call unwinds.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled on shutdown
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel the token when SIGINT or SIGTERM arrives. Returns immediately;
    /// the listener runs in the background.
    pub fn listen(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            token.cancel();
        });
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), cancelling...");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling...");
        }
    }
}
