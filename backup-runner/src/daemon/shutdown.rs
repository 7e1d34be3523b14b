//! Graceful shutdown handling for SIGINT, SIGTERM and SIGHUP.
//!
//! A signal never aborts the run in place. It cancels a token that the run
//! controller checks between phases, so stopped services are still brought
//! back before the process exits.

use std::io;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

impl ShutdownCoordinator {
    /// Install the signal handlers. Must be called inside a tokio runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            token: CancellationToken::new(),
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Token cancelled on the first signal
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the next shutdown signal and cancel the token. Returns
    /// false once no more signals can arrive.
    pub async fn wait_for_signal(&mut self) -> bool {
        let name = tokio::select! {
            Some(_) = self.interrupt.recv() => "SIGINT",
            Some(_) = self.terminate.recv() => "SIGTERM",
            Some(_) = self.hangup.recv() => "SIGHUP",
            else => return false,
        };

        if self.token.is_cancelled() {
            warn!("Received {} again, still finishing service restoration", name);
        } else {
            info!("Received {}, finishing the current phase before shutting down", name);
            self.token.cancel();
        }
        true
    }

    /// Listen for signals in the background for the rest of the process
    pub fn spawn(mut self) -> CancellationToken {
        let token = self.token();
        tokio::spawn(async move {
            while self.wait_for_signal().await {}
        });
        token
    }
}
