//! Graceful shutdown on SIGTERM and SIGINT.
//!
//! A background task listens for either signal and fires a cancellation
//! token that the axum serve loop and the retention tasks watch.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct SigDown {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl SigDown {
    /// Register the signal handlers. Fails only if signal registration does.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let fired = token.clone();
        let tracker = TaskTracker::new();
        tracker.spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => fired.cancel(),
                _ = sigint.recv() => fired.cancel(),
            }
        });
        tracker.close();
        Ok(Self { tracker, token })
    }

    /// Token handed to subsystems that must stop on shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for a signal and let the handler task settle.
    pub async fn recv(&self) {
        self.token.cancelled().await;
        self.tracker.wait().await;
    }
}
