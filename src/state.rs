//! Process-wide RUNNING/PAUSED latch.
//!
//! Consumers await [`RunState::wait_running`] before issuing any throttled
//! action. The storage monitor flips the latch when free space runs out, and
//! user commands / shutdown flip it as well.

use tokio::sync::watch;
use tracing::info;

/// Resumable binary latch with values RUNNING / PAUSED.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Debug, Clone)]
pub struct RunState {
    tx: watch::Sender<bool>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    /// Creates a latch in the RUNNING state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx }
    }

    /// Whether the latch is currently RUNNING.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the latch is RUNNING. Returns immediately when it already
    /// is. This is a suspension point: callers may be cancelled here.
    pub async fn wait_running(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close under us.
        let _ = rx.wait_for(|running| *running).await;
    }

    /// Flips the latch to PAUSED.
    pub fn pause(&self) {
        if self.tx.send_replace(false) {
            info!("run paused");
        }
    }

    /// Flips the latch back to RUNNING, waking all waiters.
    pub fn resume(&self) {
        if !self.tx.send_replace(true) {
            info!("run resumed");
        }
    }
}
