//! Awaitable "transport is authenticated and tenant-scoped" signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Broadcast gate that remote callers await before issuing requests
#[derive(Clone)]
pub struct ReadinessGate {
    ready: Arc<watch::Sender<bool>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            ready: Arc::new(ready),
        }
    }

    /// Mark the transport ready and wake every waiter
    pub fn signal_ready(&self) {
        if !self.ready.send_replace(true) {
            tracing::debug!("Readiness gate opened");
        }
    }

    /// Close the gate again (identity cleared or being switched)
    pub fn reset(&self) {
        if self.ready.send_replace(false) {
            tracing::debug!("Readiness gate closed");
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the gate opens or `timeout` elapses
    pub async fn await_ready(&self, timeout: Duration) -> Result<()> {
        let mut receiver = self.ready.subscribe();
        let wait = async move { receiver.wait_for(|ready| *ready).await.map(|_| ()) };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::IdentityNotReady),
            Err(_) => Err(Error::ReadinessTimeout(timeout)),
        }
    }
}
