//! Online/offline observable.
//!
//! The signal is a hint: a remote failure while "online" is still treated as
//! offline for that request.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct Connectivity {
    online: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            online: Arc::new(sender),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Report a connectivity change; returns the previous value
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.send_replace(online);
        if previous != online {
            tracing::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        previous
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
