//! Change feed: server-pushed mutation notices that trigger refetches.

mod local;
mod subscriber;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::isolation::RequestScope;
use crate::models::ChangeEnvelope;
use crate::remote::RemoteResult;

pub use local::LocalChangeFeed;
pub use subscriber::ChangeFeedSubscriber;

/// A live subscription; closing or dropping it stops delivery
pub struct FeedSubscription {
    events: mpsc::Receiver<ChangeEnvelope>,
    forwarder: Option<JoinHandle<()>>,
}

impl FeedSubscription {
    pub const fn new(events: mpsc::Receiver<ChangeEnvelope>) -> Self {
        Self {
            events,
            forwarder: None,
        }
    }

    /// A subscription fed by `forwarder`, which is aborted on close
    pub const fn with_forwarder(
        events: mpsc::Receiver<ChangeEnvelope>,
        forwarder: JoinHandle<()>,
    ) -> Self {
        Self {
            events,
            forwarder: Some(forwarder),
        }
    }

    pub async fn recv(&mut self) -> Option<ChangeEnvelope> {
        self.events.recv().await
    }

    pub fn close(&mut self) {
        self.events.close();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Subscribe/publish channel keyed by collection and tenant.
///
/// Envelopes carry no payload; subscribers refetch.
#[async_trait]
pub trait ChangeFeedTransport: Send + Sync {
    async fn subscribe(
        &self,
        scope: &RequestScope,
        collections: &[&'static str],
    ) -> RemoteResult<FeedSubscription>;
}
