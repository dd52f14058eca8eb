use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{ChangeFeedTransport, FeedSubscription};
use crate::isolation::RequestScope;
use crate::models::ChangeEnvelope;
use crate::remote::RemoteResult;

const HUB_CAPACITY: usize = 256;
const SUBSCRIPTION_CAPACITY: usize = 64;

/// In-process change feed hub.
///
/// Delivers each published envelope to subscriptions whose tenant and
/// collection set match.
#[derive(Clone)]
pub struct LocalChangeFeed {
    hub: broadcast::Sender<ChangeEnvelope>,
}

impl Default for LocalChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalChangeFeed {
    pub fn new() -> Self {
        let (hub, _) = broadcast::channel(HUB_CAPACITY);
        Self { hub }
    }

    /// Publish `envelope`; returns how many subscriptions were listening
    pub fn publish(&self, envelope: ChangeEnvelope) -> usize {
        self.hub.send(envelope).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.receiver_count()
    }
}

#[async_trait]
impl ChangeFeedTransport for LocalChangeFeed {
    async fn subscribe(
        &self,
        scope: &RequestScope,
        collections: &[&'static str],
    ) -> RemoteResult<FeedSubscription> {
        let mut hub = self.hub.subscribe();
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let tenant_id = scope.tenant_id.clone();
        let collections = collections.to_vec();

        let forwarder = tokio::spawn(async move {
            loop {
                match hub.recv().await {
                    Ok(envelope) => {
                        if envelope.tenant_id != tenant_id
                            || !collections
                                .iter()
                                .any(|collection| *collection == envelope.collection)
                        {
                            continue;
                        }
                        if sender.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Change feed lagged; skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(FeedSubscription::with_forwarder(receiver, forwarder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeKind, OwnerId, RecordId, TenantId};
    use std::time::Duration;

    fn scope(tenant: &str) -> RequestScope {
        RequestScope {
            tenant_id: TenantId::new(tenant),
            owner_id: OwnerId::new("farmer-1"),
            access_token: None,
            epoch: 1,
        }
    }

    fn envelope(tenant: &str, collection: &str) -> ChangeEnvelope {
        ChangeEnvelope {
            collection: collection.to_string(),
            event_type: ChangeKind::Update,
            record_id: RecordId::new("l-1"),
            tenant_id: TenantId::new(tenant),
        }
    }

    #[tokio::test]
    async fn delivers_only_matching_tenant_and_collection() {
        let feed = LocalChangeFeed::new();
        let mut subscription = feed.subscribe(&scope("coop-a"), &["lands"]).await.unwrap();

        feed.publish(envelope("coop-b", "lands"));
        feed.publish(envelope("coop-a", "schedules"));
        feed.publish(envelope("coop-a", "lands"));

        let delivered = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, envelope("coop-a", "lands"));
    }

    #[tokio::test]
    async fn closing_subscription_stops_delivery() {
        let feed = LocalChangeFeed::new();
        let mut subscription = feed.subscribe(&scope("coop-a"), &["lands"]).await.unwrap();
        subscription.close();

        feed.publish(envelope("coop-a", "lands"));
        assert_eq!(subscription.recv().await, None);
    }
}
