use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};

use super::{ChangeFeedTransport, FeedSubscription};
use crate::error::{Error, Result};
use crate::isolation::RequestScope;
use crate::sync::Orchestrator;

/// Turns change events into debounced refetches through the orchestrator.
///
/// Never writes records itself. One subscription is live at a time, bound
/// to the identity it was started with.
pub struct ChangeFeedSubscriber {
    transport: Arc<dyn ChangeFeedTransport>,
    orchestrator: Orchestrator,
    debounce: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeFeedSubscriber {
    pub fn new(
        transport: Arc<dyn ChangeFeedTransport>,
        orchestrator: Orchestrator,
        debounce: Duration,
    ) -> Self {
        Self {
            transport,
            orchestrator,
            debounce,
            task: Mutex::new(None),
        }
    }

    /// Replace any live subscription with one for `scope`.
    ///
    /// The previous subscription is closed before the new one opens.
    pub async fn start(&self, scope: RequestScope) -> Result<()> {
        self.stop();
        let collections = self.orchestrator.collections();
        if collections.is_empty() {
            return Ok(());
        }

        let subscription = self
            .transport
            .subscribe(&scope, &collections)
            .await
            .map_err(|error| Error::RemoteFetchFailed(format!("change feed: {error}")))?;
        if self.orchestrator.isolation().epoch() != scope.epoch {
            tracing::warn!("Identity changed while subscribing; discarding change feed");
            return Ok(());
        }

        tracing::debug!(
            tenant_id = %scope.tenant_id,
            "Change feed subscribed to {}",
            collections.join(", ")
        );
        let task = tokio::spawn(run(
            subscription,
            self.orchestrator.clone(),
            scope,
            self.debounce,
        ));
        if let Some(previous) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
        Ok(())
    }

    /// Close the live subscription, if any
    pub fn stop(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
            tracing::debug!("Change feed subscription closed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for ChangeFeedSubscriber {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    mut subscription: FeedSubscription,
    orchestrator: Orchestrator,
    scope: RequestScope,
    debounce: Duration,
) {
    let mut armed: HashSet<String> = HashSet::new();
    let mut timers: JoinSet<String> = JoinSet::new();
    let mut refetches: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    tracing::debug!("Change feed closed by transport");
                    break;
                };
                if event.tenant_id != scope.tenant_id {
                    tracing::error!(
                        collection = %event.collection,
                        "Dropping change event for tenant {} (active {})",
                        event.tenant_id,
                        scope.tenant_id
                    );
                    continue;
                }
                if orchestrator.isolation().epoch() != scope.epoch {
                    tracing::warn!("Dropping change event from a previous identity");
                    continue;
                }
                if armed.insert(event.collection.clone()) {
                    let collection = event.collection;
                    timers.spawn(async move {
                        tokio::time::sleep(debounce).await;
                        collection
                    });
                }
            }
            Some(fired) = timers.join_next(), if !timers.is_empty() => {
                let Ok(collection) = fired else { continue };
                armed.remove(&collection);
                let orchestrator = orchestrator.clone();
                refetches.spawn(async move {
                    orchestrator.invalidate(&collection).await;
                });
            }
            Some(_) = refetches.join_next(), if !refetches.is_empty() => {}
        }
    }
}
