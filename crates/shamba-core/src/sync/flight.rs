//! Single-flight coalescing of identical pulls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::Error;

pub(crate) type FlightResult<T> = Result<T, Arc<Error>>;
pub(crate) type Flight<T> = Shared<BoxFuture<'static, FlightResult<T>>>;

struct Slot<T> {
    generation: u64,
    epoch: u64,
    flight: Flight<T>,
}

/// Running flights for one collection, keyed by request.
///
/// A flight joins only callers of the same generation and identity epoch.
/// Invalidation bumps the generation: running flights still complete and
/// write through, but new callers start a fresh run instead of awaiting them.
pub(crate) struct FlightGroup<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
    generation: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> FlightGroup<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn invalidate(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Join the running flight for `key`, or spawn `start` as a new one.
    ///
    /// The returned flag is `true` when a new flight was started.
    pub(crate) fn join_or_start<F>(&self, key: String, epoch: u64, start: F) -> (Flight<T>, bool)
    where
        F: FnOnce() -> BoxFuture<'static, FlightResult<T>>,
    {
        let generation = self.generation.load(Ordering::SeqCst);
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Only running flights of the current generation can be joined
        slots.retain(|_, slot| slot.generation == generation && slot.flight.peek().is_none());
        if let Some(slot) = slots.get(&key) {
            if slot.epoch == epoch {
                return (slot.flight.clone(), false);
            }
        }

        let task = tokio::spawn(start());
        let flight = async move {
            task.await
                .unwrap_or_else(|error| Err(Arc::new(Error::Task(error.to_string()))))
        }
        .boxed()
        .shared();
        slots.insert(
            key,
            Slot {
                generation,
                epoch,
                flight: flight.clone(),
            },
        );
        (flight, true)
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Forget every slot (identity change)
    pub(crate) fn clear(&self) {
        self.invalidate();
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_start(
        runs: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> BoxFuture<'static, FlightResult<usize>> {
        let runs = Arc::clone(runs);
        move || {
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(runs.fetch_add(1, Ordering::SeqCst) + 1)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let group = FlightGroup::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let (first, started_first) = group.join_or_start("k".into(), 1, counting_start(&runs));
        let (second, started_second) = group.join_or_start("k".into(), 1, counting_start(&runs));

        assert!(started_first);
        assert!(!started_second);
        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidation_starts_a_new_run_for_later_callers() {
        let group = FlightGroup::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let (first, _) = group.join_or_start("k".into(), 1, counting_start(&runs));
        group.invalidate();
        let (second, started) = group.join_or_start("k".into(), 1, counting_start(&runs));

        assert!(started);
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap() + b.unwrap(), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn completed_flights_are_not_reused() {
        let group = FlightGroup::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let (first, _) = group.join_or_start("k".into(), 1, counting_start(&runs));
        first.await.unwrap();
        let (_, started) = group.join_or_start("k".into(), 1, counting_start(&runs));
        assert!(started);
    }

    #[tokio::test]
    async fn finished_flights_release_their_slots() {
        let group = FlightGroup::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b", "c"] {
            let (flight, _) = group.join_or_start(key.into(), 1, counting_start(&runs));
            flight.await.unwrap();
        }
        let (running, _) = group.join_or_start("d".into(), 1, counting_start(&runs));

        assert_eq!(group.slot_count(), 1);
        running.await.unwrap();
    }

    #[tokio::test]
    async fn identity_epoch_separates_flights() {
        let group = FlightGroup::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let (_running, _) = group.join_or_start("k".into(), 1, counting_start(&runs));
        let (_, started) = group.join_or_start("k".into(), 2, counting_start(&runs));
        assert!(started);
    }
}
