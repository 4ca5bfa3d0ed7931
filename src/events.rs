//! Generic one-to-many typed-event dispatcher.
//!
//! Every other component in the crate is built on [`EventBus`]: the session
//! fans inbound frames out to message observers, and the typed channels fan
//! protocol events out to application consumers.
//!
//! Observers registered under [`WILDCARD`] are notified for every event on
//! the bus in addition to exact-type observers. Registrations accumulate and
//! are never removed; an observer lives as long as its bus.
//!
//! Dispatch is concurrent: `notify` creates every observer future before
//! awaiting any of them, then waits for all to settle. An observer error
//! fails the whole `notify` call; the triggering protocol operation is
//! expected to abort, not to keep running past a defective listener.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::future::{join_all, BoxFuture};

/// Key under which observers receive every event regardless of type.
pub const WILDCARD: &str = "*";

type ObserverFn<E> = dyn Fn(E) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A boxed observer callback, used where the concrete closure type cannot be
/// named (trait objects such as [`crate::channel::Channel`]).
pub type BoxedObserver<E> = Box<ObserverFn<E>>;

/// One-to-many dispatcher keyed by event-type string.
pub struct EventBus<E> {
    observers: RwLock<HashMap<String, Vec<Arc<ObserverFn<E>>>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.observers.read().expect("observer map poisoned");
        let mut dbg = f.debug_map();
        for (key, list) in map.iter() {
            dbg.entry(key, &list.len());
        }
        dbg.finish()
    }
}

impl<E> EventBus<E> {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `observer` for `event_type`.
    ///
    /// Multiple registrations for the same type accumulate in insertion
    /// order; they never overwrite each other.
    pub fn add_observer<F, Fut>(&self, event_type: &str, observer: F)
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_boxed_observer(event_type, Box::new(move |event| Box::pin(observer(event))));
    }

    /// Register a pre-boxed observer (see [`BoxedObserver`]).
    pub fn add_boxed_observer(&self, event_type: &str, observer: BoxedObserver<E>) {
        let mut map = self.observers.write().expect("observer map poisoned");
        map.entry(event_type.to_string())
            .or_default()
            .push(Arc::from(observer));
    }

    /// Number of observers registered under the exact `event_type` key.
    #[must_use]
    pub fn observer_count(&self, event_type: &str) -> usize {
        self.observers
            .read()
            .expect("observer map poisoned")
            .get(event_type)
            .map_or(0, Vec::len)
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Notify every observer registered for [`WILDCARD`] and every observer
    /// registered for the exact `event_type`.
    ///
    /// All observer futures are created before any is awaited, then driven
    /// concurrently to completion. Returns the number of observers invoked.
    /// Fails with the first observer error once all have settled.
    pub async fn notify(&self, event_type: &str, event: E) -> anyhow::Result<usize> {
        let observers: Vec<Arc<ObserverFn<E>>> = {
            let map = self.observers.read().expect("observer map poisoned");
            let mut list = Vec::new();
            if let Some(wild) = map.get(WILDCARD) {
                list.extend(wild.iter().map(Arc::clone));
            }
            if event_type != WILDCARD {
                if let Some(exact) = map.get(event_type) {
                    list.extend(exact.iter().map(Arc::clone));
                }
            }
            list
        };

        // Every observer runs to completion even when a sibling fails; the
        // first error is surfaced only after all have settled.
        let futures: Vec<_> = observers.iter().map(|obs| obs(event.clone())).collect();
        for result in join_all(futures).await {
            result?;
        }

        Ok(observers.len())
    }
}
