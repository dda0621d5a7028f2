//! Per-key state storage.
//!
//! The store exclusively owns every [`QueryState`]; reads hand out clones.
//! Each write that changes a state notifies the key's listeners once the
//! shard lock has been released.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::error::QueryError;
use crate::notifier::Notifier;
use crate::state::QueryState;

pub(crate) type Outcome<T> = Result<T, QueryError>;

/// A type-erased fetch function as remembered by the store.
pub(crate) type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Outcome<T>> + Send + Sync>;

/// Completion signal of an in-flight fetch; `None` until it settles.
pub(crate) type Signal<T> = watch::Receiver<Option<Outcome<T>>>;

/// Everything the cache keeps for one key.
pub(crate) struct Slot<T> {
    pub(crate) state: Option<QueryState<T>>,
    pub(crate) fetcher: Option<Fetcher<T>>,
    /// Present exactly while `state` is `Loading`.
    pub(crate) in_flight: Option<Signal<T>>,
    /// Bumped on every state change.
    pub(crate) revision: u64,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            state: None,
            fetcher: None,
            in_flight: None,
            revision: 0,
        }
    }
}

pub(crate) struct Store<T> {
    slots: DashMap<String, Slot<T>>,
    notifier: Arc<Notifier>,
}

impl<T: Clone> Store<T> {
    pub(crate) fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            slots: DashMap::new(),
            notifier,
        }
    }

    /// Returns a snapshot of the state for `key`.
    pub(crate) fn get(&self, key: &str) -> Option<QueryState<T>> {
        self.slots.get(key).and_then(|slot| slot.state.clone())
    }

    /// Returns a snapshot of the state for `key` along with its revision.
    pub(crate) fn snapshot(&self, key: &str) -> Option<(u64, QueryState<T>)> {
        self.slots
            .get(key)
            .and_then(|slot| slot.state.clone().map(|state| (slot.revision, state)))
    }

    /// Replaces the state for `key` and notifies its listeners.
    ///
    /// Any state other than `Loading` also retires the in-flight signal.
    pub(crate) fn set(&self, key: &str, state: QueryState<T>) {
        self.update(key, |slot| {
            if !state.is_loading() {
                slot.in_flight = None;
            }
            slot.state = Some(state);
            ((), true)
        });
    }

    /// Returns the most recently remembered fetcher for `key`.
    pub(crate) fn fetcher(&self, key: &str) -> Option<Fetcher<T>> {
        self.slots.get(key).and_then(|slot| slot.fetcher.clone())
    }

    /// Remembers `fetcher` for `key`, replacing any previous one.
    pub(crate) fn remember_fetcher(&self, key: &str, fetcher: Fetcher<T>) {
        self.slots.entry(key.to_string()).or_default().fetcher = Some(fetcher);
    }

    /// Runs `f` on the slot for `key` while holding its shard lock.
    ///
    /// `f` returns its result plus whether it changed the state; a change is
    /// followed by exactly one notification, delivered after the lock is released.
    pub(crate) fn update<R>(&self, key: &str, f: impl FnOnce(&mut Slot<T>) -> (R, bool)) -> R {
        let (result, changed) = {
            let mut slot = self.slots.entry(key.to_string()).or_default();
            let (result, changed) = f(&mut *slot);
            if changed {
                slot.revision += 1;
            }
            (result, changed)
        };
        if changed {
            self.notifier.notify(key);
        }
        result
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
