//! The query client: cache lookups, request deduplication and invalidation.
//!
//! [`QueryClient`] is the single entry point of this crate. Every clone of a
//! client shares the same cache, so one client is usually created at startup
//! and handed to everything that reads the same data.
//!
//! # How a fetch is resolved
//!
//! For every [`fetch_query`](QueryClient::fetch_query) call:
//!
//! 1. The fetcher is remembered for the key, whatever happens next
//! 2. A successful result younger than the stale time is returned as-is
//! 3. If a fetch for the key is already in flight, the call waits for it
//! 4. Otherwise the key moves to `Loading` and a new fetch is started
//!
//! Steps 2 to 4 run as one atomic section per key. The fetch itself runs on
//! a Tokio task, outside of any lock, and always runs to completion: its
//! outcome is written to the cache, listeners are notified, and then every
//! waiting caller receives the same result.
//!
//! If the task is torn down first, for example because its runtime shut
//! down, the key moves to `Error` with an "abandoned" error and the next
//! call starts a new fetch.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use query_cache::prelude::*;
//!
//! # async fn fetch_user() -> Result<String, std::io::Error> { Ok("alice".into()) }
//! # async fn run() -> Result<(), QueryError> {
//! let client = QueryClient::<String>::new();
//! let options = QueryOptions::new(Duration::from_secs(30));
//!
//! let user = client.fetch_query(&"user-123", fetch_user, options).await?;
//!
//! // Served from cache for the next 30 seconds.
//! let again = client.fetch_query(&"user-123", fetch_user, options).await?;
//! assert_eq!(user, again);
//! # Ok(())
//! # }
//! ```

use std::fmt::{self, Display};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt, TryFutureExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::QueryOptions;
use crate::error::QueryError;
use crate::notifier::{Notifier, Subscription};
use crate::state::QueryState;
use crate::store::{Fetcher, Outcome, Signal, Store};

/// A client owning one query cache.
///
/// Cloning is cheap and every clone refers to the same cache. Two clients
/// created with [`QueryClient::new`] are fully independent.
///
/// Fetches are spawned on the ambient Tokio runtime, so
/// [`fetch_query`](Self::fetch_query) must be awaited from within one.
pub struct QueryClient<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    store: Store<T>,
    notifier: Arc<Notifier>,
}

/// What the atomic section decided for one call.
enum Decision<T> {
    Fresh(T),
    Join(Signal<T>),
    Start(watch::Sender<Option<Outcome<T>>>, Signal<T>),
}

/// How the caller gets its value.
enum Plan<T> {
    Ready(T),
    Wait(Signal<T>),
}

impl<T> QueryClient<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a client with an empty cache.
    #[must_use]
    pub fn new() -> Self {
        let notifier = Arc::new(Notifier::new());
        Self {
            inner: Arc::new(Inner {
                store: Store::new(notifier.clone()),
                notifier,
            }),
        }
    }

    /// Returns the value for `key`, fetching it with `fetcher` if needed.
    ///
    /// A fresh cached value is returned without calling `fetcher`. If another
    /// call already started a fetch for `key`, this call waits for that fetch
    /// instead of starting its own. Any error returned by `fetcher` is
    /// normalized into a [`QueryError`] carrying its message.
    ///
    /// # Errors
    ///
    /// Returns the error of the fetch this call started or joined.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub async fn fetch_query<F, Fut, E>(
        &self,
        key: &impl ToString,
        fetcher: F,
        options: QueryOptions,
    ) -> Result<T, QueryError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + 'static,
    {
        let key = key.to_string();
        let fetcher: Fetcher<T> = Arc::new(move || fetcher().map_err(QueryError::fetch).boxed());
        self.inner.store.remember_fetcher(&key, fetcher.clone());

        match self.begin(&key, fetcher, options.stale_time, false) {
            Plan::Ready(data) => Ok(data),
            Plan::Wait(signal) => wait(signal).await,
        }
    }

    /// Discards the cached state for `key` and refetches it in the background.
    ///
    /// The refetch uses the fetcher most recently passed to
    /// [`fetch_query`](Self::fetch_query) for this key and its recorded stale
    /// time. Does nothing for keys that were never fetched. If a fetch for
    /// `key` is already in flight, no second fetch is started.
    pub fn invalidate_query(&self, key: &impl ToString) {
        let key = key.to_string();
        let Some(fetcher) = self.inner.store.fetcher(&key) else {
            debug!(key = %key, "invalidated unknown query");
            return;
        };
        if Handle::try_current().is_err() {
            warn!(key = %key, "cannot refetch invalidated query outside of a Tokio runtime");
            return;
        }

        let stale_time = self
            .inner
            .store
            .get(&key)
            .map_or(Duration::ZERO, |state| state.stale_time());
        debug!(key = %key, "invalidating query");
        // The outcome reaches observers through the cache and its listeners.
        let _ = self.begin(&key, fetcher, stale_time, true);
    }

    /// Registers `listener` to be called whenever the state of `key` changes.
    ///
    /// Listeners run synchronously, in subscription order, on the task that
    /// changed the state. They receive no arguments and should call
    /// [`get_state`](Self::get_state) to read the new state. No lock is held
    /// while they run.
    pub fn subscribe(
        &self,
        key: &impl ToString,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.notifier.subscribe(key.to_string(), Arc::new(listener))
    }

    /// Returns a snapshot of the current state of `key`.
    #[must_use]
    pub fn get_state(&self, key: &impl ToString) -> Option<QueryState<T>> {
        self.inner.store.get(&key.to_string())
    }

    /// Returns a stream of the latest state of `key`.
    ///
    /// The stream starts with the current state, if any, followed by a
    /// snapshot whenever a notification finds the state changed since the
    /// last one sent. Each snapshot is read when its notification is
    /// delivered, so a transition that is immediately superseded by another
    /// one (such as a short `Loading` on a multi-threaded runtime) may be
    /// skipped. No snapshot is sent twice. Dropping the stream unsubscribes it.
    pub fn watch_query(&self, key: &impl ToString) -> BoxStream<'static, QueryState<T>> {
        let key = key.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(AtomicU64::new(0));

        // Sends the current state unless a newer or equal revision went out already.
        let send_latest = {
            let client = self.clone();
            let key = key.clone();
            move || {
                if let Some((revision, state)) = client.inner.store.snapshot(&key) {
                    if sent.fetch_max(revision, Ordering::SeqCst) < revision {
                        let _ = tx.send(state);
                    }
                }
            }
        };
        let send_latest = Arc::new(send_latest);
        let listener = send_latest.clone();
        let subscription = self.subscribe(&key, move || listener());
        send_latest();

        // The subscription travels with the stream and is released when it is dropped.
        stream::unfold((rx, subscription), |(mut rx, subscription)| async move {
            let state = rx.recv().await;
            state.map(|state| (state, (rx, subscription)))
        })
        .boxed()
    }

    /// Runs the atomic section for `key` and starts a fetch if one is needed.
    ///
    /// With `discard` set, the cached state is dropped instead of being
    /// checked for freshness or kept visible while loading.
    fn begin(&self, key: &str, fetcher: Fetcher<T>, stale_time: Duration, discard: bool) -> Plan<T> {
        let now = Instant::now();
        let decision = self.inner.store.update(key, |slot| {
            if !discard {
                let fresh = slot
                    .state
                    .as_ref()
                    .filter(|state| state.is_fresh(stale_time, now))
                    .and_then(QueryState::data);
                if let Some(data) = fresh {
                    return (Decision::Fresh(data.clone()), false);
                }
            }

            // A signal whose sender is gone belongs to a fetch that never settled.
            let live = slot
                .in_flight
                .as_ref()
                .filter(|signal| signal.has_changed().is_ok());
            if let Some(signal) = live {
                return (Decision::Join(signal.clone()), false);
            }

            let previous = if discard { None } else { slot.state.take() };
            let loading = previous
                .unwrap_or_else(|| QueryState::idle(stale_time))
                .into_loading(stale_time);
            let (tx, rx) = watch::channel(None);
            slot.state = Some(loading);
            slot.in_flight = Some(rx.clone());
            (Decision::Start(tx, rx), true)
        });

        match decision {
            Decision::Fresh(data) => {
                debug!(key = %key, "serving fresh cached value");
                Plan::Ready(data)
            }
            Decision::Join(signal) => {
                debug!(key = %key, "joining in-flight fetch");
                Plan::Wait(signal)
            }
            Decision::Start(tx, signal) => {
                debug!(key = %key, stale_time = ?stale_time, "starting fetch");
                let in_flight = InFlight {
                    inner: self.inner.clone(),
                    key: key.to_string(),
                    tx,
                };
                tokio::spawn(run_fetch(in_flight, fetcher));
                Plan::Wait(signal)
            }
        }
    }
}

/// Ownership of one started fetch.
///
/// Settles the key exactly once: with the fetch outcome, or with an
/// abandoned error if it is dropped before that.
struct InFlight<T: Clone> {
    inner: Arc<Inner<T>>,
    key: String,
    tx: watch::Sender<Option<Outcome<T>>>,
}

impl<T: Clone> InFlight<T> {
    fn settle(&self, outcome: Outcome<T>) {
        // This fetch is the only writer of the key until it leaves `Loading`.
        let previous = self
            .inner
            .store
            .get(&self.key)
            .unwrap_or_else(|| QueryState::idle(Duration::ZERO));
        let next = match &outcome {
            Ok(data) => {
                debug!(key = %self.key, "fetch succeeded");
                previous.into_success(data.clone(), Instant::now())
            }
            Err(err) => {
                warn!(key = %self.key, error = %err, "fetch failed");
                previous.into_error(err.clone())
            }
        };
        self.inner.store.set(&self.key, next);
        self.tx.send_replace(Some(outcome));
    }

    fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl<T: Clone> Drop for InFlight<T> {
    fn drop(&mut self) {
        if !self.is_settled() {
            self.settle(Err(QueryError::abandoned()));
        }
    }
}

/// Drives one fetch to completion, records its outcome and publishes it.
async fn run_fetch<T>(in_flight: InFlight<T>, fetcher: Fetcher<T>)
where
    T: Clone + Send + Sync + 'static,
{
    let outcome = match AssertUnwindSafe(async move { fetcher().await })
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(payload) => Err(QueryError::from_panic(&*payload)),
    };
    in_flight.settle(outcome);
}

async fn wait<T: Clone>(mut signal: Signal<T>) -> Outcome<T> {
    let settled = signal
        .wait_for(Option::is_some)
        .await
        .map_err(|_| QueryError::abandoned())?;
    (*settled).clone().unwrap_or_else(|| Err(QueryError::abandoned()))
}

impl<T> Clone for QueryClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for QueryClient<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for QueryClient<T>
where
    T: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("queries", &self.inner.store.len())
            .finish_non_exhaustive()
    }
}
