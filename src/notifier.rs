//! Per-key change notification.
//!
//! Listeners are plain callbacks without arguments. They are told *that* a key
//! changed and read the new state themselves through
//! [`QueryClient::get_state`](crate::client::QueryClient::get_state).

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{trace, warn};

pub(crate) type Listener = Arc<dyn Fn() + Send + Sync>;

/// Registry of listeners, grouped by query key in subscription order.
#[derive(Default)]
pub(crate) struct Notifier {
    listeners: DashMap<String, BTreeMap<u64, Listener>>,
    next_id: AtomicU64,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for `key` and returns the handle that removes it.
    pub(crate) fn subscribe(self: &Arc<Self>, key: String, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entry(key.clone())
            .or_default()
            .insert(id, listener);
        trace!(key = %key, id, "listener subscribed");

        Subscription {
            notifier: Arc::downgrade(self),
            key,
            id,
            released: AtomicBool::new(false),
        }
    }

    fn remove(&self, key: &str, id: u64) {
        // The guard from `get_mut` must be gone before `remove_if` locks the shard again.
        let emptied = match self.listeners.get_mut(key) {
            Some(mut set) => {
                set.remove(&id);
                set.is_empty()
            }
            None => false,
        };
        if emptied {
            self.listeners.remove_if(key, |_, set| set.is_empty());
        }
        trace!(key = %key, id, "listener unsubscribed");
    }

    /// Calls every listener registered for `key` at the time of the call.
    ///
    /// No lock is held while listeners run, so they may call back into the cache.
    /// A panicking listener is logged and does not stop delivery to the rest.
    pub(crate) fn notify(&self, key: &str) {
        let snapshot: Vec<Listener> = match self.listeners.get(key) {
            Some(set) => set.values().cloned().collect(),
            None => return,
        };

        trace!(key = %key, listeners = snapshot.len(), "notifying");
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                warn!(key = %key, "listener panicked during notification");
            }
        }
    }

    #[cfg(test)]
    fn listener_count(&self, key: &str) -> usize {
        self.listeners.get(key).map_or(0, |set| set.len())
    }
}

/// Handle for a registered listener.
///
/// The listener stays registered until [`unsubscribe`](Self::unsubscribe) is
/// called or the handle is dropped.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    notifier: Weak<Notifier>,
    key: String,
    id: u64,
    released: AtomicBool,
}

impl Subscription {
    /// Removes the listener. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.remove(&self.key, self.id);
        }
    }

    /// Returns the key this subscription listens to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns `true` once the listener has been removed.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Listener {
        let log = log.clone();
        Arc::new(move || log.lock().unwrap().push(name))
    }

    fn explode() {
        panic!("listener failure");
    }

    #[test]
    fn test_notify_in_subscription_order() {
        let notifier = Arc::new(Notifier::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let _a = notifier.subscribe("k".to_string(), recorder(&log, "a"));
        let _b = notifier.subscribe("k".to_string(), recorder(&log, "b"));
        let _c = notifier.subscribe("k".to_string(), recorder(&log, "c"));

        notifier.notify("k");
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_notify_only_matching_key() {
        let notifier = Arc::new(Notifier::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let _a = notifier.subscribe("a".to_string(), recorder(&log, "a"));
        let _b = notifier.subscribe("b".to_string(), recorder(&log, "b"));

        notifier.notify("b");
        notifier.notify("missing");
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_unsubscribe_removes_exactly_one_listener() {
        let notifier = Arc::new(Notifier::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = notifier.subscribe("k".to_string(), recorder(&log, "a"));
        let _b = notifier.subscribe("k".to_string(), recorder(&log, "b"));

        a.unsubscribe();
        assert!(a.is_released());
        notifier.notify("k");
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
        assert_eq!(notifier.listener_count("k"), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_discards_empty_sets() {
        let notifier = Arc::new(Notifier::new());
        let sub = notifier.subscribe("k".to_string(), Arc::new(|| {}));

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!notifier.listeners.contains_key("k"));

        // Resubscribing recreates the set.
        let _again = notifier.subscribe("k".to_string(), Arc::new(|| {}));
        assert_eq!(notifier.listener_count("k"), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let notifier = Arc::new(Notifier::new());
        {
            let _sub = notifier.subscribe("k".to_string(), Arc::new(|| {}));
            assert_eq!(notifier.listener_count("k"), 1);
        }
        assert_eq!(notifier.listener_count("k"), 0);
    }

    #[test]
    fn test_unsubscribe_after_notifier_dropped() {
        let notifier = Arc::new(Notifier::new());
        let sub = notifier.subscribe("k".to_string(), Arc::new(|| {}));
        drop(notifier);
        sub.unsubscribe();
        assert!(sub.is_released());
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let notifier = Arc::new(Notifier::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let _a = notifier.subscribe("k".to_string(), recorder(&log, "a"));
        let _boom = notifier.subscribe("k".to_string(), Arc::new(explode));
        let _c = notifier.subscribe("k".to_string(), recorder(&log, "c"));

        notifier.notify("k");
        assert_eq!(*log.lock().unwrap(), vec!["a", "c"]);
    }

    #[test]
    fn test_listener_may_unsubscribe_during_notify() {
        let notifier = Arc::new(Notifier::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let inner = slot.clone();
        let sub = notifier.subscribe(
            "k".to_string(),
            Arc::new(move || {
                if let Some(sub) = inner.lock().unwrap().take() {
                    sub.unsubscribe();
                }
            }),
        );
        *slot.lock().unwrap() = Some(sub);

        notifier.notify("k");
        assert_eq!(notifier.listener_count("k"), 0);
    }
}
