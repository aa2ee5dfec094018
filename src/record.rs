use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::FieldKey;

/// A callback fired when an observed field of a record changes.
///
/// Observers carry no payload: the subscription itself identifies the record
/// and field, and the controller re-reads current state when it processes the
/// change.
pub type ChangeObserver = Arc<dyn Fn() + Send + Sync>;

/// A record the controller can track.
///
/// Records are reference-identity objects: the controller holds `Arc<R>`
/// instances and keeps the *same* instance across re-fetches when identity
/// matches, so consumers may hold onto a reference across updates.
///
/// The three `on_*` methods register change observers; the returned
/// [`Subscription`] must stop deliveries when cancelled (or dropped).
pub trait TrackedRecord: Send + Sync + 'static {
    /// Stable, unique key for this record across fetches.
    type Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn identity(&self) -> Self::Id;

    /// Whether the record has been marked deleted by its source.
    fn is_deleted(&self) -> bool;

    /// Observes payload mutations (anything that should redraw the record
    /// without reordering it).
    fn on_payload_change(&self, observer: ChangeObserver) -> Subscription;

    /// Observes transitions of the deleted flag.
    fn on_deleted_change(&self, observer: ChangeObserver) -> Subscription;

    /// Observes a single named field (the controller registers one of these
    /// per sort-relevant field).
    fn on_field_change(&self, field: FieldKey, observer: ChangeObserver) -> Subscription;
}

/// A cancelable registration.
///
/// Cancelling is idempotent and also happens on drop, so owners can simply
/// hold subscriptions in a collection and drop them to tear everything down.
pub struct Subscription(Option<Box<dyn FnOnce() + Send>>);

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(cancel)))
    }

    /// A subscription with nothing to cancel.
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn cancel(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Subscription(armed)"),
            None => f.write_str("Subscription(cancelled)"),
        }
    }
}

/// A handler registered with a [`Broadcast`].
pub type BroadcastHandler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An injected publish-subscribe source of external events (record creation,
/// data resets, memory pressure).
///
/// The controller only ever holds the [`Subscription`] returned here; there
/// is no process-wide bus.
pub trait Broadcast<T>: Send + Sync {
    fn subscribe(&self, handler: BroadcastHandler<T>) -> Subscription;
}

/// A minimal in-process [`Broadcast`] implementation.
///
/// Suitable for tests and for embedders that bridge platform notifications
/// into the controller. Handlers run synchronously on the publishing thread,
/// so publishers on the affinity thread get affinity-thread delivery for
/// free.
pub struct BroadcastHub<T> {
    subscribers: Arc<Mutex<HashMap<u64, BroadcastHandler<T>>>>,
    next_token: AtomicU64,
}

impl<T> BroadcastHub<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, value: &T) {
        // Snapshot so handlers may unsubscribe (or subscribe) reentrantly.
        let handlers: Vec<BroadcastHandler<T>> = {
            let subs = self.subscribers.lock().expect("broadcast hub poisoned");
            subs.values().cloned().collect()
        };
        for handler in handlers {
            handler(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("broadcast hub poisoned").len()
    }
}

impl<T> Default for BroadcastHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Broadcast<T> for BroadcastHub<T> {
    fn subscribe(&self, handler: BroadcastHandler<T>) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("broadcast hub poisoned")
            .insert(token, handler);

        let weak: Weak<Mutex<HashMap<u64, BroadcastHandler<T>>>> =
            Arc::downgrade(&self.subscribers);
        Subscription::new(move || {
            if let Some(subs) = weak.upgrade() {
                if let Ok(mut subs) = subs.lock() {
                    subs.remove(&token);
                }
            }
        })
    }
}

impl<T> fmt::Debug for BroadcastHub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
