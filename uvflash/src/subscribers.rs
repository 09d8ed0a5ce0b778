//! Synchronous change notification.
//!
//! Callbacks run on the thread that made the change, after the owner has
//! released its own state lock, so a callback may read the owner's state.
//! Changes and subscriptions are serialized by a delivery lock held from the
//! state update until the last callback returns: every subscriber sees
//! changes in the order they were made, and a new subscriber's first value
//! is never older than the last change delivered to the others. A callback
//! must not change the owner's state itself.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// List of callbacks interested in values of type `T`.
pub(crate) struct Subscribers<T> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback<T>)>>,
    delivery: Mutex<()>,
}

impl<T: 'static> Subscribers<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            callbacks: Mutex::new(Vec::new()),
            delivery: Mutex::new(()),
        })
    }

    /// Register `callback`, invoke it once with the value `current` reads,
    /// and hand back the handle that removes it again.
    pub(crate) fn subscribe<F>(
        self: &Arc<Self>,
        current: impl FnOnce() -> T,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback<T> = Arc::new(callback);
        {
            let _delivery = self.deliver();
            self.lock().push((id, Arc::clone(&callback)));
            callback(&current());
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(subscribers) = weak.upgrade() {
                    subscribers.lock().retain(|(other, _)| *other != id);
                }
            })),
        }
    }

    /// Run `change`, then deliver the value it reports, if any.
    ///
    /// No other change or subscription interleaves until delivery is done.
    pub(crate) fn publish<R>(&self, change: impl FnOnce() -> (R, Option<T>)) -> R {
        let _delivery = self.deliver();
        let (result, changed) = change();
        if let Some(value) = changed {
            self.notify(&value);
        }
        result
    }

    fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in snapshot {
            callback(value);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn deliver(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Callback<T>)>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registration handle returned by `subscribe`.
///
/// Dropping it, or calling [`Subscription::unsubscribe`], stops further
/// notifications.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Stop receiving notifications.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
