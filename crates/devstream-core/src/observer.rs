//! Observer registry shared by the reconcilers.
//!
//! Notification iterates a snapshot of the observer list, so an observer
//! unsubscribing (itself or another) mid-notification is well-defined:
//! removal takes effect no later than the next notification cycle.

use std::sync::{Arc, Mutex, Weak};

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T: ?Sized> {
    next_id: u64,
    observers: Vec<(u64, Observer<T>)>,
}

/// A set of independent observers over one reconciled value.
pub struct ObserverSet<T: ?Sized> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: ?Sized + 'static> Default for ObserverSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + 'static> ObserverSet<T> {
    /// Create an empty observer set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                observers: Vec::new(),
            })),
        }
    }

    /// Register an observer. The caller is responsible for replaying
    /// current state to it; this registry only tracks membership.
    pub fn subscribe(&self, observer: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.observers.push((id, Arc::new(observer)));
            id
        };

        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().unwrap().observers.retain(|(i, _)| *i != id);
                }
            })),
        }
    }

    /// Invoke every registered observer, in registration order.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Observer<T>> = {
            let inner = self.inner.lock().unwrap();
            inner.observers.iter().map(|(_, f)| Arc::clone(f)).collect()
        };
        for observer in snapshot {
            observer(value);
        }
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().observers.len()
    }

    /// True if nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a registered observer.
///
/// Unsubscription is explicit: dropping the handle leaves the observer
/// registered. (Stale observers are reclaimed only when the owning
/// reconciler is torn down.)
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Remove the observer. Other observers are unaffected.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_notify_in_registration_order() {
        let set = ObserverSet::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        let _a = set.subscribe(move |v| s1.lock().unwrap().push(("a", *v)));
        let s2 = seen.clone();
        let _b = set.subscribe(move |v| s2.lock().unwrap().push(("b", *v)));

        set.notify(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_unsubscribe_leaves_others_intact() {
        let set = ObserverSet::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        let first = set.subscribe(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        let _second = set.subscribe(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        first.unsubscribe();
        set.notify(&0);
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_unsubscribe_during_notification_is_safe() {
        let set = Arc::new(ObserverSet::<u32>::new());
        let count = Arc::new(AtomicUsize::new(0));

        let sub_slot = Arc::new(Mutex::new(None::<Subscription>));

        // First observer removes the second mid-cycle; the second still
        // sees the current cycle (snapshot semantics) but not the next.
        let slot = sub_slot.clone();
        let _a = set.subscribe(move |_| {
            if let Some(sub) = slot.lock().unwrap().take() {
                sub.unsubscribe();
            }
        });
        let c = count.clone();
        let b = set.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        *sub_slot.lock().unwrap() = Some(b);

        set.notify(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        set.notify(&2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_subscription_keeps_observer() {
        let set = ObserverSet::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        drop(set.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        set.notify(&0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
