//! Listener registries with RAII unsubscription.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_listener_id: u64,
    listeners: BTreeMap<u64, Callback<T>>,
}

/// A set of callbacks notified with values of `T`.
pub struct Listeners<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_listener_id: 1,
                listeners: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let id = registry.next_listener_id;
            registry.next_listener_id = registry.next_listener_id.saturating_add(1);
            registry.listeners.insert(id, Arc::new(listener));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .listeners
                        .remove(&id);
                }
            })),
        }
    }

    /// Calls every listener in subscription order. Listeners run outside
    /// the registry lock, so they may subscribe or unsubscribe.
    pub fn emit(&self, value: &T) {
        let listeners: Vec<Callback<T>> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle for a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription removes the listener immediately"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    /// Keeps the listener registered for as long as its source lives.
    pub fn detach(mut self) {
        self.remove = None;
    }

    fn cancel(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_all_listeners() {
        let listeners = Listeners::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = total.clone();
        let _a = listeners.subscribe(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t2 = total.clone();
        let _b = listeners.subscribe(move |v| {
            t2.fetch_add(*v as usize * 10, Ordering::SeqCst);
        });

        listeners.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 22);
    }

    #[test]
    fn test_unsubscribe_and_drop_remove_listener() {
        let listeners = Listeners::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let sub = listeners.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        listeners.emit(&());
        sub.unsubscribe();
        listeners.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        {
            let _scoped = listeners.subscribe(|_| {});
            assert_eq!(listeners.len(), 1);
        }
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_detached_listener_stays() {
        let listeners = Listeners::<()>::new();
        listeners.subscribe(|_| {}).detach();
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_subscription_outliving_source_is_harmless() {
        let listeners = Listeners::<()>::new();
        let sub = listeners.subscribe(|_| {});
        drop(listeners);
        sub.unsubscribe();
    }
}
