//! Typed publish/subscribe for sync lifecycle events.
//!
//! Subscribing hands back a [`Subscription`]; dropping it unregisters the
//! listener, so a hook that goes away cannot leave a callback behind.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<ListenerId, Listener<E>>>,
}

pub struct SyncEventBus<E> {
    registry: Arc<Registry<E>>,
}

impl<E> Clone for SyncEventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E> Default for SyncEventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> SyncEventBus<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));
        debug!(listener = id.0, "sync listener registered");

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Returns whether the listener was still registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.registry.remove(id)
    }

    /// Delivers to every listener registered at the time of the call, in registration order.
    pub fn publish(&self, event: &E) {
        // Listeners may subscribe or unsubscribe from inside the callback.
        let listeners: Vec<Listener<E>> = self
            .registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<E> Registry<E> {
    fn remove(&self, id: ListenerId) -> bool {
        let removed = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!(listener = id.0, "sync listener removed");
        }
        removed
    }
}

/// Disposer returned by [`SyncEventBus::subscribe`].
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription<E> {
    id: ListenerId,
    registry: Weak<Registry<E>>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Keeps the listener registered for the lifetime of the bus.
    pub fn detach(self) -> ListenerId {
        let id = self.id;
        std::mem::forget(self);
        id
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
