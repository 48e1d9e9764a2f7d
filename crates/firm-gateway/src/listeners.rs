//! Observer list for gateway events.
//!
//! The connection feeds one [`EventListeners::emit`] per inbound event; any
//! number of views can subscribe and drop their [`Subscription`] to leave.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::frame::EventFrame;
use crate::handler::GatewayHandler;

type Listener = Arc<dyn Fn(&EventFrame) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: BTreeMap<u64, (Option<String>, Listener)>,
}

#[derive(Clone, Default)]
pub struct EventListeners {
    inner: Arc<Mutex<Registry>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(listener))
    }

    /// Receive only events named `event`.
    pub fn subscribe_event<F>(&self, event: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        self.insert(Some(event.into()), Arc::new(listener))
    }

    /// Deliver `event` to every matching listener once. Listeners may
    /// subscribe or unsubscribe from inside the callback; one removed during
    /// this emit is skipped if it has not run yet.
    pub fn emit(&self, event: &EventFrame) -> usize {
        let targets: Vec<(u64, Listener)> = self
            .registry()
            .listeners
            .iter()
            .filter(|(_, (filter, _))| filter.as_deref().map_or(true, |name| name == event.event))
            .map(|(id, (_, listener))| (*id, Arc::clone(listener)))
            .collect();
        let mut delivered = 0;
        for (id, listener) in &targets {
            if !self.registry().listeners.contains_key(id) {
                continue;
            }
            listener(event);
            delivered += 1;
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.registry().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, filter: Option<String>, listener: Listener) -> Subscription {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners.insert(id, (filter, listener));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock_registry(&self.inner)
    }
}

fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl GatewayHandler for EventListeners {
    fn on_event(&self, event: &EventFrame) {
        self.emit(event);
    }
}

/// Handle returned by a subscribe call. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock_registry(&registry).listeners.remove(&self.id);
        }
    }
}
