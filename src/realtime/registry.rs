//! Event-type keyed listener registry with capability-style unsubscription.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    buckets: Mutex<HashMap<String, Vec<(ListenerId, Listener)>>>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buckets = self.lock();
        let mut counts: Vec<(&String, usize)> = buckets.iter().map(|(k, v)| (k, v.len())).collect();
        counts.sort();
        f.debug_struct("ListenerRegistry").field("listeners", &counts).finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(ListenerId, Listener)>>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, event_type: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(event_type.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    /// Returns false if the listener was already gone.
    pub fn remove(&self, event_type: &str, id: ListenerId) -> bool {
        let mut buckets = self.lock();
        let Some(bucket) = buckets.get_mut(event_type) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|(lid, _)| *lid != id);
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            buckets.remove(event_type);
        }
        removed
    }

    /// Call every listener for `event_type` in registration order. The lock
    /// is released first so listeners may (un)subscribe re-entrantly.
    pub fn dispatch(&self, event_type: &str, payload: &Value) -> usize {
        let listeners: Vec<Listener> = match self.lock().get(event_type) {
            Some(bucket) => bucket.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return 0,
        };
        for listener in &listeners {
            listener(payload);
        }
        listeners.len()
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.lock().get(event_type).map_or(0, Vec::len)
    }
}

/// Handle returned by a subscription; its only operation is `unsubscribe`.
#[must_use = "dropping a Subscription keeps the listener registered"]
pub struct Subscription {
    registry: Weak<ListenerRegistry>,
    event_type: String,
    id: ListenerId,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("id", &self.id)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(registry: &Arc<ListenerRegistry>, event_type: &str, id: ListenerId) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            event_type: event_type.to_string(),
            id,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.event_type, self.id);
        }
    }
}
