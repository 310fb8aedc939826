//! Process-wide set of live listeners
//!
//! Membership changes take the write lock; fan-out and lookups iterate under
//! the read lock, so publishing and connection churn interleave freely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::listener::{Listener, ListenerId};

#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryStats {
    pub total_added: u64,
    pub total_removed: u64,
}

#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<ListenerId, Arc<Listener>>>,
    next_id: AtomicU64,
    stats: RwLock<RegistryStats>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a listener about to be created
    pub fn next_id(&self) -> ListenerId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add(&self, listener: Arc<Listener>) {
        debug!(listener = listener.id(), "Registered listener for {}", listener.peer_node());
        self.listeners.write().insert(listener.id(), listener);
        self.stats.write().total_added += 1;
    }

    pub fn remove(&self, id: ListenerId) -> Option<Arc<Listener>> {
        let removed = self.listeners.write().remove(&id);
        if removed.is_some() {
            self.stats.write().total_removed += 1;
            debug!(listener = id, "Unregistered listener");
        }
        removed
    }

    pub fn get(&self, id: ListenerId) -> Option<Arc<Listener>> {
        self.listeners.read().get(&id).cloned()
    }

    /// Run `f` over every listener under the read lock
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Listener>)) {
        for listener in self.listeners.read().values() {
            f(listener);
        }
    }

    /// Listeners ordered by id
    pub fn snapshot(&self) -> Vec<Arc<Listener>> {
        let mut listeners: Vec<_> = self.listeners.read().values().cloned().collect();
        listeners.sort_by_key(|l| l.id());
        listeners
    }

    /// A running listener connected to `node`
    pub fn find_by_node(&self, node: &str) -> Option<Arc<Listener>> {
        self.listeners
            .read()
            .values()
            .filter(|l| l.peer_node() == node && l.is_running())
            .min_by_key(|l| l.id())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        *self.stats.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::listener::{Direction, ListenerState};
    use crate::node::memory;
    use crate::term::Pid;

    fn listener(registry: &ListenerRegistry, node: &str) -> Arc<Listener> {
        let (conn, _peer) = memory::pair(Pid::new("fs@host", 1, 0, 1), node);
        Arc::new(Listener::new(
            registry.next_id(),
            Arc::new(conn),
            Direction::Outbound,
            &BridgeConfig::default(),
        ))
    }

    #[test]
    fn test_membership() {
        let registry = ListenerRegistry::new();
        let a = listener(&registry, "a@box");
        let b = listener(&registry, "b@box");
        assert_ne!(a.id(), b.id());

        registry.add(a.clone());
        registry.add(b.clone());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.snapshot()[0].id(), a.id());

        // Only running listeners are reusable
        assert!(registry.find_by_node("b@box").is_none());
        b.set_state(ListenerState::Running);
        assert_eq!(registry.find_by_node("b@box").unwrap().id(), b.id());

        assert!(registry.remove(a.id()).is_some());
        assert!(registry.remove(a.id()).is_none());
        assert!(registry.get(a.id()).is_none());

        let stats = registry.stats();
        assert_eq!((stats.total_added, stats.total_removed), (2, 1));
    }
}
