//! Subscription registry
//!
//! Thread-safe mapping from connection to its subscribed symbols, shared by
//! the connection loops (control path) and the broadcaster (data path).
//! Both indices live behind one reader/writer lock so they never disagree.
//! The lock is only ever held for map mutation or copying; no I/O happens
//! under it.

use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::RwLock;
use tracing::debug;

use super::connection::{ConnectionHandle, ConnectionId};
use crate::RegistryError;

struct Subscriber {
    handle: ConnectionHandle,
    symbols: HashSet<String>,
}

#[derive(Default)]
struct RegistryState {
    /// connection -> handle + subscribed symbols
    connections: HashMap<ConnectionId, Subscriber>,
    /// symbol -> subscribed connections
    symbols: HashMap<String, HashSet<ConnectionId>>,
}

impl RegistryState {
    fn unindex(&mut self, symbol: &str, id: ConnectionId) {
        if let Some(ids) = self.symbols.get_mut(symbol) {
            ids.remove(&id);
            if ids.is_empty() {
                self.symbols.remove(symbol);
            }
        }
    }
}

/// Registry of open connections and their symbol subscriptions
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an open connection with an empty subscription set
    pub fn register(&self, handle: ConnectionHandle) -> Result<(), RegistryError> {
        let id = handle.id();
        let mut state = self.state.write();

        if state.connections.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }

        state.connections.insert(
            id,
            Subscriber {
                handle,
                symbols: HashSet::new(),
            },
        );
        drop(state);

        debug!("Registered {}", id);
        Ok(())
    }

    /// Remove a connection and all of its subscriptions
    ///
    /// Returns `false` if the connection was not registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut state = self.state.write();

        let Some(subscriber) = state.connections.remove(&id) else {
            return false;
        };

        for symbol in &subscriber.symbols {
            state.unindex(symbol, id);
        }
        drop(state);

        debug!(
            "Unregistered {} ({} subscriptions removed)",
            id,
            subscriber.symbols.len()
        );
        true
    }

    /// Subscribe a registered connection to a symbol
    ///
    /// Returns `Ok(false)` if it was already subscribed.
    pub fn add_subscription(&self, id: ConnectionId, symbol: &str) -> Result<bool, RegistryError> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let subscriber = state
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::NotRegistered(id))?;

        if !subscriber.symbols.insert(symbol.to_string()) {
            return Ok(false);
        }

        state
            .symbols
            .entry(symbol.to_string())
            .or_default()
            .insert(id);

        Ok(true)
    }

    /// Unsubscribe a connection from a symbol
    ///
    /// Removing a symbol the connection never had, or from a connection that
    /// is gone, is a no-op that returns `false`.
    pub fn remove_subscription(&self, id: ConnectionId, symbol: &str) -> bool {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let removed = state
            .connections
            .get_mut(&id)
            .map(|subscriber| subscriber.symbols.remove(symbol))
            .unwrap_or(false);

        if removed {
            state.unindex(symbol, id);
        }

        removed
    }

    /// Snapshot of every open connection subscribed to `symbol`
    ///
    /// The returned handles are copies; iterating them is unaffected by
    /// concurrent registry mutation.
    pub fn subscribers_of(&self, symbol: &str) -> Vec<ConnectionHandle> {
        let state = self.state.read();

        state
            .symbols
            .get(symbol)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.connections.get(id))
                    .map(|subscriber| subscriber.handle.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Copy of a connection's subscription set, if it is registered
    pub fn subscriptions_of(&self, id: ConnectionId) -> Option<HashSet<String>> {
        self.state
            .read()
            .connections
            .get(&id)
            .map(|subscriber| subscriber.symbols.clone())
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.state.read().connections.contains_key(&id)
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    /// Number of connections subscribed to `symbol`
    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.state
            .read()
            .symbols
            .get(symbol)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    pub fn has_subscribers(&self, symbol: &str) -> bool {
        self.subscriber_count(symbol) > 0
    }

    /// Every symbol with at least one subscriber
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.state.read().symbols.keys().cloned().collect()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("SubscriptionRegistry")
            .field("connections", &state.connections.len())
            .field("symbols", &state.symbols.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ids(handles: &[ConnectionHandle]) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = handles.iter().map(|h| h.id()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_register_twice_fails() {
        let registry = SubscriptionRegistry::new();
        let (handle, _rx) = ConnectionHandle::detached(1, 8);

        registry.register(handle.clone()).unwrap();
        assert_eq!(
            registry.register(handle.clone()),
            Err(RegistryError::AlreadyRegistered(ConnectionId(1)))
        );

        // allowed again after an intervening unregister
        assert!(registry.unregister(handle.id()));
        registry.register(handle).unwrap();
    }

    #[test]
    fn test_subscribe_requires_registration() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(
            registry.add_subscription(ConnectionId(9), "BTC-PERPETUAL"),
            Err(RegistryError::NotRegistered(ConnectionId(9)))
        );
        assert!(registry.subscribers_of("BTC-PERPETUAL").is_empty());
    }

    #[test]
    fn test_subscriptions_are_idempotent() {
        let registry = SubscriptionRegistry::new();
        let (handle, _rx) = ConnectionHandle::detached(1, 8);
        registry.register(handle.clone()).unwrap();

        assert!(registry.add_subscription(handle.id(), "BTC-PERPETUAL").unwrap());
        assert!(!registry.add_subscription(handle.id(), "BTC-PERPETUAL").unwrap());
        assert_eq!(registry.subscriber_count("BTC-PERPETUAL"), 1);
        assert_eq!(registry.subscribers_of("BTC-PERPETUAL").len(), 1);

        assert!(registry.remove_subscription(handle.id(), "BTC-PERPETUAL"));
        assert!(!registry.remove_subscription(handle.id(), "BTC-PERPETUAL"));
        assert!(!registry.remove_subscription(handle.id(), "ETH-PERPETUAL"));
        assert!(!registry.has_subscribers("BTC-PERPETUAL"));
        assert!(registry.subscribed_symbols().is_empty());
    }

    #[test]
    fn test_subscribers_filtered_by_symbol() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx_a) = ConnectionHandle::detached(1, 8);
        let (b, _rx_b) = ConnectionHandle::detached(2, 8);
        let (c, _rx_c) = ConnectionHandle::detached(3, 8);
        for handle in [&a, &b, &c] {
            registry.register(handle.clone()).unwrap();
        }

        registry.add_subscription(a.id(), "BTC-PERPETUAL").unwrap();
        registry.add_subscription(b.id(), "ETH-PERPETUAL").unwrap();
        registry.add_subscription(c.id(), "BTC-PERPETUAL").unwrap();
        registry.add_subscription(c.id(), "ETH-PERPETUAL").unwrap();

        assert_eq!(
            ids(&registry.subscribers_of("BTC-PERPETUAL")),
            vec![a.id(), c.id()]
        );
        assert_eq!(
            ids(&registry.subscribers_of("ETH-PERPETUAL")),
            vec![b.id(), c.id()]
        );
        assert!(registry.subscribers_of("SOL-PERPETUAL").is_empty());

        let mut symbols = registry.subscribed_symbols();
        symbols.sort();
        assert_eq!(symbols, vec!["BTC-PERPETUAL", "ETH-PERPETUAL"]);
    }

    #[test]
    fn test_unregister_removes_everything() {
        let registry = SubscriptionRegistry::new();
        let (handle, _rx) = ConnectionHandle::detached(1, 8);
        registry.register(handle.clone()).unwrap();
        registry.add_subscription(handle.id(), "BTC-PERPETUAL").unwrap();
        registry.add_subscription(handle.id(), "ETH-PERPETUAL").unwrap();

        assert!(registry.unregister(handle.id()));
        assert!(!registry.unregister(handle.id()));

        assert_eq!(registry.connection_count(), 0);
        assert!(registry.subscriptions_of(handle.id()).is_none());
        assert!(registry.subscribers_of("BTC-PERPETUAL").is_empty());
        assert!(registry.subscribers_of("ETH-PERPETUAL").is_empty());

        // no resurrection through a late subscribe
        assert!(registry.add_subscription(handle.id(), "BTC-PERPETUAL").is_err());
        assert!(registry.subscribers_of("BTC-PERPETUAL").is_empty());
    }

    #[test]
    fn test_snapshot_does_not_alias_live_state() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx_a) = ConnectionHandle::detached(1, 8);
        let (b, _rx_b) = ConnectionHandle::detached(2, 8);
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();
        registry.add_subscription(a.id(), "BTC-PERPETUAL").unwrap();

        let snapshot = registry.subscribers_of("BTC-PERPETUAL");

        registry.add_subscription(b.id(), "BTC-PERPETUAL").unwrap();
        registry.unregister(a.id());

        assert_eq!(ids(&snapshot), vec![a.id()]);
        assert_eq!(ids(&registry.subscribers_of("BTC-PERPETUAL")), vec![b.id()]);
    }

    /// Control-path mutation racing data-path snapshots must neither deadlock
    /// nor expose a half-updated subscriber set.
    #[test]
    fn test_concurrent_mutation_and_snapshots() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        for id in 0..16 {
            let (handle, rx) = ConnectionHandle::detached(id, 8);
            registry.register(handle.clone()).unwrap();
            handles.push(handle);
            receivers.push(rx);
        }

        let writers: Vec<_> = handles
            .iter()
            .cloned()
            .map(|handle| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..500 {
                        registry.add_subscription(handle.id(), "BTC-PERPETUAL").unwrap();
                        registry.add_subscription(handle.id(), "ETH-PERPETUAL").unwrap();
                        registry.remove_subscription(handle.id(), "BTC-PERPETUAL");
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let snapshot = registry.subscribers_of("BTC-PERPETUAL");
                        let unique: HashSet<_> = snapshot.iter().map(|h| h.id()).collect();
                        assert_eq!(unique.len(), snapshot.len());
                        assert!(snapshot.len() <= 16);
                    }
                })
            })
            .collect();

        for thread in writers.into_iter().chain(readers) {
            thread.join().unwrap();
        }

        assert!(registry.subscribers_of("BTC-PERPETUAL").is_empty());
        assert_eq!(registry.subscriber_count("ETH-PERPETUAL"), 16);
    }
}
