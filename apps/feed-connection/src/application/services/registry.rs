//! Feed Registry
//!
//! Process-wide lookup of connection managers by endpoint. Every caller
//! that connects to the same endpoint shares one [`ConnectionManager`], and
//! therefore one socket.
//!
//! [`ConnectionHandle`]s are reference counted. A component tears its feed
//! down by dropping its handle; the last drop for an endpoint shuts the
//! manager down and removes it. Handles cannot shut a shared manager down
//! themselves. Forced teardown goes through [`FeedRegistry::shutdown_endpoint`]
//! or [`FeedRegistry::shutdown_all`], and the next
//! [`FeedRegistry::connect`] creates a fresh manager.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use super::manager::{
    ConnectionManager, ListenerId, ManagerConfig, ManagerStats, SubscriptionHandle,
};
use crate::application::FeedError;
use crate::application::ports::Transport;
use crate::domain::connection::ConnectionState;
use crate::domain::reconnect::RetryState;
use crate::domain::streaming::{InboundMessage, Topic};

struct Entry {
    manager: Arc<ConnectionManager>,
    handles: usize,
}

/// Snapshot of one registered feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedSnapshot {
    /// Endpoint URL.
    pub endpoint: String,
    /// Outstanding handles.
    pub handles: usize,
    /// Manager statistics.
    pub stats: ManagerStats,
}

/// Shared registry of connection managers keyed by endpoint.
pub struct FeedRegistry {
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
    entries: Mutex<HashMap<String, Entry>>,
    self_ref: Weak<Self>,
}

impl std::fmt::Debug for FeedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedRegistry")
            .field("endpoints", &self.len())
            .finish_non_exhaustive()
    }
}

impl FeedRegistry {
    /// Create a registry whose managers use `transport` and `config`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: ManagerConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            transport,
            config,
            entries: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Acquire a handle to the manager for `endpoint`, creating it if needed.
    ///
    /// # Panics
    ///
    /// Panics if a manager has to be created outside a Tokio runtime.
    pub fn connect(&self, endpoint: &str) -> ConnectionHandle {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(endpoint)
            && !entry.manager.is_disposed()
        {
            entry.handles += 1;
            return self.handle(Arc::clone(&entry.manager));
        }

        tracing::info!(endpoint, "Creating feed connection manager");
        let manager = ConnectionManager::new(
            endpoint,
            Arc::clone(&self.transport),
            self.config.clone(),
        );
        entries.insert(
            endpoint.to_string(),
            Entry {
                manager: Arc::clone(&manager),
                handles: 1,
            },
        );
        self.handle(manager)
    }

    /// The live manager for `endpoint`, without acquiring a handle.
    #[must_use]
    pub fn get(&self, endpoint: &str) -> Option<Arc<ConnectionManager>> {
        self.entries
            .lock()
            .get(endpoint)
            .map(|entry| Arc::clone(&entry.manager))
    }

    /// Number of registered endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no endpoint is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot every registered feed, sorted by endpoint.
    #[must_use]
    pub fn snapshots(&self) -> Vec<FeedSnapshot> {
        let entries: Vec<(String, usize, Arc<ConnectionManager>)> = self
            .entries
            .lock()
            .iter()
            .map(|(endpoint, entry)| (endpoint.clone(), entry.handles, Arc::clone(&entry.manager)))
            .collect();

        let mut snapshots: Vec<FeedSnapshot> = entries
            .into_iter()
            .map(|(endpoint, handles, manager)| FeedSnapshot {
                endpoint,
                handles,
                stats: manager.stats(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        snapshots
    }

    /// Shut down and forget the manager for `endpoint`.
    ///
    /// Outstanding handles for it see a disposed feed. Returns `false` if the
    /// endpoint is not registered.
    pub fn shutdown_endpoint(&self, endpoint: &str) -> bool {
        let Some(entry) = self.entries.lock().remove(endpoint) else {
            return false;
        };
        tracing::info!(endpoint, handles = entry.handles, "Shutting feed down");
        entry.manager.shutdown();
        true
    }

    /// Shut down and forget every manager.
    ///
    /// Outstanding handles stay usable but their managers are disposed.
    pub fn shutdown_all(&self) {
        let drained: Vec<Entry> = self.entries.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.manager.shutdown();
        }
    }

    fn handle(&self, manager: Arc<ConnectionManager>) -> ConnectionHandle {
        ConnectionHandle {
            manager,
            registry: self.self_ref.clone(),
        }
    }

    fn retain(&self, manager: &Arc<ConnectionManager>) {
        if let Some(entry) = self.entries.lock().get_mut(manager.endpoint())
            && Arc::ptr_eq(&entry.manager, manager)
        {
            entry.handles += 1;
        }
    }

    fn release(&self, manager: &Arc<ConnectionManager>) {
        let removed = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(manager.endpoint()) else {
                return;
            };
            // A replaced manager's handles no longer count
            if !Arc::ptr_eq(&entry.manager, manager) {
                return;
            }

            entry.handles = entry.handles.saturating_sub(1);
            if entry.handles > 0 {
                return;
            }
            entries.remove(manager.endpoint())
        };

        if let Some(entry) = removed {
            tracing::info!(endpoint = %entry.manager.endpoint(), "Last handle released");
            entry.manager.shutdown();
        }
    }
}

/// Counted reference to a shared [`ConnectionManager`].
///
/// Exposes the feed API of the manager except shutdown: other holders may
/// still be using the connection. Drop the handle to release it.
pub struct ConnectionHandle {
    manager: Arc<ConnectionManager>,
    registry: Weak<FeedRegistry>,
}

impl ConnectionHandle {
    pub(crate) const fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.manager.endpoint()
    }

    /// See [`ConnectionManager::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Disposed`] once the feed has been shut down.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Result<SubscriptionHandle, FeedError>
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.manager.subscribe(topic, callback)
    }

    /// See [`ConnectionManager::unsubscribe`].
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.manager.unsubscribe(handle);
    }

    /// See [`ConnectionManager::send`].
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::NotConnected`] unless the feed is live.
    pub fn send(&self, text: &str) -> Result<(), FeedError> {
        self.manager.send(text)
    }

    /// See [`ConnectionManager::send_json`].
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Encode`] or the error from [`Self::send`].
    pub fn send_json<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), FeedError> {
        self.manager.send_json(payload)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Whether the shared manager has been shut down.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.manager.is_disposed()
    }

    /// See [`ConnectionManager::on_state_change`].
    #[must_use = "the id is needed to remove the listener"]
    pub fn on_state_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.manager.on_state_change(callback)
    }

    /// See [`ConnectionManager::on_give_up`].
    #[must_use = "the id is needed to remove the listener"]
    pub fn on_give_up<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(RetryState) + Send + Sync + 'static,
    {
        self.manager.on_give_up(callback)
    }

    /// See [`ConnectionManager::remove_listener`].
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.manager.remove_listener(id)
    }

    /// Watch channel that always holds the latest state.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state_changes()
    }

    /// Current retry bookkeeping.
    #[must_use]
    pub fn retry_state(&self) -> RetryState {
        self.manager.retry_state()
    }

    /// Topics with at least one subscriber, in activation order.
    #[must_use]
    pub fn active_topics(&self) -> Vec<Topic> {
        self.manager.active_topics()
    }

    /// Point-in-time statistics.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        self.manager.stats()
    }

    /// See [`ConnectionManager::retry_now`].
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Disposed`] once the feed has been shut down.
    pub fn retry_now(&self) -> Result<(), FeedError> {
        self.manager.retry_now()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("endpoint", &self.manager.endpoint())
            .finish_non_exhaustive()
    }
}

impl Clone for ConnectionHandle {
    fn clone(&self) -> Self {
        if let Some(registry) = self.registry.upgrade() {
            registry.retain(&self.manager);
        }
        Self {
            manager: Arc::clone(&self.manager),
            registry: self.registry.clone(),
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.manager);
        }
    }
}
