//! Subscription Registry
//!
//! Tracks which local subscriber callbacks are interested in which topics.
//!
//! # Design
//!
//! The registry tracks:
//! - Which subscribers are registered on each topic, in registration order
//! - Which topics each subscriber listens to
//! - The order in which topics became active, so resubscription after a
//!   reconnect replays them deterministically
//!
//! A topic is active while it has at least one subscriber. Callers learn
//! about 0→1 and 1→0 transitions from the return values of
//! [`SubscriptionRegistry::add_subscriber`] and
//! [`SubscriptionRegistry::remove_subscriber`]; those are the only moments
//! the server has to be told anything.
//!
//! The registry never owns subscriber lifecycle: it holds the callback the
//! caller handed in and drops it on removal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::streaming::{InboundMessage, Topic};

// =============================================================================
// Types
// =============================================================================

/// Unique registration id for a subscriber.
pub type SubscriberId = u64;

/// Callback invoked for every message on a subscribed topic.
pub type MessageCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Topics with at least one subscriber.
    pub topic_count: usize,
    /// Distinct subscribers across all topics.
    pub subscriber_count: usize,
    /// (topic, subscriber) registrations.
    pub registration_count: usize,
}

#[derive(Default)]
struct RegistryState {
    /// Active topics in activation order.
    topics: Vec<Topic>,
    /// Topic → subscribers in registration order.
    subscribers: HashMap<Topic, Vec<(SubscriberId, MessageCallback)>>,
    /// Subscriber → topics it is registered on.
    subscriber_topics: HashMap<SubscriberId, HashSet<Topic>>,
}

impl RegistryState {
    fn add(&mut self, topic: &str, id: SubscriberId, callback: MessageCallback) -> bool {
        let entry = self.subscribers.entry(topic.to_string()).or_default();

        // Re-registration replaces the callback without changing the count
        if let Some(slot) = entry.iter_mut().find(|(existing, _)| *existing == id) {
            slot.1 = callback;
            return false;
        }

        entry.push((id, callback));
        self.subscriber_topics
            .entry(id)
            .or_default()
            .insert(topic.to_string());

        if entry.len() == 1 {
            self.topics.push(topic.to_string());
            true
        } else {
            false
        }
    }

    fn remove(&mut self, topic: &str, id: SubscriberId) -> bool {
        let Some(entry) = self.subscribers.get_mut(topic) else {
            return false;
        };

        let before = entry.len();
        entry.retain(|(existing, _)| *existing != id);
        if entry.len() == before {
            return false;
        }

        if let Some(topics) = self.subscriber_topics.get_mut(&id) {
            topics.remove(topic);
            if topics.is_empty() {
                self.subscriber_topics.remove(&id);
            }
        }

        if entry.is_empty() {
            self.subscribers.remove(topic);
            self.topics.retain(|t| t != topic);
            true
        } else {
            false
        }
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Reference-counted topic → subscriber registry.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use feed_connection::domain::subscription::SubscriptionRegistry;
///
/// let registry = SubscriptionRegistry::new();
/// let first = registry.next_subscriber_id();
/// let second = registry.next_subscriber_id();
///
/// // First subscriber activates the topic
/// assert!(registry.add_subscriber("AAPL", first, Arc::new(|_| {})));
/// // Second subscriber shares it
/// assert!(!registry.add_subscriber("AAPL", second, Arc::new(|_| {})));
///
/// // Topic stays active until the last subscriber leaves
/// assert!(!registry.remove_subscriber("AAPL", first));
/// assert!(registry.remove_subscriber("AAPL", second));
/// assert!(registry.active_topics().is_empty());
/// ```
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
    next_id: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh subscriber id.
    pub fn next_subscriber_id(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `callback` for `topic` under `id`.
    ///
    /// Returns `true` if the topic became active (0→1 subscribers).
    pub fn add_subscriber(&self, topic: &str, id: SubscriberId, callback: MessageCallback) -> bool {
        self.state.write().add(topic, id, callback)
    }

    /// Remove the registration of `id` on `topic`.
    ///
    /// Returns `true` if the topic became inactive (1→0 subscribers).
    /// Removing an unknown registration is a no-op returning `false`.
    pub fn remove_subscriber(&self, topic: &str, id: SubscriberId) -> bool {
        self.state.write().remove(topic, id)
    }

    /// Remove every registration of `id`.
    ///
    /// Returns the topics that became inactive.
    pub fn remove_all(&self, id: SubscriberId) -> Vec<Topic> {
        let mut state = self.state.write();
        let topics: Vec<Topic> = state
            .subscriber_topics
            .get(&id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();

        topics
            .into_iter()
            .filter(|topic| state.remove(topic, id))
            .collect()
    }

    /// Deliver `message` to every subscriber of `topic`.
    ///
    /// Callbacks run after the registry lock is released, in registration
    /// order, so a callback may subscribe or unsubscribe re-entrantly.
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, topic: &str, message: &InboundMessage) -> usize {
        let callbacks: Vec<MessageCallback> = {
            let state = self.state.read();
            match state.subscribers.get(topic) {
                Some(entry) => entry.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return 0,
            }
        };

        for callback in &callbacks {
            callback(message);
        }
        callbacks.len()
    }

    /// Topics with at least one subscriber, in activation order.
    #[must_use]
    pub fn active_topics(&self) -> Vec<Topic> {
        self.state.read().topics.clone()
    }

    /// Whether `topic` has at least one subscriber.
    #[must_use]
    pub fn is_active(&self, topic: &str) -> bool {
        self.state.read().subscribers.contains_key(topic)
    }

    /// Number of subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state.read().subscribers.get(topic).map_or(0, Vec::len)
    }

    /// Whether no topic is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().topics.is_empty()
    }

    /// Drop every registration, returning the topics that were active.
    pub fn clear(&self) -> Vec<Topic> {
        let mut state = self.state.write();
        let topics = std::mem::take(&mut state.topics);
        state.subscribers.clear();
        state.subscriber_topics.clear();
        topics
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        RegistryStats {
            topic_count: state.topics.len(),
            subscriber_count: state.subscriber_topics.len(),
            registration_count: state.subscribers.values().map(Vec::len).sum(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
