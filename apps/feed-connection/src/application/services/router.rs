//! Message Router
//!
//! Decodes raw frames, separates session control from data, and fans data
//! out to the subscribers registered for each topic.
//!
//! Routing rules:
//! - news items go to every symbol they mention and to the `news` channel
//! - quotes go to their symbol
//! - `data` envelopes go to the topic they name
//!
//! Malformed frames are dropped and counted; they never reach subscribers
//! and never affect the connection.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::domain::streaming::{
    Frame, FrameDecoder, InboundMessage, NEWS_TOPIC, NewsItem, Payload, ServerControl,
};
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::metrics as feed_metrics;

// =============================================================================
// Outcome & Stats
// =============================================================================

/// What the router did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Session control frame; not forwarded.
    Control(ServerControl),
    /// Data frame delivered to this many callbacks.
    Delivered(usize),
    /// News item already delivered recently.
    Duplicate,
    /// Well-formed frame of no known shape.
    Ignored,
    /// Frame failed to decode.
    Malformed,
}

/// Router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Text frames seen.
    pub frames_received: u64,
    /// Callback invocations.
    pub messages_delivered: u64,
    /// Frames dropped as malformed.
    pub decode_errors: u64,
    /// News items suppressed as duplicates.
    pub duplicates: u64,
}

// =============================================================================
// Dedup Window
// =============================================================================

/// Bounded set of recently delivered news ids.
#[derive(Debug)]
struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Returns `false` if `id` is already in the window.
    fn insert(&mut self, id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.seen.contains(id) {
            return false;
        }

        if self.order.len() == self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.seen.remove(&evicted);
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

// =============================================================================
// Router
// =============================================================================

/// Frame decoder plus topic fan-out.
///
/// Only ever reads the subscription registry.
#[derive(Debug)]
pub struct MessageRouter {
    endpoint: String,
    registry: Arc<SubscriptionRegistry>,
    decoder: FrameDecoder,
    dedup: Mutex<DedupWindow>,
    frames_received: AtomicU64,
    messages_delivered: AtomicU64,
    decode_errors: AtomicU64,
    duplicates: AtomicU64,
}

impl MessageRouter {
    /// Create a router reading from `registry`.
    ///
    /// `dedup_window` is the number of recent news ids remembered; `0`
    /// disables duplicate suppression.
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        registry: Arc<SubscriptionRegistry>,
        decoder: FrameDecoder,
        dedup_window: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            registry,
            decoder,
            dedup: Mutex::new(DedupWindow::new(dedup_window)),
            frames_received: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Decode `raw` and dispatch it.
    pub fn route(&self, raw: &str) -> RouteOutcome {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        feed_metrics::record_frame_received(&self.endpoint);

        let frame = match self.decoder.decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                feed_metrics::record_decode_error(&self.endpoint);
                tracing::debug!(
                    endpoint = %self.endpoint,
                    error = %e,
                    frame_len = raw.len(),
                    "Dropping malformed frame"
                );
                return RouteOutcome::Malformed;
            }
        };

        match frame {
            Frame::Control(control) => RouteOutcome::Control(control),
            Frame::News(item) => self.route_news(item),
            Frame::Quote(quote) => {
                let topic = quote.symbol.clone();
                self.deliver(&[InboundMessage::data(topic, Payload::Quote(quote))])
            }
            Frame::Envelope { topic, payload } => {
                self.deliver(&[InboundMessage::data(topic, Payload::Raw(payload))])
            }
            Frame::Unrecognized(kind) => {
                tracing::trace!(endpoint = %self.endpoint, kind = %kind, "Ignoring unrecognized frame");
                RouteOutcome::Ignored
            }
        }
    }

    fn route_news(&self, item: NewsItem) -> RouteOutcome {
        if !self.dedup.lock().insert(&item.id) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            feed_metrics::record_duplicate(&self.endpoint);
            tracing::debug!(endpoint = %self.endpoint, id = %item.id, "Suppressing duplicate news item");
            return RouteOutcome::Duplicate;
        }

        let mut topics: Vec<&str> = Vec::with_capacity(item.symbols.len() + 1);
        for symbol in item.symbols.iter().map(String::as_str).chain([NEWS_TOPIC]) {
            if !topics.contains(&symbol) {
                topics.push(symbol);
            }
        }

        let messages: Vec<InboundMessage> = topics
            .iter()
            .map(|topic| InboundMessage::data(*topic, Payload::News(item.clone())))
            .collect();
        self.deliver(&messages)
    }

    fn deliver(&self, messages: &[InboundMessage]) -> RouteOutcome {
        let delivered: usize = messages
            .iter()
            .filter_map(|message| {
                message
                    .topic
                    .as_deref()
                    .map(|topic| self.registry.dispatch(topic, message))
            })
            .sum();

        if delivered > 0 {
            self.messages_delivered
                .fetch_add(delivered as u64, Ordering::Relaxed);
            feed_metrics::record_messages_delivered(&self.endpoint, delivered as u64);
        }
        RouteOutcome::Delivered(delivered)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::domain::subscription::MessageCallback;

    const NEWS: &str = r#"{"id":"1","title":"X","content":"...","source":"S","timestamp":"2024-01-01T00:00:00Z","symbols":["AAPL"]}"#;

    fn recorder() -> (MessageCallback, Arc<StdMutex<Vec<InboundMessage>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: MessageCallback = Arc::new(move |msg: &InboundMessage| {
            sink.lock().unwrap().push(msg.clone());
        });
        (callback, seen)
    }

    fn router(registry: &Arc<SubscriptionRegistry>, dedup: usize) -> MessageRouter {
        MessageRouter::new(
            "wss://feed.example/ws",
            Arc::clone(registry),
            FrameDecoder::default(),
            dedup,
        )
    }

    #[test]
    fn news_reaches_symbol_subscriber_once() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (callback, seen) = recorder();
        registry.add_subscriber("AAPL", 1, callback);

        let outcome = router(&registry, 16).route(NEWS);

        assert_eq!(outcome, RouteOutcome::Delivered(1));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].topic.as_deref(), Some("AAPL"));
        assert_eq!(seen[0].as_news().map(|n| n.title.as_str()), Some("X"));
    }

    #[test]
    fn news_also_goes_to_news_channel() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (callback, seen) = recorder();
        registry.add_subscriber(NEWS_TOPIC, 1, callback);

        assert_eq!(router(&registry, 16).route(NEWS), RouteOutcome::Delivered(1));
        assert_eq!(seen.lock().unwrap()[0].topic.as_deref(), Some(NEWS_TOPIC));
    }

    #[test]
    fn malformed_frame_is_counted_not_delivered() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (callback, seen) = recorder();
        registry.add_subscriber("AAPL", 1, callback);
        let router = router(&registry, 16);

        assert_eq!(router.route("{not json"), RouteOutcome::Malformed);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(router.stats().decode_errors, 1);
        assert_eq!(router.stats().frames_received, 1);
    }

    #[test]
    fn connected_frame_is_control() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (callback, seen) = recorder();
        registry.add_subscriber("AAPL", 1, callback);

        let outcome = router(&registry, 16).route(r#"{"type":"connected","message":"hi"}"#);
        assert_eq!(
            outcome,
            RouteOutcome::Control(ServerControl::Connected {
                message: "hi".to_string()
            })
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn duplicate_news_is_suppressed() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (callback, seen) = recorder();
        registry.add_subscriber("AAPL", 1, callback);
        let router = router(&registry, 16);

        router.route(NEWS);
        assert_eq!(router.route(NEWS), RouteOutcome::Duplicate);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(router.stats().duplicates, 1);
    }

    #[test]
    fn zero_window_disables_dedup() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (callback, seen) = recorder();
        registry.add_subscriber("AAPL", 1, callback);
        let router = router(&registry, 0);

        router.route(NEWS);
        router.route(NEWS);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn dedup_window_evicts_oldest() {
        let mut window = DedupWindow::new(2);
        assert!(window.insert("a"));
        assert!(window.insert("b"));
        assert!(!window.insert("a"));
        assert!(window.insert("c"));
        // "a" fell out of the window
        assert!(window.insert("a"));
        assert!(!window.insert("c"));
    }

    #[test]
    fn quote_routes_by_symbol() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (callback, seen) = recorder();
        registry.add_subscriber("MSFT", 1, callback);
        let router = router(&registry, 16);

        assert_eq!(
            router.route(r#"{"symbol":"MSFT","price":412.5}"#),
            RouteOutcome::Delivered(1)
        );
        assert_eq!(
            router.route(r#"{"symbol":"AAPL","price":189.1}"#),
            RouteOutcome::Delivered(0)
        );
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(router.stats().messages_delivered, 1);
    }

    #[test]
    fn envelope_routes_by_topic() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (callback, seen) = recorder();
        registry.add_subscriber("movers", 1, callback);

        let outcome = router(&registry, 16)
            .route(r#"{"type":"data","topic":"movers","payload":{"up":["NVDA"]}}"#);

        assert_eq!(outcome, RouteOutcome::Delivered(1));
        assert_eq!(
            seen.lock().unwrap()[0].payload,
            Payload::Raw(serde_json::json!({"up": ["NVDA"]}))
        );
    }

    #[test]
    fn unknown_type_is_ignored() {
        let registry = Arc::new(SubscriptionRegistry::new());
        assert_eq!(
            router(&registry, 16).route(r#"{"type":"heartbeat"}"#),
            RouteOutcome::Ignored
        );
    }
}
