//! Connection Manager
//!
//! Owns the single connection to one feed endpoint and is the source of
//! truth for whether that feed is live.
//!
//! # Lifecycle
//!
//! - The first subscriber opens a socket; further subscribers share it.
//! - Every `opened` event replays a subscribe frame for each active topic,
//!   in activation order.
//! - Any `closed` event with subscribers remaining goes through the
//!   [`ReconnectPolicy`]: wait and reopen, or give up and enter `FAILED`.
//! - When the last subscriber leaves, the socket is closed (after the idle
//!   linger, if one is configured) and the manager returns to `IDLE`.
//! - [`ConnectionManager::shutdown`] cancels everything and marks the
//!   manager disposed.
//!
//! # Epochs
//!
//! Every socket open increments the epoch. A socket event is acted on only
//! when the manager is not disposed, a socket is held, and the event's epoch
//! is the current one. Everything else is counted as stale and dropped, so
//! events from a replaced or torn-down socket can never reconnect or change
//! state.
//!
//! # Locking
//!
//! All state lives behind one mutex. Socket calls are non-blocking and made
//! under it; subscriber callbacks and state listeners always run after it is
//! released, so they may call back into the manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::router::{MessageRouter, RouteOutcome, RouterStats};
use crate::application::FeedError;
use crate::application::ports::{
    CloseInfo, SocketEvent, SocketEventKind, SocketEventSender, SocketHandle, Transport,
};
use crate::domain::connection::{ConnectionRecord, ConnectionState, Epoch};
use crate::domain::reconnect::{ReconnectConfig, ReconnectPolicy, RetryDecision, RetryState};
use crate::domain::streaming::{
    ControlAction, ControlRequest, FrameDecoder, InboundMessage, ServerControl, Topic,
};
use crate::domain::subscription::{SubscriberId, SubscriptionRegistry};
use crate::infrastructure::metrics as feed_metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Per-endpoint manager configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Reconnect timing and retry budget.
    pub reconnect: ReconnectConfig,
    /// How long an unused connection lingers before closing (zero = close at once).
    pub idle_timeout: Duration,
    /// Number of recent news ids remembered for duplicate suppression.
    pub dedup_window: usize,
    /// Treat untyped frames carrying `id` and `title` as news.
    pub infer_news: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            idle_timeout: Duration::ZERO,
            dedup_window: 256,
            infer_news: true,
        }
    }
}

// =============================================================================
// Public Types
// =============================================================================

/// Callback invoked on every state transition.
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Callback invoked once each time the retry budget is exhausted.
pub type GiveUpCallback = Arc<dyn Fn(RetryState) + Send + Sync>;

/// Identifies a registered state or give-up listener.
pub type ListenerId = u64;

/// Identifies one subscription made through [`ConnectionManager::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    topic: Topic,
    id: SubscriberId,
}

impl SubscriptionHandle {
    /// Subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Registration id.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }
}

/// Point-in-time manager statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Current state.
    pub state: ConnectionState,
    /// Current epoch.
    pub epoch: Epoch,
    /// Sockets that reached `opened`.
    pub opens: u64,
    /// Socket events dropped as stale.
    pub stale_events: u64,
    /// Topics with at least one subscriber.
    pub active_topics: usize,
    /// Current retry attempt.
    pub retry_attempt: u32,
    /// Abnormal closes since the last successful open.
    pub consecutive_failures: u32,
    /// Text frames received.
    pub frames_received: u64,
    /// Callback invocations.
    pub messages_delivered: u64,
    /// Malformed frames dropped.
    pub decode_errors: u64,
    /// Duplicate news items dropped.
    pub duplicates: u64,
}

// =============================================================================
// Internal State
// =============================================================================

struct Timer {
    id: u64,
    cancel: CancellationToken,
}

struct Inner {
    state: ConnectionState,
    epoch: Epoch,
    socket: Option<Box<dyn SocketHandle>>,
    retry: RetryState,
    record: ConnectionRecord,
    reconnect_timer: Option<Timer>,
    linger_timer: Option<Timer>,
    disposed: bool,
    opens: u64,
    stale_events: u64,
}

impl Inner {
    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.cancel.cancel();
        }
    }

    fn cancel_linger_timer(&mut self) {
        if let Some(timer) = self.linger_timer.take() {
            timer.cancel.cancel();
        }
    }

    fn accepts(&self, epoch: Epoch) -> bool {
        !self.disposed
            && epoch == self.epoch
            && self.socket.as_ref().is_some_and(|s| s.epoch() == epoch)
    }
}

/// Side effects collected under the lock and run after it is released.
#[derive(Default)]
struct Effects {
    transitions: Vec<ConnectionState>,
    gave_up: Option<RetryState>,
}

#[derive(Clone, Copy)]
enum TimerKind {
    Reconnect,
    Linger,
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Manages the connection to a single feed endpoint.
pub struct ConnectionManager {
    endpoint: String,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    idle_timeout: Duration,
    registry: Arc<SubscriptionRegistry>,
    router: MessageRouter,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    state_listeners: RwLock<Vec<(ListenerId, StateCallback)>>,
    give_up_listeners: RwLock<Vec<(ListenerId, GiveUpCallback)>>,
    next_listener_id: AtomicU64,
    events_tx: SocketEventSender,
    pump_cancel: CancellationToken,
    next_timer_id: AtomicU64,
    runtime: Handle,
    self_ref: Weak<Self>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager for `endpoint` and start its event pump.
    ///
    /// No socket is opened until the first subscription.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let endpoint = endpoint.into();
        let registry = Arc::new(SubscriptionRegistry::new());
        let router = MessageRouter::new(
            endpoint.clone(),
            Arc::clone(&registry),
            FrameDecoder::new(config.infer_news),
            config.dedup_window,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let runtime = Handle::current();

        let manager = Arc::new_cyclic(|self_ref| Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                epoch: 0,
                socket: None,
                retry: RetryState::default(),
                record: ConnectionRecord::new(endpoint.clone()),
                reconnect_timer: None,
                linger_timer: None,
                disposed: false,
                opens: 0,
                stale_events: 0,
            }),
            endpoint,
            transport,
            policy: ReconnectPolicy::new(config.reconnect),
            idle_timeout: config.idle_timeout,
            registry,
            router,
            state_tx,
            state_listeners: RwLock::new(Vec::new()),
            give_up_listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            events_tx,
            pump_cancel: CancellationToken::new(),
            next_timer_id: AtomicU64::new(1),
            runtime,
            self_ref: self_ref.clone(),
        });

        manager.runtime.spawn(run_event_pump(
            Arc::downgrade(&manager),
            events_rx,
            manager.pump_cancel.clone(),
        ));

        feed_metrics::set_connection_state(&manager.endpoint, ConnectionState::Idle);
        manager
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Endpoint URL this manager connects to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Register `callback` for messages on `topic`.
    ///
    /// Opens the connection if it is idle. If the connection is live and the
    /// topic is new, a subscribe frame is sent immediately; otherwise the
    /// topic is replayed when the socket opens.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::InvalidTopic`] for an empty topic and
    /// [`FeedError::Disposed`] after [`Self::shutdown`].
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Result<SubscriptionHandle, FeedError>
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        if topic.trim().is_empty() {
            return Err(FeedError::InvalidTopic(topic.to_string()));
        }

        let mut effects = Effects::default();
        let handle = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return Err(FeedError::Disposed);
            }

            let id = self.registry.next_subscriber_id();
            let activated = self.registry.add_subscriber(topic, id, Arc::new(callback));
            inner.cancel_linger_timer();
            feed_metrics::set_active_topics(&self.endpoint, self.registry.stats().topic_count);

            tracing::debug!(endpoint = %self.endpoint, topic, id, activated, "Subscriber added");

            match inner.state {
                ConnectionState::Idle | ConnectionState::Closing => {
                    self.open_socket(&mut inner, &mut effects);
                }
                ConnectionState::Open | ConnectionState::Confirmed if activated => {
                    self.send_control(&inner, ControlAction::Subscribe, topic);
                }
                ConnectionState::Failed => {
                    tracing::debug!(
                        endpoint = %self.endpoint,
                        topic,
                        "Feed failed; interest recorded until manual retry"
                    );
                }
                _ => {}
            }

            SubscriptionHandle {
                topic: topic.to_string(),
                id,
            }
        };

        self.apply(effects);
        Ok(handle)
    }

    /// Remove a subscription. Unknown or already-removed handles are ignored.
    ///
    /// When the topic loses its last subscriber an unsubscribe frame is sent
    /// (if live). When no topics remain the connection is closed, at once or
    /// after the idle linger.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }

            if !self.registry.remove_subscriber(&handle.topic, handle.id) {
                return;
            }
            feed_metrics::set_active_topics(&self.endpoint, self.registry.stats().topic_count);
            tracing::debug!(endpoint = %self.endpoint, topic = %handle.topic, "Topic inactive");

            if inner.state.is_live() {
                self.send_control(&inner, ControlAction::Unsubscribe, &handle.topic);
            }

            if self.registry.is_empty() {
                self.release_connection(&mut inner, &mut effects);
            }
        }
        self.apply(effects);
    }

    /// Send a raw text frame.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::NotConnected`] unless the feed is live, and
    /// [`FeedError::Disposed`] after [`Self::shutdown`].
    pub fn send(&self, text: &str) -> Result<(), FeedError> {
        let inner = self.inner.lock();
        if inner.disposed {
            return Err(FeedError::Disposed);
        }

        match inner.socket.as_ref() {
            Some(socket) if inner.state.is_live() => {
                socket.send(text.to_string()).map_err(FeedError::from)
            }
            _ => {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    state = %inner.state,
                    "Send while feed is not connected; dropping"
                );
                Err(FeedError::NotConnected)
            }
        }
    }

    /// Serialize `payload` to JSON and send it.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Encode`] if serialization fails, otherwise as
    /// [`Self::send`].
    pub fn send_json<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), FeedError> {
        let text = serde_json::to_string(payload)?;
        self.send(&text)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Whether [`Self::shutdown`] has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Register a callback for every state transition.
    ///
    /// The callback stays registered until [`Self::remove_listener`] or
    /// [`Self::shutdown`]. Registering on a disposed manager is a no-op.
    #[must_use = "the id is needed to remove the listener"]
    pub fn on_state_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        if !self.is_disposed() {
            self.state_listeners.write().push((id, Arc::new(callback)));
        }
        id
    }

    /// Register a callback for retry budget exhaustion.
    ///
    /// Same lifetime rules as [`Self::on_state_change`].
    #[must_use = "the id is needed to remove the listener"]
    pub fn on_give_up<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(RetryState) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        if !self.is_disposed() {
            self.give_up_listeners.write().push((id, Arc::new(callback)));
        }
        id
    }

    /// Unregister a state or give-up listener, dropping its callback.
    ///
    /// Returns `false` if the id is unknown or already removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state_listeners = self.state_listeners.write();
        if let Some(pos) = state_listeners.iter().position(|(lid, _)| *lid == id) {
            state_listeners.remove(pos);
            return true;
        }
        drop(state_listeners);

        let mut give_up_listeners = self.give_up_listeners.write();
        if let Some(pos) = give_up_listeners.iter().position(|(lid, _)| *lid == id) {
            give_up_listeners.remove(pos);
            return true;
        }
        false
    }

    /// Watch channel that always holds the latest state.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current retry bookkeeping.
    #[must_use]
    pub fn retry_state(&self) -> RetryState {
        self.inner.lock().retry
    }

    /// Topics with at least one subscriber, in activation order.
    #[must_use]
    pub fn active_topics(&self) -> Vec<Topic> {
        self.registry.active_topics()
    }

    /// Point-in-time statistics.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let RouterStats {
            frames_received,
            messages_delivered,
            decode_errors,
            duplicates,
        } = self.router.stats();
        let inner = self.inner.lock();

        ManagerStats {
            state: inner.state,
            epoch: inner.epoch,
            opens: inner.opens,
            stale_events: inner.stale_events,
            active_topics: self.registry.stats().topic_count,
            retry_attempt: inner.retry.attempt,
            consecutive_failures: inner.record.consecutive_failures,
            frames_received,
            messages_delivered,
            decode_errors,
            duplicates,
        }
    }

    /// Reconnect now, leaving `FAILED` or skipping the pending reconnect delay.
    ///
    /// Resets the retry counter. Has no effect in any other state.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Disposed`] after [`Self::shutdown`].
    pub fn retry_now(&self) -> Result<(), FeedError> {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return Err(FeedError::Disposed);
            }
            if !matches!(
                inner.state,
                ConnectionState::Failed | ConnectionState::ReconnectWait
            ) {
                return Ok(());
            }

            tracing::info!(endpoint = %self.endpoint, state = %inner.state, "Manual retry");
            inner.cancel_reconnect_timer();
            inner.retry.reset();

            if self.registry.is_empty() {
                self.transition(&mut inner, ConnectionState::Idle, &mut effects);
            } else {
                self.open_socket(&mut inner, &mut effects);
            }
        }
        self.apply(effects);
        Ok(())
    }

    /// Tear everything down and mark the manager disposed.
    ///
    /// Cancels pending timers, closes the socket, drops all subscriptions
    /// and listeners, and leaves the manager `IDLE`. Later socket events are ignored.
    /// Idempotent.
    pub fn shutdown(&self) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }

            tracing::info!(endpoint = %self.endpoint, "Shutting down feed connection");
            inner.disposed = true;
            inner.cancel_reconnect_timer();
            inner.cancel_linger_timer();
            self.registry.clear();
            feed_metrics::set_active_topics(&self.endpoint, 0);
            self.close_socket(&mut inner, &mut effects);
            self.transition(&mut inner, ConnectionState::Idle, &mut effects);
            self.pump_cancel.cancel();
        }
        self.apply(effects);

        // Listeners saw the final IDLE; release what they capture
        self.state_listeners.write().clear();
        self.give_up_listeners.write().clear();
    }

    /// Process one socket event.
    ///
    /// Sockets normally deliver events through the manager's event pump;
    /// this entry point is public so other drivers can feed events directly.
    pub fn handle_socket_event(&self, event: SocketEvent) {
        let SocketEvent { epoch, kind } = event;

        {
            let mut inner = self.inner.lock();
            if !inner.accepts(epoch) {
                inner.stale_events += 1;
                feed_metrics::record_stale_event(&self.endpoint);
                tracing::trace!(
                    endpoint = %self.endpoint,
                    event_epoch = epoch,
                    current_epoch = inner.epoch,
                    disposed = inner.disposed,
                    "Dropping stale socket event"
                );
                return;
            }
        }

        match kind {
            SocketEventKind::Opened => self.on_opened(epoch),
            SocketEventKind::Message(raw) => self.on_message(epoch, &raw),
            SocketEventKind::Closed(info) => self.on_closed(epoch, &info),
        }
    }

    // =========================================================================
    // Socket Events
    // =========================================================================

    fn on_opened(&self, epoch: Epoch) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            if !inner.accepts(epoch) || inner.state != ConnectionState::Connecting {
                return;
            }

            inner.retry.reset();
            inner.record.mark_opened();
            inner.opens += 1;
            self.transition(&mut inner, ConnectionState::Open, &mut effects);

            let topics = self.registry.active_topics();
            tracing::info!(
                endpoint = %self.endpoint,
                epoch,
                topics = topics.len(),
                "Feed connection opened; resubscribing"
            );
            for topic in &topics {
                self.send_control(&inner, ControlAction::Subscribe, topic);
            }
        }
        self.apply(effects);
    }

    fn on_message(&self, epoch: Epoch, raw: &str) {
        match self.router.route(raw) {
            RouteOutcome::Control(ServerControl::Connected { message }) => {
                let mut effects = Effects::default();
                {
                    let mut inner = self.inner.lock();
                    if inner.accepts(epoch) && inner.state == ConnectionState::Open {
                        tracing::info!(endpoint = %self.endpoint, greeting = %message, "Feed session confirmed");
                        self.transition(&mut inner, ConnectionState::Confirmed, &mut effects);
                    }
                }
                self.apply(effects);
            }
            RouteOutcome::Control(ServerControl::Error { message }) => {
                tracing::warn!(endpoint = %self.endpoint, error = %message, "Server reported error");
            }
            RouteOutcome::Control(control) => {
                tracing::debug!(endpoint = %self.endpoint, ?control, "Server acknowledgment");
            }
            RouteOutcome::Delivered(_)
            | RouteOutcome::Duplicate
            | RouteOutcome::Ignored
            | RouteOutcome::Malformed => {}
        }
    }

    fn on_closed(&self, epoch: Epoch, info: &CloseInfo) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            if !inner.accepts(epoch) {
                return;
            }

            inner.socket = None;
            inner.record.mark_closed(info.was_clean);
            inner.cancel_linger_timer();

            if info.was_clean {
                tracing::info!(
                    endpoint = %self.endpoint,
                    code = info.code,
                    reason = %info.reason,
                    "Feed connection closed"
                );
            } else {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    code = info.code,
                    reason = %info.reason,
                    "Feed connection lost"
                );
            }

            if self.registry.is_empty() {
                self.transition(&mut inner, ConnectionState::Idle, &mut effects);
            } else {
                self.schedule_reconnect(&mut inner, &mut effects);
            }
        }
        self.apply(effects);
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn on_timer(&self, kind: TimerKind, id: u64) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }

            match kind {
                TimerKind::Reconnect => {
                    if !inner.reconnect_timer.as_ref().is_some_and(|t| t.id == id) {
                        return;
                    }
                    inner.reconnect_timer = None;
                    if inner.state != ConnectionState::ReconnectWait {
                        return;
                    }
                    if self.registry.is_empty() {
                        self.transition(&mut inner, ConnectionState::Idle, &mut effects);
                    } else {
                        tracing::info!(
                            endpoint = %self.endpoint,
                            attempt = inner.retry.attempt,
                            "Reconnecting feed"
                        );
                        self.open_socket(&mut inner, &mut effects);
                    }
                }
                TimerKind::Linger => {
                    if !inner.linger_timer.as_ref().is_some_and(|t| t.id == id) {
                        return;
                    }
                    inner.linger_timer = None;
                    if self.registry.is_empty() {
                        tracing::debug!(endpoint = %self.endpoint, "Idle linger elapsed");
                        self.close_socket(&mut inner, &mut effects);
                        self.transition(&mut inner, ConnectionState::Idle, &mut effects);
                    }
                }
            }
        }
        self.apply(effects);
    }

    fn start_timer(&self, kind: TimerKind, delay: Duration) -> Timer {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let manager = self.self_ref.clone();

        self.runtime.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Some(manager) = manager.upgrade() {
                        manager.on_timer(kind, id);
                    }
                }
            }
        });

        Timer { id, cancel }
    }

    // =========================================================================
    // Transitions (called with the lock held)
    // =========================================================================

    fn transition(&self, inner: &mut Inner, next: ConnectionState, effects: &mut Effects) {
        if inner.state == next {
            return;
        }

        tracing::debug!(endpoint = %self.endpoint, from = %inner.state, to = %next, "State change");
        inner.state = next;
        if next == ConnectionState::Idle {
            // A new session starts with the full retry budget
            inner.retry.reset();
            inner.record.reset_failures();
        }
        self.state_tx.send_replace(next);
        feed_metrics::set_connection_state(&self.endpoint, next);
        effects.transitions.push(next);
    }

    fn open_socket(&self, inner: &mut Inner, effects: &mut Effects) {
        inner.cancel_reconnect_timer();
        if let Some(old) = inner.socket.take() {
            old.close();
        }

        inner.epoch += 1;
        tracing::info!(endpoint = %self.endpoint, epoch = inner.epoch, "Opening feed connection");
        inner.socket = Some(
            self.transport
                .open(&self.endpoint, inner.epoch, self.events_tx.clone()),
        );
        self.transition(inner, ConnectionState::Connecting, effects);
    }

    fn close_socket(&self, inner: &mut Inner, effects: &mut Effects) {
        if let Some(socket) = inner.socket.take() {
            self.transition(inner, ConnectionState::Closing, effects);
            socket.close();
        }
    }

    /// No topics remain: close now, or linger if configured and a socket exists.
    fn release_connection(&self, inner: &mut Inner, effects: &mut Effects) {
        inner.cancel_reconnect_timer();

        if inner.socket.is_some() && !self.idle_timeout.is_zero() {
            tracing::debug!(
                endpoint = %self.endpoint,
                linger_ms = self.idle_timeout.as_millis(),
                "No subscribers; lingering before close"
            );
            inner.cancel_linger_timer();
            inner.linger_timer = Some(self.start_timer(TimerKind::Linger, self.idle_timeout));
            return;
        }

        tracing::info!(endpoint = %self.endpoint, "No subscribers; closing feed connection");
        self.close_socket(inner, effects);
        self.transition(inner, ConnectionState::Idle, effects);
    }

    fn schedule_reconnect(&self, inner: &mut Inner, effects: &mut Effects) {
        match self.policy.next(&mut inner.retry) {
            RetryDecision::Retry(delay) => {
                let delay = self.policy.jittered(delay);
                inner.retry.next_delay = delay;
                feed_metrics::record_reconnect(&self.endpoint);
                tracing::info!(
                    endpoint = %self.endpoint,
                    attempt = inner.retry.attempt,
                    delay_ms = delay.as_millis(),
                    "Scheduling reconnect"
                );
                self.transition(inner, ConnectionState::ReconnectWait, effects);
                inner.reconnect_timer = Some(self.start_timer(TimerKind::Reconnect, delay));
            }
            RetryDecision::GiveUp => {
                feed_metrics::record_give_up(&self.endpoint);
                tracing::warn!(
                    endpoint = %self.endpoint,
                    attempts = inner.retry.attempt,
                    "Retry budget exhausted; giving up"
                );
                self.transition(inner, ConnectionState::Failed, effects);
                effects.gave_up = Some(inner.retry);
            }
        }
    }

    fn send_control(&self, inner: &Inner, action: ControlAction, topic: &str) {
        let Some(socket) = inner.socket.as_ref() else {
            return;
        };

        let request = ControlRequest {
            action,
            topic: topic.to_string(),
        };
        let json = match request.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(endpoint = %self.endpoint, error = %e, "Failed to encode control frame");
                return;
            }
        };

        match socket.send(json) {
            Ok(()) => {
                feed_metrics::record_control_frame(&self.endpoint, action);
                tracing::debug!(endpoint = %self.endpoint, ?action, topic, "Sent control frame");
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, topic, "Control frame not sent");
            }
        }
    }

    // =========================================================================
    // Notifications (called without the lock)
    // =========================================================================

    fn apply(&self, effects: Effects) {
        if !effects.transitions.is_empty() {
            let listeners: Vec<StateCallback> = self
                .state_listeners
                .read()
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            for state in effects.transitions {
                for listener in &listeners {
                    listener(state);
                }
            }
        }

        if let Some(retry) = effects.gave_up {
            let listeners: Vec<GiveUpCallback> = self
                .give_up_listeners
                .read()
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            for listener in &listeners {
                listener(retry);
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.pump_cancel.cancel();
        let inner = self.inner.get_mut();
        inner.cancel_reconnect_timer();
        inner.cancel_linger_timer();
        if let Some(socket) = inner.socket.take() {
            socket.close();
        }
    }
}

/// Forward socket events to the manager until it is shut down or dropped.
async fn run_event_pump(
    manager: Weak<ConnectionManager>,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(manager) = manager.upgrade() else { break };
                manager.handle_socket_event(event);
            }
        }
    }
    tracing::trace!("Socket event pump stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::application::ports::SocketError;

    const URL: &str = "wss://feed.example/ws";

    #[derive(Default)]
    struct Recorded {
        opens: Vec<Epoch>,
        sent: Vec<(Epoch, String)>,
        closed: Vec<Epoch>,
    }

    #[derive(Default, Clone)]
    struct FakeTransport {
        recorded: Arc<StdMutex<Recorded>>,
    }

    struct FakeSocket {
        epoch: Epoch,
        recorded: Arc<StdMutex<Recorded>>,
    }

    impl SocketHandle for FakeSocket {
        fn epoch(&self) -> Epoch {
            self.epoch
        }

        fn send(&self, text: String) -> Result<(), SocketError> {
            self.recorded.lock().unwrap().sent.push((self.epoch, text));
            Ok(())
        }

        fn close(&self) {
            self.recorded.lock().unwrap().closed.push(self.epoch);
        }
    }

    impl Transport for FakeTransport {
        fn open(&self, _url: &str, epoch: Epoch, _events: SocketEventSender) -> Box<dyn SocketHandle> {
            self.recorded.lock().unwrap().opens.push(epoch);
            Box::new(FakeSocket {
                epoch,
                recorded: Arc::clone(&self.recorded),
            })
        }
    }

    fn manager(config: ManagerConfig) -> (Arc<ConnectionManager>, FakeTransport) {
        let transport = FakeTransport::default();
        let manager = ConnectionManager::new(URL, Arc::new(transport.clone()), config);
        (manager, transport)
    }

    #[tokio::test]
    async fn rejects_empty_topic() {
        let (manager, transport) = manager(ManagerConfig::default());
        assert!(matches!(
            manager.subscribe("  ", |_| {}),
            Err(FeedError::InvalidTopic(_))
        ));
        assert!(transport.recorded.lock().unwrap().opens.is_empty());
    }

    #[tokio::test]
    async fn send_requires_live_connection() {
        let (manager, transport) = manager(ManagerConfig::default());
        assert!(matches!(manager.send("x"), Err(FeedError::NotConnected)));

        manager.subscribe("AAPL", |_| {}).unwrap();
        assert!(matches!(manager.send("x"), Err(FeedError::NotConnected)));

        manager.handle_socket_event(SocketEvent::opened(1));
        manager.send_json(&serde_json::json!({"ping": 1})).unwrap();
        let sent = &transport.recorded.lock().unwrap().sent;
        assert_eq!(sent.last().map(|(_, s)| s.as_str()), Some(r#"{"ping":1}"#));
    }

    #[tokio::test]
    async fn connected_frame_confirms_session() {
        let (manager, _transport) = manager(ManagerConfig::default());
        manager.subscribe("AAPL", |_| {}).unwrap();
        manager.handle_socket_event(SocketEvent::opened(1));
        assert_eq!(manager.state(), ConnectionState::Open);

        manager.handle_socket_event(SocketEvent::message(
            1,
            r#"{"type":"connected","message":"welcome"}"#,
        ));
        assert_eq!(manager.state(), ConnectionState::Confirmed);
    }

    #[tokio::test]
    async fn subscribe_while_open_sends_frame_for_new_topics_only() {
        let (manager, transport) = manager(ManagerConfig::default());
        manager.subscribe("AAPL", |_| {}).unwrap();
        manager.handle_socket_event(SocketEvent::opened(1));

        manager.subscribe("MSFT", |_| {}).unwrap();
        manager.subscribe("MSFT", |_| {}).unwrap();

        let recorded = transport.recorded.lock().unwrap();
        let frames: Vec<&str> = recorded.sent.iter().map(|(_, s)| s.as_str()).collect();
        assert_eq!(
            frames,
            vec![
                r#"{"action":"subscribe","topic":"AAPL"}"#,
                r#"{"action":"subscribe","topic":"MSFT"}"#,
            ]
        );
        assert_eq!(recorded.opens, vec![1]);
    }

    #[tokio::test]
    async fn last_unsubscribe_sends_frame_and_closes() {
        let (manager, transport) = manager(ManagerConfig::default());
        let handle = manager.subscribe("AAPL", |_| {}).unwrap();
        manager.handle_socket_event(SocketEvent::opened(1));

        manager.unsubscribe(&handle);
        // Second call is a no-op
        manager.unsubscribe(&handle);

        let recorded = transport.recorded.lock().unwrap();
        assert_eq!(
            recorded.sent.last().map(|(_, s)| s.as_str()),
            Some(r#"{"action":"unsubscribe","topic":"AAPL"}"#)
        );
        assert_eq!(recorded.closed, vec![1]);
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn finite_budget_gives_up_once() {
        let config = ManagerConfig {
            reconnect: ReconnectConfig::fixed(Duration::from_millis(100)).with_max_attempts(1),
            ..ManagerConfig::default()
        };
        let (manager, transport) = manager(config);
        let gave_up = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&gave_up);
        let _give_up = manager.on_give_up(move |retry| sink.lock().unwrap().push(retry.attempt));

        manager.subscribe("AAPL", |_| {}).unwrap();
        manager.handle_socket_event(SocketEvent::closed(1, CloseInfo::abnormal("reset")));
        assert_eq!(manager.state(), ConnectionState::ReconnectWait);

        tokio::time::sleep(Duration::from_millis(101)).await;
        assert_eq!(transport.recorded.lock().unwrap().opens, vec![1, 2]);

        manager.handle_socket_event(SocketEvent::closed(2, CloseInfo::abnormal("reset")));
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert_eq!(*gave_up.lock().unwrap(), vec![2]);

        // Interest is recorded but no reconnect happens
        manager.subscribe("MSFT", |_| {}).unwrap();
        assert_eq!(transport.recorded.lock().unwrap().opens, vec![1, 2]);

        manager.retry_now().unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.retry_state().attempt, 0);
        assert_eq!(transport.recorded.lock().unwrap().opens, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_linger_keeps_socket_for_returning_subscriber() {
        let config = ManagerConfig {
            idle_timeout: Duration::from_millis(500),
            ..ManagerConfig::default()
        };
        let (manager, transport) = manager(config);
        let handle = manager.subscribe("AAPL", |_| {}).unwrap();
        manager.handle_socket_event(SocketEvent::opened(1));

        manager.unsubscribe(&handle);
        assert_eq!(manager.state(), ConnectionState::Open);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let handle = manager.subscribe("AAPL", |_| {}).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.state(), ConnectionState::Open);
        assert!(transport.recorded.lock().unwrap().closed.is_empty());

        manager.unsubscribe(&handle);
        tokio::time::sleep(Duration::from_millis(501)).await;
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(transport.recorded.lock().unwrap().closed, vec![1]);
    }

    #[tokio::test]
    async fn state_listeners_see_every_transition() {
        let (manager, _transport) = manager(ManagerConfig::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _listener = manager.on_state_change(move |state| sink.lock().unwrap().push(state));
        let mut watch = manager.state_changes();

        let handle = manager.subscribe("AAPL", |_| {}).unwrap();
        manager.handle_socket_event(SocketEvent::opened(1));
        manager.unsubscribe(&handle);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Open,
                ConnectionState::Closing,
                ConnectionState::Idle,
            ]
        );
        assert!(watch.has_changed().unwrap());
        assert_eq!(*watch.borrow_and_update(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn removed_listener_stops_firing() {
        let (manager, _transport) = manager(ManagerConfig::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = manager.on_state_change(move |state| sink.lock().unwrap().push(state));

        let handle = manager.subscribe("AAPL", |_| {}).unwrap();
        assert!(manager.remove_listener(listener));
        assert!(!manager.remove_listener(listener));
        manager.handle_socket_event(SocketEvent::opened(1));
        manager.unsubscribe(&handle);

        assert_eq!(*seen.lock().unwrap(), vec![ConnectionState::Connecting]);
        // The callback and its captures are gone
        assert_eq!(Arc::strong_count(&seen), 1);
    }

    #[tokio::test]
    async fn shutdown_releases_listeners() {
        let (manager, _transport) = manager(ManagerConfig::default());
        let captured = Arc::new(());
        let state_capture = Arc::clone(&captured);
        let give_up_capture = Arc::clone(&captured);
        let state_listener = manager.on_state_change(move |_| {
            let _ = &state_capture;
        });
        let _give_up = manager.on_give_up(move |_| {
            let _ = &give_up_capture;
        });
        assert_eq!(Arc::strong_count(&captured), 3);

        manager.shutdown();

        assert_eq!(Arc::strong_count(&captured), 1);
        assert!(!manager.remove_listener(state_listener));

        // Registering after shutdown keeps nothing alive
        let late_capture = Arc::clone(&captured);
        let _late = manager.on_state_change(move |_| {
            let _ = &late_capture;
        });
        assert_eq!(Arc::strong_count(&captured), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_restores_retry_budget() {
        let config = ManagerConfig {
            reconnect: ReconnectConfig::fixed(Duration::from_millis(100)).with_max_attempts(1),
            ..ManagerConfig::default()
        };
        let (manager, transport) = manager(config);
        let handle = manager.subscribe("AAPL", |_| {}).unwrap();
        manager.handle_socket_event(SocketEvent::closed(1, CloseInfo::abnormal("reset")));
        tokio::time::sleep(Duration::from_millis(101)).await;
        manager.handle_socket_event(SocketEvent::closed(2, CloseInfo::abnormal("reset")));
        assert_eq!(manager.state(), ConnectionState::Failed);

        manager.unsubscribe(&handle);
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(manager.retry_state().attempt, 0);
        assert_eq!(manager.stats().consecutive_failures, 0);

        manager.subscribe("AAPL", |_| {}).unwrap();
        assert_eq!(transport.recorded.lock().unwrap().opens, vec![1, 2, 3]);
        manager.handle_socket_event(SocketEvent::closed(3, CloseInfo::abnormal("reset")));
        assert_eq!(manager.state(), ConnectionState::ReconnectWait);
        assert_eq!(manager.retry_state().attempt, 1);
    }

    #[tokio::test]
    async fn callbacks_may_unsubscribe_during_dispatch() {
        let (manager, _transport) = manager(ManagerConfig::default());
        let slot: Arc<StdMutex<Option<SubscriptionHandle>>> = Arc::new(StdMutex::new(None));
        let weak = Arc::downgrade(&manager);
        let inner_slot = Arc::clone(&slot);

        let handle = manager
            .subscribe("AAPL", move |_| {
                if let (Some(manager), Some(handle)) =
                    (weak.upgrade(), inner_slot.lock().unwrap().take())
                {
                    manager.unsubscribe(&handle);
                }
            })
            .unwrap();
        *slot.lock().unwrap() = Some(handle);

        manager.handle_socket_event(SocketEvent::opened(1));
        manager.handle_socket_event(SocketEvent::message(1, r#"{"symbol":"AAPL","price":1}"#));

        assert!(manager.active_topics().is_empty());
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn events_flow_through_pump() {
        let (manager, _transport) = manager(ManagerConfig::default());
        let mut watch = manager.state_changes();
        manager.subscribe("AAPL", |_| {}).unwrap();

        manager.events_tx.send(SocketEvent::opened(1)).unwrap();
        watch
            .wait_for(|state| *state == ConnectionState::Open)
            .await
            .unwrap();
        assert_eq!(manager.stats().opens, 1);
    }

    #[tokio::test]
    async fn operations_after_shutdown_are_rejected() {
        let (manager, _transport) = manager(ManagerConfig::default());
        manager.shutdown();

        assert!(manager.is_disposed());
        assert!(matches!(
            manager.subscribe("AAPL", |_| {}),
            Err(FeedError::Disposed)
        ));
        assert!(matches!(manager.send("x"), Err(FeedError::Disposed)));
        assert!(matches!(manager.retry_now(), Err(FeedError::Disposed)));
    }
}
