//! Prometheus Metrics Module
//!
//! Exposes feed connection metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Frames received, messages delivered, decode errors, duplicates
//! - **Connections**: Connection state per endpoint, reconnects, give-ups
//! - **Subscriptions**: Active topics per endpoint, control frames sent
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op, so library code records freely.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionState;
use crate::domain::streaming::ControlAction;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Frame counters
    describe_counter!(
        "feed_connection_frames_received_total",
        "Total text frames received from the feed"
    );
    describe_counter!(
        "feed_connection_messages_delivered_total",
        "Total messages handed to subscriber callbacks"
    );
    describe_counter!(
        "feed_connection_decode_errors_total",
        "Total frames dropped because they failed to decode"
    );
    describe_counter!(
        "feed_connection_duplicates_total",
        "Total news items suppressed as duplicates"
    );

    // Connection lifecycle
    describe_gauge!(
        "feed_connection_state",
        "Connection state (0=idle 1=connecting 2=open 3=confirmed 4=closing 5=reconnect_wait 6=failed)"
    );
    describe_counter!(
        "feed_connection_reconnects_total",
        "Total reconnect attempts scheduled"
    );
    describe_counter!(
        "feed_connection_give_ups_total",
        "Total times the retry budget was exhausted"
    );
    describe_counter!(
        "feed_connection_stale_events_total",
        "Total socket events dropped because they came from a replaced socket"
    );

    // Subscriptions
    describe_gauge!(
        "feed_connection_active_topics",
        "Topics with at least one local subscriber"
    );
    describe_counter!(
        "feed_connection_control_frames_total",
        "Total subscribe/unsubscribe frames sent"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

const fn action_label(action: ControlAction) -> &'static str {
    match action {
        ControlAction::Subscribe => "subscribe",
        ControlAction::Unsubscribe => "unsubscribe",
    }
}

/// Record a text frame received on an endpoint.
pub fn record_frame_received(endpoint: &str) {
    counter!(
        "feed_connection_frames_received_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record messages handed to subscribers.
pub fn record_messages_delivered(endpoint: &str, count: u64) {
    counter!(
        "feed_connection_messages_delivered_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(count);
}

/// Record a frame that failed to decode.
pub fn record_decode_error(endpoint: &str) {
    counter!(
        "feed_connection_decode_errors_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record a suppressed duplicate news item.
pub fn record_duplicate(endpoint: &str) {
    counter!(
        "feed_connection_duplicates_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(endpoint: &str, state: ConnectionState) {
    gauge!(
        "feed_connection_state",
        "endpoint" => endpoint.to_string()
    )
    .set(state.as_gauge());
}

/// Record a scheduled reconnect attempt.
pub fn record_reconnect(endpoint: &str) {
    counter!(
        "feed_connection_reconnects_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record an exhausted retry budget.
pub fn record_give_up(endpoint: &str) {
    counter!(
        "feed_connection_give_ups_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record a dropped stale socket event.
pub fn record_stale_event(endpoint: &str) {
    counter!(
        "feed_connection_stale_events_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Update the active topic count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_topics(endpoint: &str, count: usize) {
    gauge!(
        "feed_connection_active_topics",
        "endpoint" => endpoint.to_string()
    )
    .set(count as f64);
}

/// Record a control frame sent to the server.
pub fn record_control_frame(endpoint: &str, action: ControlAction) {
    counter!(
        "feed_connection_control_frames_total",
        "endpoint" => endpoint.to_string(),
        "action" => action_label(action)
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
