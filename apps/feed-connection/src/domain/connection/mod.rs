//! Connection State
//!
//! Vocabulary for the per-endpoint connection state machine:
//!
//! ```text
//! IDLE ──subscribe──► CONNECTING ──opened──► OPEN ──"connected"──► CONFIRMED
//!   ▲                     ▲                    │                       │
//!   │                     │                closed(any)             closed(any)
//!   │                timer fires               ▼                       │
//!   │                     └────────── RECONNECT_WAIT ◄─────────────────┘
//!   │                                          │
//!   └─── last unsubscribe / shutdown ──────────┤ retry budget exhausted
//!                                              ▼
//!                                            FAILED
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Monotonic connection generation.
///
/// Incremented on every socket open. Socket events carry the epoch of the
/// socket that produced them so late events from a replaced socket can be
/// recognised and dropped.
pub type Epoch = u64;

/// Observable state of a feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No subscribers and no socket.
    #[default]
    Idle,
    /// A socket open is in flight.
    Connecting,
    /// Transport is open; subscriptions have been replayed.
    Open,
    /// Server acknowledged the session with a `connected` control frame.
    Confirmed,
    /// The socket is being torn down on purpose.
    Closing,
    /// Waiting for the reconnect timer after a connection loss.
    ReconnectWait,
    /// Retry budget exhausted; only a manual retry leaves this state.
    Failed,
}

impl ConnectionState {
    /// Whether the feed is currently delivering data.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Open | Self::Confirmed)
    }

    /// Whether a socket is expected to exist in this state.
    #[must_use]
    pub const fn has_socket(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Confirmed)
    }

    /// Stable lowercase name for logs, metrics and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Confirmed => "confirmed",
            Self::Closing => "closing",
            Self::ReconnectWait => "reconnect_wait",
            Self::Failed => "failed",
        }
    }

    /// Numeric encoding used for the state gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Idle => 0.0,
            Self::Connecting => 1.0,
            Self::Open => 2.0,
            Self::Confirmed => 3.0,
            Self::Closing => 4.0,
            Self::ReconnectWait => 5.0,
            Self::Failed => 6.0,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for the single connection owned by a manager.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRecord {
    /// Endpoint URL identifying the connection.
    pub endpoint: String,
    /// When the current or most recent socket reached OPEN.
    pub last_opened_at: Option<DateTime<Utc>>,
    /// Abnormal closes since the last successful open.
    pub consecutive_failures: u32,
}

impl ConnectionRecord {
    /// Create a record for an endpoint that has never been opened.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            last_opened_at: None,
            consecutive_failures: 0,
        }
    }

    /// Record a successful open.
    pub fn mark_opened(&mut self) {
        self.last_opened_at = Some(Utc::now());
        self.consecutive_failures = 0;
    }

    /// Forget past failures when a new session starts.
    pub const fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record a close; only abnormal closes count as failures.
    pub const fn mark_closed(&mut self, was_clean: bool) {
        if !was_clean {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_states() {
        assert!(ConnectionState::Open.is_live());
        assert!(ConnectionState::Confirmed.is_live());
        assert!(!ConnectionState::Connecting.is_live());
        assert!(!ConnectionState::ReconnectWait.is_live());
        assert!(!ConnectionState::Idle.is_live());
        assert!(!ConnectionState::Failed.is_live());
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::ReconnectWait).unwrap(),
            "\"reconnect_wait\""
        );
        assert_eq!(ConnectionState::ReconnectWait.to_string(), "reconnect_wait");
    }

    #[test]
    fn record_counts_only_abnormal_closes() {
        let mut record = ConnectionRecord::new("wss://feed.example/ws");
        record.mark_closed(true);
        assert_eq!(record.consecutive_failures, 0);

        record.mark_closed(false);
        record.mark_closed(false);
        assert_eq!(record.consecutive_failures, 2);

        record.mark_opened();
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.last_opened_at.is_some());
    }

    #[test]
    fn reset_failures_keeps_last_open() {
        let mut record = ConnectionRecord::new("wss://feed.example/ws");
        record.mark_opened();
        record.mark_closed(false);

        record.reset_failures();
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.last_opened_at.is_some());
    }
}
