#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Feed Connection - Push Data Connection Manager
//!
//! Maintains one resilient WebSocket connection per feed endpoint and
//! multiplexes topic subscriptions from many in-process consumers over it.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core feed logic and data types
//!   - `connection`: Connection state vocabulary and record
//!   - `reconnect`: Retry decision policy
//!   - `streaming`: Frame decoding and message types
//!   - `subscription`: Reference-counted topic registry
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport and socket interfaces, socket events
//!   - `services`: Connection manager, message router, feed registry
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `websocket`: `tokio-tungstenite` transport with heartbeat
//!   - `channel`: `Stream` adapter over subscriptions
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics`, `telemetry`: Prometheus and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//!                    ┌──────────────────────────────────────┐
//! Feed WS ─frames──► │ ConnectionManager ─► MessageRouter ──┼──► topic callbacks
//!         ◄─control─ │  (epoch, retry)      (decode, dedup) │──► FeedSubscription streams
//!                    └──────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core feed types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionState, Epoch};
pub use domain::reconnect::{ReconnectConfig, ReconnectPolicy, RetryDecision, RetryState};
pub use domain::streaming::{
    ControlAction, ControlRequest, InboundMessage, MessageKind, NEWS_TOPIC, NewsItem, Payload,
    QuoteTick, Sentiment, Topic,
};

// Application
pub use application::FeedError;
pub use application::ports::{CloseInfo, SocketEvent, SocketEventKind, SocketHandle, Transport};
pub use application::services::{
    ConnectionHandle, ConnectionManager, FeedRegistry, FeedSnapshot, ListenerId, ManagerConfig,
    ManagerStats, SubscriptionHandle,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, FeedConfig, FeedSettings, ServerSettings, WebSocketSettings,
};

// Adapters
pub use infrastructure::channel::FeedSubscription;
pub use infrastructure::websocket::WebSocketTransport;

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
