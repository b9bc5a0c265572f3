//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, feed status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status with per-endpoint feed statistics
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (every feed live)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{FeedRegistry, FeedSnapshot};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// One entry per registered endpoint.
    pub feeds: Vec<FeedSnapshot>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every feed is live.
    Healthy,
    /// Some feeds are live, or none are registered.
    Degraded,
    /// Feeds are registered but none is live.
    Unhealthy,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    registry: Arc<FeedRegistry>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, registry: Arc<FeedRegistry>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            registry,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Build the health router.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let feeds = state.registry.snapshots();
    let is_ready = !feeds.is_empty() && feeds.iter().all(|feed| feed.stats.state.is_live());

    if is_ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let feeds = state.registry.snapshots();

    HealthResponse {
        status: determine_health_status(&feeds),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        feeds,
    }
}

fn determine_health_status(feeds: &[FeedSnapshot]) -> HealthStatus {
    if feeds.is_empty() {
        return HealthStatus::Degraded;
    }

    let live = feeds.iter().filter(|feed| feed.stats.state.is_live()).count();
    match live {
        0 => HealthStatus::Unhealthy,
        n if n == feeds.len() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{
        SocketError, SocketEvent, SocketEventSender, SocketHandle, Transport,
    };
    use crate::application::services::{ManagerConfig, ManagerStats};
    use crate::domain::connection::{ConnectionState, Epoch};

    struct SilentSocket(Epoch);

    impl SocketHandle for SilentSocket {
        fn epoch(&self) -> Epoch {
            self.0
        }

        fn send(&self, _text: String) -> Result<(), SocketError> {
            Ok(())
        }

        fn close(&self) {}
    }

    struct SilentTransport;

    impl Transport for SilentTransport {
        fn open(&self, _url: &str, epoch: Epoch, _events: SocketEventSender) -> Box<dyn SocketHandle> {
            Box::new(SilentSocket(epoch))
        }
    }

    fn registry() -> Arc<FeedRegistry> {
        FeedRegistry::new(Arc::new(SilentTransport), ManagerConfig::default())
    }

    fn snapshot(state: ConnectionState) -> FeedSnapshot {
        FeedSnapshot {
            endpoint: "wss://feed.example/ws".to_string(),
            handles: 1,
            stats: ManagerStats {
                state,
                epoch: 1,
                opens: 0,
                stale_events: 0,
                active_topics: 1,
                retry_attempt: 0,
                consecutive_failures: 0,
                frames_received: 0,
                messages_delivered: 0,
                decode_errors: 0,
                duplicates: 0,
            },
        }
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn determine_status_from_feed_states() {
        assert_eq!(determine_health_status(&[]), HealthStatus::Degraded);
        assert_eq!(
            determine_health_status(&[snapshot(ConnectionState::Confirmed)]),
            HealthStatus::Healthy
        );
        assert_eq!(
            determine_health_status(&[
                snapshot(ConnectionState::Open),
                snapshot(ConnectionState::ReconnectWait),
            ]),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(&[snapshot(ConnectionState::Failed)]),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let app = router(Arc::new(HealthServerState::new("test".into(), registry())));
        let (status, body) = get(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn readiness_follows_feed_state() {
        let registry = registry();
        let state = Arc::new(HealthServerState::new("test".into(), Arc::clone(&registry)));

        let (status, _) = get(router(Arc::clone(&state)), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let handle = registry.connect("wss://feed.example/ws");
        let _sub = handle.subscribe("news", |_| {}).unwrap();
        let (status, _) = get(router(Arc::clone(&state)), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        handle.manager().handle_socket_event(SocketEvent::opened(1));
        let (status, body) = get(router(state), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "READY");
    }

    #[tokio::test]
    async fn health_reports_each_endpoint() {
        let registry = registry();
        let handle = registry.connect("wss://feed.example/ws");
        let _sub = handle.subscribe("AAPL", |_| {}).unwrap();
        handle.manager().handle_socket_event(SocketEvent::opened(1));

        let app = router(Arc::new(HealthServerState::new("1.2.3".into(), registry)));
        let (status, body) = get(app, "/health").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["version"], "1.2.3");
        assert_eq!(json["feeds"][0]["endpoint"], "wss://feed.example/ws");
        assert_eq!(json["feeds"][0]["stats"]["state"], "open");
        assert_eq!(json["feeds"][0]["stats"]["active_topics"], 1);
    }
}
