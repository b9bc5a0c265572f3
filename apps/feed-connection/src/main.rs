//! Feed Connection Binary
//!
//! Connects to one push-data feed, subscribes to the configured topics and
//! logs every message it receives.
//!
//! # Usage
//!
//! ```bash
//! WS_URL=wss://feed.example/ws cargo run --bin feed-connection
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `WS_URL`: Feed WebSocket endpoint
//!
//! ## Optional
//! - `FEED_TOPICS`: Comma-separated topics (default: news)
//! - `FEED_RECONNECT_DELAY_MS`, `FEED_RECONNECT_MAX_DELAY_MS`, `FEED_RECONNECT_MULTIPLIER`,
//!   `FEED_RECONNECT_JITTER`, `FEED_MAX_RECONNECT_ATTEMPTS`: Reconnect policy
//! - `FEED_OPEN_TIMEOUT_SECS`, `FEED_HEARTBEAT_INTERVAL_SECS`, `FEED_HEARTBEAT_TIMEOUT_SECS`
//! - `FEED_IDLE_TIMEOUT_MS`, `FEED_DEDUP_WINDOW`, `FEED_INFER_NEWS_FRAMES`
//! - `FEED_HEALTH_PORT`: Health check HTTP port (default: 8083, 0 disables)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: cream-feed-connection)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use feed_connection::infrastructure::health::{HealthServer, HealthServerState};
use feed_connection::infrastructure::telemetry;
use feed_connection::{
    FeedConfig, FeedRegistry, FeedSubscription, Payload, WebSocketTransport, init_metrics,
};
use futures_util::StreamExt;
use futures_util::stream::SelectAll;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let provider_installed = rustls::crypto::ring::default_provider()
        .install_default()
        .is_ok();

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting feed connection");
    if !provider_installed {
        tracing::debug!("rustls crypto provider was already installed");
    }

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = FeedConfig::from_env().context("loading feed configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let transport = Arc::new(WebSocketTransport::new(config.websocket.clone()));
    let registry = FeedRegistry::new(transport, config.manager_config());
    let feed = registry.connect(&config.url);

    // Both live until shutdown_all clears them
    let _state_listener = feed.on_state_change(|state| {
        tracing::info!(state = %state, "Feed state changed");
    });
    let _give_up_listener = feed.on_give_up(|retry| {
        tracing::error!(
            attempts = retry.attempt,
            "Feed retry budget exhausted; connection stays down"
        );
    });

    let mut streams = SelectAll::new();
    for topic in &config.topics {
        let subscription = FeedSubscription::from_handle(&feed, topic)
            .with_context(|| format!("subscribing to topic {topic}"))?;
        streams.push(subscription);
    }
    let consumer = tokio::spawn(log_messages(streams));

    if config.server.health_port == 0 {
        tracing::info!("Health server disabled");
    } else {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            Arc::clone(&registry),
        ));
        let health_server = HealthServer::new(
            config.server.health_port,
            health_state,
            shutdown_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    tracing::info!("Feed connection ready");

    await_shutdown(shutdown_token)
        .await
        .context("installing signal handlers")?;

    registry.shutdown_all();
    drop(feed);

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, consumer).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Message consumer did not stop in time"
        );
    }

    tracing::info!("Feed connection stopped");
    Ok(())
}

/// Log every message from the merged topic streams until they end.
async fn log_messages(mut messages: SelectAll<FeedSubscription>) {
    while let Some(message) = messages.next().await {
        let topic = message.topic.as_deref().unwrap_or_default();
        match &message.payload {
            Payload::News(item) => {
                tracing::info!(topic, id = %item.id, title = %item.title, source = %item.source, "News");
            }
            Payload::Quote(quote) => {
                tracing::info!(topic, symbol = %quote.symbol, price = %quote.price, "Quote");
            }
            Payload::Raw(value) => {
                tracing::info!(topic, payload = %value, "Data");
            }
        }
    }
    tracing::debug!("All topic streams ended");
}

/// Log the parsed configuration.
fn log_config(config: &FeedConfig) {
    tracing::info!(
        url = %config.url,
        topics = ?config.topics,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        reconnect_delay_ms = config.reconnect.base_delay.as_millis(),
        max_attempts = config.reconnect.max_attempts,
        open_timeout_secs = config.websocket.open_timeout.as_secs(),
        heartbeat_interval_secs = config.websocket.heartbeat_interval.as_secs(),
        idle_timeout_ms = config.feed.idle_timeout.as_millis(),
        "Connection settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                tracing::info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C, initiating shutdown");
    }

    shutdown_token.cancel();
    Ok(())
}
