//! Feed Configuration Settings
//!
//! Configuration types for the feed connection, loaded from environment
//! variables. Unparseable values fall back to their defaults.

use std::time::Duration;

use crate::application::services::ManagerConfig;
use crate::domain::reconnect::{DEFAULT_RECONNECT_DELAY, ReconnectConfig};
use crate::domain::streaming::NEWS_TOPIC;

/// WebSocket transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketSettings {
    /// Time allowed for the connect and handshake.
    pub open_timeout: Duration,
    /// Ping interval (zero disables heartbeats).
    pub heartbeat_interval: Duration,
    /// Silence tolerated before the connection is considered dead.
    pub heartbeat_timeout: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

/// Message handling settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSettings {
    /// Linger before closing an unused connection (zero = close at once).
    pub idle_timeout: Duration,
    /// Recent news ids remembered for duplicate suppression (0 = off).
    pub dedup_window: usize,
    /// Treat untyped `id` + `title` frames as news.
    pub infer_news: bool,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::ZERO,
            dedup_window: 256,
            infer_news: true,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete feed configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    /// Feed endpoint URL.
    pub url: String,
    /// Topics the service subscribes to.
    pub topics: Vec<String>,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
    /// WebSocket transport settings.
    pub websocket: WebSocketSettings,
    /// Message handling settings.
    pub feed: FeedSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl FeedConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `WS_URL` is missing, empty, or not a WebSocket URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `WS_URL` is missing, empty, or not a WebSocket URL.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("WS_URL").ok_or_else(|| ConfigError::MissingEnvVar("WS_URL".to_string()))?;
        let url = url.trim().to_string();

        if url.is_empty() {
            return Err(ConfigError::EmptyValue("WS_URL".to_string()));
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                key: "WS_URL".to_string(),
                value: url,
            });
        }

        let topics = lookup("FEED_TOPICS")
            .map(|raw| parse_topics(&raw))
            .filter(|topics| !topics.is_empty())
            .unwrap_or_else(|| vec![NEWS_TOPIC.to_string()]);

        let reconnect_defaults = ReconnectConfig::default();
        let reconnect = ReconnectConfig {
            base_delay: parse_duration_millis(&lookup, "FEED_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY),
            max_delay: parse_duration_millis(
                &lookup,
                "FEED_RECONNECT_MAX_DELAY_MS",
                reconnect_defaults.max_delay,
            ),
            multiplier: parse_f64(
                &lookup,
                "FEED_RECONNECT_MULTIPLIER",
                reconnect_defaults.multiplier,
            )
            .max(1.0),
            jitter_factor: parse_f64(&lookup, "FEED_RECONNECT_JITTER", reconnect_defaults.jitter_factor)
                .clamp(0.0, 1.0),
            max_attempts: parse_u32(
                &lookup,
                "FEED_MAX_RECONNECT_ATTEMPTS",
                reconnect_defaults.max_attempts,
            ),
        };

        let websocket_defaults = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            open_timeout: parse_duration_secs(
                &lookup,
                "FEED_OPEN_TIMEOUT_SECS",
                websocket_defaults.open_timeout,
            ),
            heartbeat_interval: parse_duration_secs(
                &lookup,
                "FEED_HEARTBEAT_INTERVAL_SECS",
                websocket_defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_duration_secs(
                &lookup,
                "FEED_HEARTBEAT_TIMEOUT_SECS",
                websocket_defaults.heartbeat_timeout,
            ),
        };

        let feed_defaults = FeedSettings::default();
        let feed = FeedSettings {
            idle_timeout: parse_duration_millis(&lookup, "FEED_IDLE_TIMEOUT_MS", feed_defaults.idle_timeout),
            dedup_window: parse_usize(&lookup, "FEED_DEDUP_WINDOW", feed_defaults.dedup_window),
            infer_news: parse_bool(&lookup, "FEED_INFER_NEWS_FRAMES", feed_defaults.infer_news),
        };

        let server = ServerSettings {
            health_port: parse_u16(
                &lookup,
                "FEED_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        Ok(Self {
            url,
            topics,
            reconnect,
            websocket,
            feed,
            server,
        })
    }

    /// Manager configuration derived from these settings.
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            reconnect: self.reconnect.clone(),
            idle_timeout: self.feed.idle_timeout,
            dedup_window: self.feed.dedup_window,
            infer_news: self.feed.infer_news,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Rejected value.
        value: String,
    },
}

fn parse_topics(raw: &str) -> Vec<String> {
    let mut topics: Vec<String> = Vec::new();
    for topic in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !topics.iter().any(|t| t == topic) {
            topics.push(topic.to_string());
        }
    }
    topics
}

fn parse_u16(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u16) -> u16 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_u32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_f64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> f64 {
    lookup(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .and_then(|v| match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn parse_duration_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
