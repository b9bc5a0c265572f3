//! Configuration Module
//!
//! Configuration loading for the feed connection service.

mod settings;

pub use settings::{ConfigError, FeedConfig, FeedSettings, ServerSettings, WebSocketSettings};
