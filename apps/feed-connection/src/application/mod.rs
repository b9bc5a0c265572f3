//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the connection manager, the message router and the
//! endpoint registry, plus the port interfaces the transport implements.

mod error;

/// Port interfaces for the feed transport.
pub mod ports;

/// Application services: routing, connection management, endpoint registry.
pub mod services;

pub use error::FeedError;
