//! Domain Layer - Core feed types and pure logic.
//!
//! This layer holds the wire-level frame model, the connection state
//! machine vocabulary, the reconnect decision and the reference-counted
//! subscription registry. Nothing here performs I/O.

/// Connection state vocabulary and per-endpoint connection record.
pub mod connection;

/// Reconnection decision policy and retry bookkeeping.
pub mod reconnect;

/// Inbound/outbound frame types and frame decoding.
pub mod streaming;

/// Reference-counted topic subscription registry.
pub mod subscription;
