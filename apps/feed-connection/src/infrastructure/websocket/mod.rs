//! WebSocket Transport
//!
//! `tokio-tungstenite` implementation of the [`Transport`] port, with a
//! ping/pong heartbeat to detect half-open connections.
//!
//! [`Transport`]: crate::application::ports::Transport

mod heartbeat;
mod socket;

pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
pub use socket::{WebSocketSocket, WebSocketTransport};
