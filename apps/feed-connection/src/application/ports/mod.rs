//! Port Interfaces
//!
//! Contracts between the connection manager and the transport that carries
//! the feed, following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Transport`]: opens one physical connection per call
//! - [`SocketHandle`]: raw send/close on an opened connection
//!
//! Sockets report back through an unbounded channel of [`SocketEvent`]s.
//! Every event carries the [`Epoch`] the socket was opened with, so the
//! manager can discard events from sockets it has already replaced. A socket
//! never reconnects on its own.

use tokio::sync::mpsc;

use crate::domain::connection::Epoch;

// =============================================================================
// Events
// =============================================================================

/// How a socket closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close code (1006 for abnormal closure without a close frame).
    pub code: u16,
    /// Close reason.
    pub reason: String,
    /// Whether the close handshake completed.
    pub was_clean: bool,
}

impl CloseInfo {
    /// Close code for connections lost without a close frame.
    pub const ABNORMAL: u16 = 1006;

    /// Abnormal close with a reason.
    #[must_use]
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: Self::ABNORMAL,
            reason: reason.into(),
            was_clean: false,
        }
    }

    /// Clean close with the given code.
    #[must_use]
    pub fn clean(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean: true,
        }
    }
}

/// What happened on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEventKind {
    /// Transport connection established.
    Opened,
    /// Raw text frame received.
    Message(String),
    /// Connection ended. Emitted at most once per socket.
    Closed(CloseInfo),
}

/// Event emitted by a socket to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEvent {
    /// Epoch of the socket that produced the event.
    pub epoch: Epoch,
    /// Event payload.
    pub kind: SocketEventKind,
}

impl SocketEvent {
    /// `opened` event.
    #[must_use]
    pub const fn opened(epoch: Epoch) -> Self {
        Self {
            epoch,
            kind: SocketEventKind::Opened,
        }
    }

    /// `message` event.
    #[must_use]
    pub fn message(epoch: Epoch, raw: impl Into<String>) -> Self {
        Self {
            epoch,
            kind: SocketEventKind::Message(raw.into()),
        }
    }

    /// `closed` event.
    #[must_use]
    pub const fn closed(epoch: Epoch, info: CloseInfo) -> Self {
        Self {
            epoch,
            kind: SocketEventKind::Closed(info),
        }
    }
}

/// Sender half sockets report events through.
pub type SocketEventSender = mpsc::UnboundedSender<SocketEvent>;

// =============================================================================
// Errors
// =============================================================================

/// Socket-level errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
    /// The socket is not open.
    #[error("socket is not connected")]
    NotConnected,
}

// =============================================================================
// Ports
// =============================================================================

/// Handle to one physical connection.
pub trait SocketHandle: Send + Sync {
    /// Epoch the socket was opened with.
    fn epoch(&self) -> Epoch;

    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotConnected`] if the socket has not opened yet
    /// or has already closed. Nothing is sent in that case.
    fn send(&self, text: String) -> Result<(), SocketError>;

    /// Begin tearing the connection down. Idempotent.
    fn close(&self);
}

/// Factory for physical connections.
pub trait Transport: Send + Sync {
    /// Start opening a connection to `url`.
    ///
    /// Must not block: the connect runs in the background and its outcome is
    /// reported as an `opened` or `closed` event on `events`, tagged with
    /// `epoch`. Each call establishes at most one connection.
    fn open(&self, url: &str, epoch: Epoch, events: SocketEventSender) -> Box<dyn SocketHandle>;
}
