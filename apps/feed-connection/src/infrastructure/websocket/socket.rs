//! WebSocket Socket
//!
//! One physical WebSocket connection per [`Transport::open`] call. The
//! socket task connects (bounded by the open timeout), reports `opened`,
//! then pumps outbound text, heartbeats and inbound frames until either
//! side closes. Exactly one `closed` event is reported per socket, and the
//! socket never reconnects by itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
use crate::application::ports::{
    CloseInfo, SocketError, SocketEvent, SocketEventSender, SocketHandle, Transport,
};
use crate::domain::connection::Epoch;
use crate::infrastructure::config::WebSocketSettings;

/// Close code reported when the server closes without a status.
const NO_STATUS: u16 = 1005;

/// Upper bound on flushing queued frames and the close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Transport
// =============================================================================

/// [`Transport`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    settings: WebSocketSettings,
    runtime: Handle,
}

impl WebSocketTransport {
    /// Create a transport with the given settings.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(settings: WebSocketSettings) -> Self {
        Self {
            settings,
            runtime: Handle::current(),
        }
    }

    /// Transport settings.
    #[must_use]
    pub const fn settings(&self) -> &WebSocketSettings {
        &self.settings
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &str, epoch: Epoch, events: SocketEventSender) -> Box<dyn SocketHandle> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let open = Arc::new(AtomicBool::new(false));

        let task = SocketTask {
            url: url.to_string(),
            epoch,
            settings: self.settings.clone(),
            events,
            outbound: outbound_rx,
            cancel: cancel.clone(),
            open: Arc::clone(&open),
        };
        self.runtime.spawn(task.run());

        Box::new(WebSocketSocket {
            epoch,
            outbound: outbound_tx,
            cancel,
            open,
        })
    }
}

// =============================================================================
// Socket Handle
// =============================================================================

/// Handle to a running socket task.
///
/// Dropping the handle closes the socket.
#[derive(Debug)]
pub struct WebSocketSocket {
    epoch: Epoch,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    open: Arc<AtomicBool>,
}

impl SocketHandle for WebSocketSocket {
    fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn send(&self, text: String) -> Result<(), SocketError> {
        if !self.open.load(Ordering::SeqCst) {
            tracing::debug!(epoch = self.epoch, "Send on socket that is not open");
            return Err(SocketError::NotConnected);
        }
        self.outbound
            .send(text)
            .map_err(|_| SocketError::NotConnected)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

impl Drop for WebSocketSocket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Socket Task
// =============================================================================

struct SocketTask {
    url: String,
    epoch: Epoch,
    settings: WebSocketSettings,
    events: SocketEventSender,
    outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    open: Arc<AtomicBool>,
}

impl SocketTask {
    async fn run(mut self) {
        let close = self.connect_and_run().await;
        self.open.store(false, Ordering::SeqCst);

        tracing::debug!(
            url = %self.url,
            epoch = self.epoch,
            code = close.code,
            reason = %close.reason,
            "Socket closed"
        );
        let _ = self.events.send(SocketEvent::closed(self.epoch, close));
    }

    async fn connect_and_run(&mut self) -> CloseInfo {
        tracing::debug!(url = %self.url, epoch = self.epoch, "Connecting WebSocket");

        let connect = tokio::select! {
            () = self.cancel.cancelled() => {
                return CloseInfo::clean(u16::from(CloseCode::Normal), "closed before open");
            }
            result = tokio::time::timeout(
                self.settings.open_timeout,
                tokio_tungstenite::connect_async(self.url.as_str()),
            ) => result,
        };

        let ws_stream = match connect {
            Err(_) => {
                tracing::warn!(
                    url = %self.url,
                    timeout_secs = self.settings.open_timeout.as_secs(),
                    "WebSocket open timed out"
                );
                return CloseInfo::abnormal("open timed out");
            }
            Ok(Err(e)) => {
                tracing::warn!(url = %self.url, error = %e, "WebSocket connect failed");
                return CloseInfo::abnormal(e.to_string());
            }
            Ok(Ok((ws_stream, _response))) => ws_stream,
        };

        self.open.store(true, Ordering::SeqCst);
        if self.events.send(SocketEvent::opened(self.epoch)).is_err() {
            return CloseInfo::clean(u16::from(CloseCode::Normal), "owner gone");
        }

        let (mut write, mut read) = ws_stream.split();

        // Heartbeat
        let heartbeat_config = HeartbeatConfig::from_settings(&self.settings);
        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(4);
        let heartbeat_cancel = self.cancel.child_token();
        let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();
        if heartbeat_config.is_enabled() {
            tokio::spawn(
                HeartbeatMonitor::new(
                    heartbeat_config,
                    Arc::clone(&heartbeat_state),
                    heartbeat_tx.clone(),
                    heartbeat_cancel,
                )
                .run(),
            );
        }

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    // Frames queued before close (e.g. a final unsubscribe) still go out
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: Utf8Bytes::from_static("client closing"),
                    };
                    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
                        while let Ok(text) = self.outbound.try_recv() {
                            write.send(Message::Text(text.into())).await?;
                        }
                        write.send(Message::Close(Some(frame))).await
                    })
                    .await;
                    return CloseInfo::clean(u16::from(CloseCode::Normal), "closed by client");
                }
                outbound = self.outbound.recv() => {
                    let Some(text) = outbound else {
                        return CloseInfo::clean(u16::from(CloseCode::Normal), "handle dropped");
                    };
                    tracing::trace!(epoch = self.epoch, len = text.len(), "Sending frame");
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        return CloseInfo::abnormal(e.to_string());
                    }
                }
                heartbeat = heartbeat_rx.recv() => {
                    match heartbeat {
                        Some(HeartbeatEvent::SendPing) => {
                            heartbeat_state.mark_ping_sent();
                            if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                                return CloseInfo::abnormal(e.to_string());
                            }
                        }
                        Some(HeartbeatEvent::Timeout) => {
                            return CloseInfo::abnormal("heartbeat timeout");
                        }
                        None => {}
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            heartbeat_state.record_activity();
                            let raw = text.as_str().to_owned();
                            if self.events.send(SocketEvent::message(self.epoch, raw)).is_err() {
                                return CloseInfo::clean(u16::from(CloseCode::Normal), "owner gone");
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            heartbeat_state.record_activity();
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat_state.record_activity();
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                return CloseInfo::abnormal(e.to_string());
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(url = %self.url, ?frame, "Server sent close frame");
                            return frame.map_or_else(
                                || CloseInfo::clean(NO_STATUS, ""),
                                |f| CloseInfo::clean(u16::from(f.code), f.reason.as_str()),
                            );
                        }
                        Some(Ok(Message::Binary(data))) => {
                            heartbeat_state.record_activity();
                            tracing::trace!(len = data.len(), "Ignoring binary frame");
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            return CloseInfo::abnormal(e.to_string());
                        }
                        None => {
                            return CloseInfo::abnormal("stream ended");
                        }
                    }
                }
            }
        }
    }
}
