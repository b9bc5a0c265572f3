//! WebSocket Transport Integration Tests
//!
//! Runs the connection manager over the real `tokio-tungstenite` transport
//! against a local WebSocket server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use feed_connection::{
    ConnectionManager, ConnectionState, FeedSubscription, ManagerConfig, ReconnectConfig,
    WebSocketSettings, WebSocketTransport,
};

const WAIT: Duration = Duration::from_secs(5);

/// Accepts two connections. The first greets, reads the subscribe frame,
/// pushes one quote and closes; the second reports every frame it reads.
async fn serve(listener: TcpListener, frames: mpsc::UnboundedSender<(usize, String)>) {
    for connection in 0..2 {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(Message::text(r#"{"type":"connected","message":"hi"}"#))
            .await
            .unwrap();

        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            frames.send((connection, text.as_str().to_owned())).unwrap();

            if connection == 0 {
                ws.send(Message::text(
                    r#"{"type":"quote","symbol":"AAPL","price":"190.10"}"#,
                ))
                .await
                .unwrap();
                ws.close(None).await.unwrap();
            }
        }
    }
}

async fn wait_for_state(manager: &ConnectionManager, target: ConnectionState) {
    let mut states = manager.state_changes();
    timeout(WAIT, states.wait_for(|state| *state == target))
        .await
        .expect("state reached in time")
        .unwrap();
}

#[tokio::test]
async fn subscriptions_survive_server_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let server = tokio::spawn(serve(listener, frames_tx));

    let transport = Arc::new(WebSocketTransport::new(WebSocketSettings::default()));
    let config = ManagerConfig {
        reconnect: ReconnectConfig::fixed(Duration::from_millis(50)),
        ..ManagerConfig::default()
    };
    let manager = ConnectionManager::new(&url, transport, config);
    let mut quotes = FeedSubscription::new(&manager, "AAPL").unwrap();

    // First connection: subscribe frame, then a quote
    let (connection, frame) = timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
    assert_eq!(connection, 0);
    assert_eq!(frame, r#"{"action":"subscribe","topic":"AAPL"}"#);

    let message = timeout(WAIT, quotes.next()).await.unwrap().unwrap();
    let quote = message.as_quote().expect("quote payload");
    assert_eq!(quote.symbol, "AAPL");
    assert_eq!(quote.price, Decimal::new(19010, 2));

    // Server closed; the manager reconnects and replays the topic
    let (connection, frame) = timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
    assert_eq!(connection, 1);
    assert_eq!(frame, r#"{"action":"subscribe","topic":"AAPL"}"#);
    wait_for_state(&manager, ConnectionState::Confirmed).await;
    assert_eq!(manager.retry_state().attempt, 0);
    assert_eq!(manager.stats().opens, 2);

    // Last subscriber leaves: unsubscribe frame, then the socket closes
    drop(quotes);
    let (connection, frame) = timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
    assert_eq!(connection, 1);
    assert_eq!(frame, r#"{"action":"unsubscribe","topic":"AAPL"}"#);
    assert_eq!(manager.state(), ConnectionState::Idle);

    timeout(WAIT, server).await.unwrap().unwrap();
    manager.shutdown();
}

#[tokio::test]
async fn unreachable_endpoint_schedules_reconnect() {
    // Bound then dropped, so nothing listens on the port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let transport = Arc::new(WebSocketTransport::new(WebSocketSettings::default()));
    let config = ManagerConfig {
        reconnect: ReconnectConfig::fixed(Duration::from_secs(60)),
        ..ManagerConfig::default()
    };
    let manager = ConnectionManager::new(&url, transport, config);
    let _subscription = FeedSubscription::new(&manager, "news").unwrap();

    wait_for_state(&manager, ConnectionState::ReconnectWait).await;
    assert_eq!(manager.retry_state().attempt, 1);
    assert_eq!(manager.stats().consecutive_failures, 1);

    manager.shutdown();
    assert_eq!(manager.state(), ConnectionState::Idle);
}
