//! Channel Adapters
//!
//! Async [`Stream`] views over feed subscriptions, for consumers that prefer
//! `while let Some(msg) = stream.next().await` over callbacks.
//!
//! Each [`FeedSubscription`] owns one registration on a
//! [`ConnectionManager`]. Dropping it unsubscribes; the stream ends when the
//! manager is shut down. A subscription made through a registry
//! [`ConnectionHandle`] also holds a handle, so the shared feed stays up for
//! as long as the stream does.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::application::FeedError;
use crate::application::services::{ConnectionHandle, ConnectionManager, SubscriptionHandle};
use crate::domain::streaming::InboundMessage;

/// Stream of messages for one topic.
pub struct FeedSubscription {
    manager: Arc<ConnectionManager>,
    handle: SubscriptionHandle,
    messages: UnboundedReceiverStream<InboundMessage>,
    _feed: Option<ConnectionHandle>,
}

impl FeedSubscription {
    /// Subscribe to `topic` and stream its messages.
    ///
    /// # Errors
    ///
    /// Returns the error from [`ConnectionManager::subscribe`].
    pub fn new(manager: &Arc<ConnectionManager>, topic: &str) -> Result<Self, FeedError> {
        Self::register(manager, topic, None)
    }

    /// Subscribe to `topic` on a registry feed.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Disposed`] if the feed has been shut down.
    pub fn from_handle(feed: &ConnectionHandle, topic: &str) -> Result<Self, FeedError> {
        Self::register(feed.manager(), topic, Some(feed.clone()))
    }

    fn register(
        manager: &Arc<ConnectionManager>,
        topic: &str,
        feed: Option<ConnectionHandle>,
    ) -> Result<Self, FeedError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = manager.subscribe(topic, move |message| {
            // Receiver gone means the subscription is being dropped
            let _ = tx.send(message.clone());
        })?;

        Ok(Self {
            manager: Arc::clone(manager),
            handle,
            messages: UnboundedReceiverStream::new(rx),
            _feed: feed,
        })
    }

    /// Subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.handle.topic()
    }

    /// Underlying registration.
    #[must_use]
    pub const fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

impl Stream for FeedSubscription {
    type Item = InboundMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.messages).poll_next(cx)
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.manager.unsubscribe(&self.handle);
    }
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("endpoint", &self.manager.endpoint())
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
