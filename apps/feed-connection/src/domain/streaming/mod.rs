//! Feed Message Types
//!
//! Canonical internal representation of what travels over the push feed:
//! the normalized [`InboundMessage`] handed to subscribers, the payload
//! shapes it can carry, and the outbound subscribe/unsubscribe control
//! frame.

mod frame;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use frame::{DecodeError, Frame, FrameDecoder, ServerControl};

/// A topic key identifying a slice of the feed (symbol or channel name).
pub type Topic = String;

/// Channel topic that receives every news item regardless of symbols.
pub const NEWS_TOPIC: &str = "news";

// =============================================================================
// Inbound
// =============================================================================

/// Whether a message carries feed data or session control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Session control (acknowledgments, server errors).
    Control,
    /// Market data for a topic.
    Data,
}

/// Normalized message envelope delivered to subscribers.
///
/// Constructed per frame and discarded after dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Control or data.
    pub kind: MessageKind,
    /// Topic the message was routed by.
    pub topic: Option<Topic>,
    /// Decoded payload.
    pub payload: Payload,
}

impl InboundMessage {
    /// Build a data message for a topic.
    #[must_use]
    pub fn data(topic: impl Into<Topic>, payload: Payload) -> Self {
        Self {
            kind: MessageKind::Data,
            topic: Some(topic.into()),
            payload,
        }
    }

    /// The news item carried by this message, if any.
    #[must_use]
    pub const fn as_news(&self) -> Option<&NewsItem> {
        match &self.payload {
            Payload::News(item) => Some(item),
            _ => None,
        }
    }

    /// The quote carried by this message, if any.
    #[must_use]
    pub const fn as_quote(&self) -> Option<&QuoteTick> {
        match &self.payload {
            Payload::Quote(quote) => Some(quote),
            _ => None,
        }
    }
}

/// Payload shapes the feed produces.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A news article.
    News(NewsItem),
    /// A price update for one symbol.
    Quote(QuoteTick),
    /// Payload of an explicit `{"type":"data"}` envelope, passed through as-is.
    Raw(serde_json::Value),
}

/// Sentiment attached to a news item, either a score or a label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sentiment {
    /// Numeric score (e.g. -1.0 to 1.0).
    Score(f64),
    /// Textual label (e.g. "positive").
    Label(String),
}

/// A news article pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    /// Server-assigned article id.
    pub id: String,
    /// Headline.
    pub title: String,
    /// Body text.
    #[serde(default)]
    pub content: String,
    /// Publisher.
    #[serde(default)]
    pub source: String,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// Optional sentiment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    /// Symbols the article is about.
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// A price update for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteTick {
    /// Ticker symbol.
    pub symbol: String,
    /// Last price.
    pub price: Decimal,
    /// Change versus previous close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<Decimal>,
    /// Traded volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    /// Exchange timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

// =============================================================================
// Outbound
// =============================================================================

/// Subscription control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Start receiving a topic.
    Subscribe,
    /// Stop receiving a topic.
    Unsubscribe,
}

/// Outbound control frame: `{"action":"subscribe","topic":"AAPL"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Requested action.
    pub action: ControlAction,
    /// Topic the action applies to.
    pub topic: Topic,
}

impl ControlRequest {
    /// Subscribe request for a topic.
    #[must_use]
    pub fn subscribe(topic: impl Into<Topic>) -> Self {
        Self {
            action: ControlAction::Subscribe,
            topic: topic.into(),
        }
    }

    /// Unsubscribe request for a topic.
    #[must_use]
    pub fn unsubscribe(topic: impl Into<Topic>) -> Self {
        Self {
            action: ControlAction::Unsubscribe,
            topic: topic.into(),
        }
    }

    /// Serialize to the wire representation.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_request_wire_shape() {
        let json = ControlRequest::subscribe("AAPL").to_json().unwrap();
        assert_eq!(json, r#"{"action":"subscribe","topic":"AAPL"}"#);

        let json = ControlRequest::unsubscribe("news").to_json().unwrap();
        assert_eq!(json, r#"{"action":"unsubscribe","topic":"news"}"#);
    }

    #[test]
    fn sentiment_accepts_score_or_label() {
        let score: Sentiment = serde_json::from_str("0.75").unwrap();
        assert_eq!(score, Sentiment::Score(0.75));

        let label: Sentiment = serde_json::from_str("\"bearish\"").unwrap();
        assert_eq!(label, Sentiment::Label("bearish".to_string()));
    }

    #[test]
    fn message_accessors() {
        let quote = QuoteTick {
            symbol: "MSFT".to_string(),
            price: Decimal::new(41_250, 2),
            change: None,
            volume: None,
            timestamp: None,
        };
        let msg = InboundMessage::data("MSFT", Payload::Quote(quote.clone()));

        assert_eq!(msg.kind, MessageKind::Data);
        assert_eq!(msg.topic.as_deref(), Some("MSFT"));
        assert_eq!(msg.as_quote(), Some(&quote));
        assert!(msg.as_news().is_none());
    }
}
