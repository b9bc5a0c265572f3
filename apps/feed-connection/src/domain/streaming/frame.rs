//! Frame Decoding
//!
//! Classifies raw text frames from the push feed.
//!
//! Frames with a string `type` field are classified by it:
//!
//! | `type`                          | Frame                      |
//! |---------------------------------|----------------------------|
//! | `connected`                     | control acknowledgment     |
//! | `subscribed` / `unsubscribed`   | control acknowledgment     |
//! | `error`                         | server-reported error      |
//! | `data`                          | envelope routed by `topic` |
//! | `news` / `quote`                | typed data                 |
//!
//! Untyped frames are recognised by shape: `id` + `title` is a news item
//! (when inference is enabled) and `symbol` + `price` is a quote.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::{NewsItem, QuoteTick, Topic};

/// Frame decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame is not valid JSON or does not match the expected shape.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is valid JSON but not an object.
    #[error("expected JSON object, got {0}")]
    NotAnObject(&'static str),

    /// A typed frame lacks a required field.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
}

/// Control frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerControl {
    /// Session established.
    Connected {
        /// Server greeting.
        message: String,
    },
    /// Topic subscription acknowledged.
    Subscribed {
        /// Acknowledged topic, when the server names it.
        topic: Option<Topic>,
    },
    /// Topic unsubscription acknowledged.
    Unsubscribed {
        /// Acknowledged topic, when the server names it.
        topic: Option<Topic>,
    },
    /// Server-reported error.
    Error {
        /// Error text.
        message: String,
    },
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Session control; never forwarded to subscribers.
    Control(ServerControl),
    /// News article.
    News(NewsItem),
    /// Quote update.
    Quote(QuoteTick),
    /// Explicit data envelope.
    Envelope {
        /// Target topic.
        topic: Topic,
        /// Opaque payload.
        payload: Value,
    },
    /// Valid JSON object that matches no known frame shape.
    Unrecognized(String),
}

/// Decoder for feed frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    infer_news: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FrameDecoder {
    /// Create a decoder.
    ///
    /// With `infer_news` set, untyped frames carrying `id` and `title` are
    /// decoded as news items.
    #[must_use]
    pub const fn new(infer_news: bool) -> Self {
        Self { infer_news }
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object, a typed frame is
    /// missing required fields, or a data frame does not match its schema.
    pub fn decode(&self, text: &str) -> Result<Frame, DecodeError> {
        let value: Value = serde_json::from_str(text.trim())?;
        let kind = json_kind(&value);
        let Value::Object(object) = value else {
            return Err(DecodeError::NotAnObject(kind));
        };

        match string_field(&object, "type") {
            Some(kind) => Self::decode_typed(kind, object),
            None => self.decode_untyped(object),
        }
    }

    fn decode_typed(kind: String, mut object: Map<String, Value>) -> Result<Frame, DecodeError> {
        let frame = match kind.as_str() {
            "connected" => Frame::Control(ServerControl::Connected {
                message: string_field(&object, "message").unwrap_or_default(),
            }),
            "subscribed" => Frame::Control(ServerControl::Subscribed {
                topic: string_field(&object, "topic"),
            }),
            "unsubscribed" => Frame::Control(ServerControl::Unsubscribed {
                topic: string_field(&object, "topic"),
            }),
            "error" => Frame::Control(ServerControl::Error {
                message: string_field(&object, "message").unwrap_or_default(),
            }),
            "data" => {
                let topic =
                    string_field(&object, "topic").ok_or(DecodeError::MissingField("topic"))?;
                let payload = object.remove("payload").unwrap_or(Value::Null);
                Frame::Envelope { topic, payload }
            }
            "news" => Frame::News(payload_or_self(object)?),
            "quote" => Frame::Quote(payload_or_self(object)?),
            _ => Frame::Unrecognized(kind.clone()),
        };
        Ok(frame)
    }

    fn decode_untyped(&self, object: Map<String, Value>) -> Result<Frame, DecodeError> {
        if self.infer_news && object.contains_key("id") && object.contains_key("title") {
            let item: NewsItem = serde_json::from_value(Value::Object(object))?;
            return Ok(Frame::News(item));
        }

        if object.contains_key("symbol") && object.contains_key("price") {
            let quote: QuoteTick = serde_json::from_value(Value::Object(object))?;
            return Ok(Frame::Quote(quote));
        }

        Ok(Frame::Unrecognized("untyped".to_string()))
    }
}

/// Typed data frames carry their body either flat or under `payload`.
fn payload_or_self<T: DeserializeOwned>(mut object: Map<String, Value>) -> Result<T, DecodeError> {
    let body = match object.remove("payload") {
        Some(payload @ Value::Object(_)) => payload,
        Some(other) => {
            object.insert("payload".to_string(), other);
            Value::Object(object)
        }
        None => Value::Object(object),
    };
    Ok(serde_json::from_value(body)?)
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
