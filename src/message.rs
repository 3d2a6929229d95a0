//! Message envelope types that flow from a channel into the message pump.
//!
//! A [`Message`] is created by a broker adapter when it receives data and is
//! logically destroyed when the pump acknowledges or rejects it. The only
//! field the pump mutates is the handled count, which grows every time the
//! message is requeued.
//!
//! # Message Types
//!
//! The header's [`MessageType`] is a closed set. `Command`, `Event` and
//! `Document` carry work; the remaining variants are control markers:
//!
//! - `None`: the channel timed out with nothing to deliver
//! - `Unacceptable`: the adapter could not parse the incoming data
//! - `Quit`: the pump must dispose its channel and stop

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::subscription::RoutingKey;

/// Bag key carrying the id of the message this one was copied from.
pub const ORIGINAL_MESSAGE_ID_HEADER: &str = "original_message_id";

/// Identifier of a message as assigned by the producer or broker adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The kind of a message, deciding how the pump treats it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageType {
    /// Point-to-point request, dispatched with `send`
    Command,
    /// Fan-out notification, dispatched with `publish`
    Event,
    /// Fan-out document, dispatched with `publish`
    Document,
    /// Synthetic stop signal
    Quit,
    /// Empty queue marker
    None,
    /// Marker for data that failed to parse upstream
    Unacceptable,
}

impl MessageType {
    /// Whether the message carries a request that must be dispatched.
    pub fn is_serviceable(&self) -> bool {
        matches!(self, Self::Command | Self::Event | Self::Document)
    }
}

/// Header of a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub topic: RoutingKey,
    pub message_type: MessageType,
    pub correlation_id: Option<String>,
    pub partition_key: Option<String>,
    pub content_type: Option<String>,
    pub reply_to: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub delayed_milliseconds: u64,
    handled_count: u32,
    /// Arbitrary key-value pairs set by producers and transports
    #[serde(default)]
    pub bag: HashMap<String, serde_json::Value>,
}

impl MessageHeader {
    pub fn new(topic: RoutingKey, message_type: MessageType) -> Self {
        Self {
            topic,
            message_type,
            correlation_id: None,
            partition_key: None,
            content_type: None,
            reply_to: None,
            timestamp: Utc::now(),
            delayed_milliseconds: 0,
            handled_count: 0,
            bag: HashMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_bag_entry(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.bag.insert(key.into(), value.into());
        self
    }

    pub fn handled_count(&self) -> u32 {
        self.handled_count
    }
}

/// Payload of a [`Message`]. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageBody(Bytes);

impl MessageBody {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The body as UTF-8 text, lossily converted.
    pub fn value(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<&str> for MessageBody {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for MessageBody {
    fn from(value: String) -> Self {
        Self(Bytes::from(value))
    }
}

/// The unit of data received from a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn new(id: MessageId, header: MessageHeader, body: impl Into<MessageBody>) -> Self {
        Self {
            id,
            header,
            body: body.into(),
        }
    }

    /// Builds a message with a random id on the given topic.
    pub fn of_type(
        message_type: MessageType,
        topic: RoutingKey,
        body: impl Into<MessageBody>,
    ) -> Self {
        Self::new(
            MessageId::random(),
            MessageHeader::new(topic, message_type),
            body,
        )
    }

    /// The stop signal injected by a performer.
    pub fn quit(routing_key: RoutingKey) -> Self {
        Self::new(
            MessageId::empty(),
            MessageHeader::new(routing_key, MessageType::Quit),
            MessageBody::empty(),
        )
    }

    /// The marker a channel returns when nothing arrived before the timeout.
    pub fn none(routing_key: RoutingKey) -> Self {
        Self::new(
            MessageId::empty(),
            MessageHeader::new(routing_key, MessageType::None),
            MessageBody::empty(),
        )
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn handled_count(&self) -> u32 {
        self.header.handled_count
    }

    /// Records one more handling attempt. The count never decreases.
    pub fn update_handled_count(&mut self) {
        self.header.handled_count = self.header.handled_count.saturating_add(1);
    }

    /// True once the message has been handled more than `requeue_count` times.
    pub fn requeue_limit_exceeded(&self, requeue_count: u32) -> bool {
        self.header.handled_count > requeue_count
    }

    pub fn original_message_id(&self) -> Option<String> {
        self.header
            .bag
            .get(ORIGINAL_MESSAGE_ID_HEADER)
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
    }
}
