//! Translation of raw messages into typed requests.
//!
//! Mappers are registered per [`RequestType`] in a [`MessageMapperRegistry`],
//! which is shared by every pump the dispatcher starts. A missing mapper is
//! a wiring defect and surfaces as [`TranslateError::MissingMapper`]; a
//! mapper that fails on a particular message surfaces as
//! [`TranslateError::Mapping`] and only affects that message.

use std::{any::Any, sync::Arc};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::message::{Message, MessageId, MessageType};

/// Names the request a message maps to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestType(String);

impl RequestType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestType {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RequestType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Whether a request has exactly one handler or fans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RequestKind {
    Command,
    Event,
}

impl RequestKind {
    /// Whether a message of `message_type` may carry a request of this kind.
    pub fn accepts(&self, message_type: MessageType) -> bool {
        match message_type {
            MessageType::Command => *self == Self::Command,
            MessageType::Event => *self == Self::Event,
            MessageType::Document => true,
            _ => false,
        }
    }
}

/// A typed request produced by a [`MessageMapper`].
pub trait Request: Any + Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> RequestKind;

    fn as_any(&self) -> &dyn Any;
}

impl dyn Request + '_ {
    pub fn downcast_ref<T: Request>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Maps a raw [`Message`] to a [`Request`].
pub trait MessageMapper: Send + Sync {
    fn map_to_request(&self, message: &Message) -> eyre::Result<Box<dyn Request>>;
}

impl<F> MessageMapper for F
where
    F: Fn(&Message) -> eyre::Result<Box<dyn Request>> + Send + Sync,
{
    fn map_to_request(&self, message: &Message) -> eyre::Result<Box<dyn Request>> {
        self(message)
    }
}

#[derive(Debug, Snafu)]
pub enum TranslateError {
    #[snafu(display("No message mapper found for type {request_type} for message {message_id}"))]
    MissingMapper {
        request_type: RequestType,
        message_id: MessageId,
    },

    #[snafu(display("Failed to find request type for message {message_id}"))]
    UnresolvedType { message_id: MessageId },

    #[snafu(display("Failed to map message {message_id} to {request_type}"))]
    Mapping {
        request_type: RequestType,
        message_id: MessageId,
        #[snafu(source(false))]
        source: eyre::Report,
    },
}

/// Concurrent registry of mappers keyed by request type.
#[derive(Clone, Default)]
pub struct MessageMapperRegistry {
    mappers: Arc<papaya::HashMap<RequestType, Arc<dyn MessageMapper>>>,
}

impl MessageMapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        request_type: impl Into<RequestType>,
        mapper: impl MessageMapper + 'static,
    ) -> &Self {
        let guard = self.mappers.guard();
        self.mappers
            .insert(request_type.into(), Arc::new(mapper), &guard);
        self
    }

    pub fn get(&self, request_type: &RequestType) -> Option<Arc<dyn MessageMapper>> {
        let guard = self.mappers.guard();
        self.mappers.get(request_type, &guard).cloned()
    }

    pub fn contains(&self, request_type: &RequestType) -> bool {
        self.mappers.pin().contains_key(request_type)
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }

    /// Maps `message` with the mapper registered for `request_type`.
    pub fn translate(
        &self,
        request_type: Option<RequestType>,
        message: &Message,
    ) -> Result<Box<dyn Request>, TranslateError> {
        let request_type = request_type.ok_or_else(|| TranslateError::UnresolvedType {
            message_id: message.id.clone(),
        })?;

        let mapper = self
            .get(&request_type)
            .ok_or_else(|| TranslateError::MissingMapper {
                request_type: request_type.clone(),
                message_id: message.id.clone(),
            })?;

        tracing::debug!(message_id = %message.id, %request_type, "Translate message");

        mapper
            .map_to_request(message)
            .map_err(|source| TranslateError::Mapping {
                request_type,
                message_id: message.id.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{subscription::RoutingKey, testing::TestRequest};

    fn message() -> Message {
        Message::of_type(MessageType::Event, RoutingKey::from("orders"), "order-1")
    }

    #[test]
    fn test_translate_with_registered_mapper() {
        let registry = MessageMapperRegistry::new();
        registry.register("order_placed", TestRequest::event_mapper());

        let request = registry
            .translate(Some(RequestType::from("order_placed")), &message())
            .unwrap();

        let request = request.downcast_ref::<TestRequest>().unwrap();
        assert_eq!(request.payload, "order-1");
        assert_eq!(request.kind(), RequestKind::Event);
    }

    #[test]
    fn test_translate_missing_mapper() {
        let registry = MessageMapperRegistry::new();

        match registry.translate(Some(RequestType::from("order_placed")), &message()) {
            Err(TranslateError::MissingMapper { request_type, .. }) => {
                assert_eq!(request_type, RequestType::from("order_placed"))
            }
            other => panic!("Expected MissingMapper, got {other:?}"),
        }
    }

    #[test]
    fn test_translate_mapper_failure() {
        let registry = MessageMapperRegistry::new();
        registry.register(
            "order_placed",
            |_: &Message| -> eyre::Result<Box<dyn Request>> { Err(eyre::eyre!("bad json")) },
        );

        assert!(matches!(
            registry.translate(Some(RequestType::from("order_placed")), &message()),
            Err(TranslateError::Mapping { .. })
        ));
        assert!(matches!(
            registry.translate(None, &message()),
            Err(TranslateError::UnresolvedType { .. })
        ));
    }

    #[test]
    fn test_request_kind_accepts() {
        assert!(RequestKind::Command.accepts(MessageType::Command));
        assert!(!RequestKind::Command.accepts(MessageType::Event));
        assert!(RequestKind::Event.accepts(MessageType::Document));
        assert!(RequestKind::Command.accepts(MessageType::Document));
        assert!(!RequestKind::Event.accepts(MessageType::Quit));
    }
}
