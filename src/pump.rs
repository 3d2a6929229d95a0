//! The per-channel consume, translate, dispatch and settle loop.
//!
//! Two flavors implement [`MessagePump`]: the blocking [`Reactor`] and the
//! cooperative [`Proactor`]. Both delegate every decision to a
//! [`PumpPolicy`](policy::PumpPolicy) so their observable behavior matches.

use std::sync::Arc;

use crate::{
    error::Result,
    mapper::{MessageMapperRegistry, Request},
    message::Message,
    processor::{CommandProcessor, HandlerError},
    subscription::{MessagePumpType, Subscription},
};

pub mod policy;
pub mod proactor;
pub mod reactor;

pub use proactor::Proactor;
pub use reactor::Reactor;

use policy::{DispatchError, KindMismatchSnafu, Route};

/// Why a pump loop finished without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PumpExit {
    /// A quit message was received
    Quit,
    /// Too many unacceptable messages arrived within the window
    UnacceptableLimit,
}

/// A consumption loop bound to one channel.
///
/// `run` drives the loop on the calling thread until a quit message, the
/// unacceptable-message limit, or a fatal error ends it. The channel is
/// disposed on every exit path.
pub trait MessagePump: Send + 'static {
    fn pump_type(&self) -> MessagePumpType;

    fn run(self: Box<Self>) -> Result<PumpExit>;
}

/// Collaborators shared by both pump flavors.
#[derive(Clone)]
pub(crate) struct PumpCore {
    processor: Arc<dyn CommandProcessor>,
    mappers: MessageMapperRegistry,
    subscription: Arc<Subscription>,
}

impl PumpCore {
    pub(crate) fn new(
        processor: Arc<dyn CommandProcessor>,
        mappers: MessageMapperRegistry,
        subscription: Arc<Subscription>,
    ) -> Self {
        Self {
            processor,
            mappers,
            subscription,
        }
    }

    pub(crate) fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Maps `message` to a request and checks the request kind fits the message type.
    pub(crate) fn translate(&self, message: &Message) -> Result<Box<dyn Request>, DispatchError> {
        let request_type = self.subscription.resolve_request_type(message);
        let request = self.mappers.translate(request_type, message)?;

        let kind = request.kind();
        if !kind.accepts(message.message_type()) {
            return KindMismatchSnafu {
                message_id: message.id.clone(),
                message_type: message.message_type(),
                kind,
            }
            .fail();
        }

        Ok(request)
    }

    pub(crate) fn dispatch(&self, route: Route, request: &dyn Request) -> Result<(), HandlerError> {
        tracing::debug!(request_id = request.id(), ?route, "Dispatching request");
        match route {
            Route::Send => self.processor.send(request),
            Route::Publish => self.processor.publish(request),
        }
    }

    pub(crate) async fn dispatch_async(
        &self,
        route: Route,
        request: &dyn Request,
    ) -> Result<(), HandlerError> {
        tracing::debug!(request_id = request.id(), ?route, "Dispatching request");
        match route {
            Route::Send => self.processor.send_async(request).await,
            Route::Publish => self.processor.publish_async(request).await,
        }
    }
}
