//! The command processor contract the pump dispatches requests to.
//!
//! Handlers signal control flow through [`HandlerError`] rather than through
//! panics: `Defer` asks for the message to be requeued, `Configuration`
//! stops the pump, and everything else is logged and settled according to
//! the subscription's policy.

use futures_util::{future::BoxFuture, FutureExt};
use snafu::Snafu;

use crate::mapper::Request;

#[derive(Debug, Snafu)]
pub enum HandlerError {
    /// The handler cannot process the request yet and asks for a retry later.
    #[snafu(display("Deferring request {request_id} for later action"))]
    Defer { request_id: String },

    /// Handler wiring is missing or broken.
    #[snafu(display("Handler configuration error: {message}"))]
    Configuration { message: String },

    /// Several handlers of a published request failed.
    #[snafu(display("{} handlers failed", errors.len()))]
    Aggregate { errors: Vec<HandlerError> },

    #[snafu(display("Handler failed: {source}"))]
    Failed {
        #[snafu(source(false))]
        source: eyre::Report,
    },
}

impl HandlerError {
    pub fn defer(request_id: impl Into<String>) -> Self {
        Self::Defer {
            request_id: request_id.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn failed(source: impl Into<eyre::Report>) -> Self {
        Self::Failed {
            source: source.into(),
        }
    }
}

impl From<eyre::Report> for HandlerError {
    fn from(source: eyre::Report) -> Self {
        Self::Failed { source }
    }
}

/// Executes requests produced by the pump.
///
/// `send` is point-to-point (exactly one handler), `publish` fans out to
/// every registered handler and may aggregate their failures. The async
/// variants default to the blocking ones; processors with real async
/// pipelines should override them.
pub trait CommandProcessor: Send + Sync + 'static {
    fn send(&self, request: &dyn Request) -> Result<(), HandlerError>;

    fn publish(&self, request: &dyn Request) -> Result<(), HandlerError>;

    fn send_async<'a>(&'a self, request: &'a dyn Request) -> BoxFuture<'a, Result<(), HandlerError>> {
        async move { self.send(request) }.boxed()
    }

    fn publish_async<'a>(
        &'a self,
        request: &'a dyn Request,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        async move { self.publish(request) }.boxed()
    }
}
