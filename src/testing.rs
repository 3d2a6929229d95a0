//! Test doubles for the processor and request side of the pump.

use std::{
    any::Any,
    future::Future,
    sync::Mutex,
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt};

use crate::{
    mapper::{Request, RequestKind},
    message::Message,
    processor::{CommandProcessor, HandlerError},
    utils::lock,
};

/// A request whose payload is the message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRequest {
    pub id: String,
    pub payload: String,
    pub kind: RequestKind,
}

impl TestRequest {
    pub fn from_message(message: &Message, kind: RequestKind) -> Self {
        Self {
            id: message.id.to_string(),
            payload: message.body.value(),
            kind,
        }
    }

    pub fn event_mapper() -> impl Fn(&Message) -> eyre::Result<Box<dyn Request>> + Send + Sync {
        |message: &Message| -> eyre::Result<Box<dyn Request>> {
            Ok(Box::new(Self::from_message(message, RequestKind::Event)))
        }
    }

    pub fn command_mapper() -> impl Fn(&Message) -> eyre::Result<Box<dyn Request>> + Send + Sync {
        |message: &Message| -> eyre::Result<Box<dyn Request>> {
            Ok(Box::new(Self::from_message(message, RequestKind::Command)))
        }
    }
}

impl Request for TestRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> RequestKind {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SpyMethod {
    Send,
    Publish,
    SendAsync,
    PublishAsync,
}

#[derive(Debug, Clone)]
pub struct SpyCall {
    pub method: SpyMethod,
    pub request_id: String,
    /// The [`TestRequest`] payload, empty for other request types
    pub payload: String,
}

type Responder = Box<dyn Fn(&dyn Request) -> Result<(), HandlerError> + Send + Sync>;

/// Records every dispatched request and answers with a scripted result.
pub struct SpyCommandProcessor {
    calls: Mutex<Vec<SpyCall>>,
    responder: Responder,
}

impl Default for SpyCommandProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl SpyCommandProcessor {
    /// A processor on which every dispatch succeeds.
    pub fn new() -> Self {
        Self::responding(|_| Ok(()))
    }

    pub fn responding<F>(responder: F) -> Self
    where
        F: Fn(&dyn Request) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    pub fn calls(&self) -> Vec<SpyCall> {
        lock(&self.calls).clone()
    }

    pub fn payloads(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.payload.clone()).collect()
    }

    fn record(&self, method: SpyMethod, request: &dyn Request) -> Result<(), HandlerError> {
        let payload = request
            .downcast_ref::<TestRequest>()
            .map(|r| r.payload.clone())
            .unwrap_or_default();

        lock(&self.calls).push(SpyCall {
            method,
            request_id: request.id().to_owned(),
            payload,
        });

        (self.responder)(request)
    }
}

impl CommandProcessor for SpyCommandProcessor {
    fn send(&self, request: &dyn Request) -> Result<(), HandlerError> {
        self.record(SpyMethod::Send, request)
    }

    fn publish(&self, request: &dyn Request) -> Result<(), HandlerError> {
        self.record(SpyMethod::Publish, request)
    }

    fn send_async<'a>(&'a self, request: &'a dyn Request) -> BoxFuture<'a, Result<(), HandlerError>> {
        async move {
            tokio::task::yield_now().await;
            self.record(SpyMethod::SendAsync, request)
        }
        .boxed()
    }

    fn publish_async<'a>(
        &'a self,
        request: &'a dyn Request,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        async move {
            tokio::task::yield_now().await;
            self.record(SpyMethod::PublishAsync, request)
        }
        .boxed()
    }
}

/// Polls `condition` until it holds or `timeout` elapses; returns the last result.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Awaits `future`, failing if it does not finish within `timeout`.
pub async fn within<F: Future>(timeout: Duration, future: F) -> eyre::Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| eyre::eyre!("timed out after {timeout:?}"))
}
