//! The broker boundary the message pump reads from.
//!
//! A channel wraps one broker subscription. It comes in two flavors with
//! identical semantics: [`Channel`] blocks the calling thread, while
//! [`AsyncChannel`] suspends cooperatively. Both must honor the same
//! contract:
//!
//! - `receive` never waits longer than the timeout and returns a message of
//!   type [`MessageType::None`](crate::message::MessageType::None) when
//!   nothing arrived.
//! - `enqueue` hands a message to this channel alone. It is delivered after
//!   the messages already visible to the channel and before any that arrive
//!   later. It must not block, since performers call it from other threads
//!   to inject the quit signal.
//! - `dispose` releases the broker subscription; the channel is not reused.

use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use snafu::Snafu;

use crate::{
    message::Message,
    subscription::{ChannelName, RoutingKey, Subscription},
};

pub mod in_memory;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ChannelError {
    /// The broker could not be reached; the pump retries after a delay.
    #[snafu(display("Channel {channel} failed: {message}"))]
    Failure { channel: String, message: String },

    /// A circuit breaker in the transport is open; retried like a failure.
    #[snafu(display("Circuit broken for channel {channel}"))]
    BrokenCircuit { channel: String },

    /// Unrecoverable transport error.
    #[snafu(display("Channel {channel} faulted: {source}"))]
    Fault {
        channel: String,
        #[snafu(source(false))]
        source: eyre::Report,
    },

    /// The transport produced no message at all, not even the empty marker.
    #[snafu(display("Channel {channel} returned no message"))]
    Missing { channel: String },
}

impl ChannelError {
    /// Whether retrying the receive may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Failure { .. } | Self::BrokenCircuit { .. })
    }
}

/// Blocking channel, driven by the reactor pump.
pub trait Channel: Send + Sync {
    fn name(&self) -> &ChannelName;

    fn routing_key(&self) -> &RoutingKey;

    fn receive(&self, timeout: Duration) -> Result<Message, ChannelError>;

    fn acknowledge(&self, message: &Message) -> Result<(), ChannelError>;

    /// Returns whether the broker accepted the rejection.
    fn reject(&self, message: &Message) -> Result<bool, ChannelError>;

    /// Returns whether the broker accepted the requeue.
    fn requeue(&self, message: &Message, delay: Duration) -> Result<bool, ChannelError>;

    fn enqueue(&self, message: Message);

    fn dispose(&self);
}

/// Cooperative channel, driven by the proactor pump.
pub trait AsyncChannel: Send + Sync {
    fn name(&self) -> &ChannelName;

    fn routing_key(&self) -> &RoutingKey;

    fn receive(&self, timeout: Duration) -> BoxFuture<'_, Result<Message, ChannelError>>;

    fn acknowledge<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), ChannelError>>;

    fn reject<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<bool, ChannelError>>;

    fn requeue<'a>(
        &'a self,
        message: &'a Message,
        delay: Duration,
    ) -> BoxFuture<'a, Result<bool, ChannelError>>;

    fn enqueue(&self, message: Message);

    fn dispose(&self);
}

/// Creates fresh channels for a subscription; a disposed channel is never reused.
pub trait ChannelFactory: Send + Sync {
    fn create_channel(&self, subscription: &Subscription) -> Result<Arc<dyn Channel>, ChannelError>;

    fn create_async_channel(
        &self,
        subscription: &Subscription,
    ) -> Result<Arc<dyn AsyncChannel>, ChannelError>;
}
