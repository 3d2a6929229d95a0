//! Declarative configuration for one logical consumption point.
//!
//! A [`Subscription`] is immutable once built and is owned by the
//! [`Dispatcher`](crate::dispatcher::Dispatcher), which fans it out into
//! `no_of_performers` identical consumers.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    channel::ChannelFactory,
    error::{Error, Result},
    mapper::RequestType,
    message::Message,
};

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

pub(crate) use name_type;

name_type!(
    /// Identity of a subscription, shared by all of its consumers.
    SubscriptionName
);
name_type!(
    /// Name of the broker channel a subscription reads from.
    ChannelName
);
name_type!(
    /// Topic or routing key messages are published with.
    RoutingKey
);

/// Which pump flavor drives a subscription's channels.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessagePumpType {
    /// Blocking receive and dispatch on a dedicated thread
    #[default]
    Reactor,
    /// Cooperative receive and dispatch on a single-threaded scheduler
    Proactor,
}

/// How a message is settled when the pump gives up on it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SettlePolicy {
    /// Remove the message from the queue
    #[default]
    Acknowledge,
    /// Hand the message back to the channel's reject path (dead letter)
    Reject,
}

/// Picks the request type for a message when a subscription carries several.
pub type RequestTypeResolver = Arc<dyn Fn(&Message) -> Option<RequestType> + Send + Sync>;

#[derive(Clone, bon::Builder)]
pub struct Subscription {
    #[builder(into)]
    name: SubscriptionName,
    #[builder(into)]
    channel_name: ChannelName,
    #[builder(into)]
    routing_key: RoutingKey,
    #[builder(into)]
    request_type: RequestType,
    request_type_resolver: Option<RequestTypeResolver>,
    channel_factory: Arc<dyn ChannelFactory>,
    #[builder(default = 1)]
    no_of_performers: usize,
    #[builder(default = Duration::from_millis(300))]
    timeout: Duration,
    /// `-1` requeues forever
    #[builder(default = -1)]
    requeue_count: i32,
    #[builder(default = Duration::ZERO)]
    requeue_delay: Duration,
    /// `0` disables the limit
    #[builder(default = 0)]
    unacceptable_message_limit: u32,
    unacceptable_message_limit_window: Option<Duration>,
    #[builder(default = Duration::from_millis(500))]
    empty_channel_delay: Duration,
    #[builder(default = Duration::from_millis(1000))]
    channel_failure_delay: Duration,
    #[builder(default)]
    message_pump_type: MessagePumpType,
    #[builder(default)]
    requeue_exhausted: SettlePolicy,
    #[builder(default)]
    on_unhandled_error: SettlePolicy,
}

impl Subscription {
    pub fn name(&self) -> &SubscriptionName {
        &self.name
    }

    pub fn channel_name(&self) -> &ChannelName {
        &self.channel_name
    }

    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    pub fn request_type(&self) -> &RequestType {
        &self.request_type
    }

    /// The request type for `message`, consulting the resolver when one is set.
    pub fn resolve_request_type(&self, message: &Message) -> Option<RequestType> {
        match &self.request_type_resolver {
            Some(resolve) => resolve(message),
            None => Some(self.request_type.clone()),
        }
    }

    pub fn channel_factory(&self) -> &Arc<dyn ChannelFactory> {
        &self.channel_factory
    }

    pub fn no_of_performers(&self) -> usize {
        self.no_of_performers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn requeue_count(&self) -> i32 {
        self.requeue_count
    }

    /// The requeue ceiling, or `None` when requeues are unlimited.
    pub fn requeue_limit(&self) -> Option<u32> {
        u32::try_from(self.requeue_count).ok()
    }

    pub fn requeue_delay(&self) -> Duration {
        self.requeue_delay
    }

    pub fn unacceptable_message_limit(&self) -> u32 {
        self.unacceptable_message_limit
    }

    pub fn unacceptable_message_limit_window(&self) -> Option<Duration> {
        self.unacceptable_message_limit_window
    }

    pub fn empty_channel_delay(&self) -> Duration {
        self.empty_channel_delay
    }

    pub fn channel_failure_delay(&self) -> Duration {
        self.channel_failure_delay
    }

    pub fn message_pump_type(&self) -> MessagePumpType {
        self.message_pump_type
    }

    pub fn requeue_exhausted(&self) -> SettlePolicy {
        self.requeue_exhausted
    }

    pub fn on_unhandled_error(&self) -> SettlePolicy {
        self.on_unhandled_error
    }

    /// A copy of this subscription running `no_of_performers` consumers.
    pub fn with_performers(&self, no_of_performers: usize) -> Self {
        Self {
            no_of_performers,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.as_str().is_empty() {
            return Err(Error::configuration("subscription name must not be empty"));
        }

        if self.timeout.is_zero() {
            return Err(Error::configuration(format!(
                "subscription {} must have a non-zero receive timeout",
                self.name
            )));
        }

        if self.requeue_count < -1 {
            return Err(Error::configuration(format!(
                "subscription {} has requeue count {}; use -1 for unlimited",
                self.name, self.requeue_count
            )));
        }

        Ok(())
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("channel_name", &self.channel_name)
            .field("routing_key", &self.routing_key)
            .field("request_type", &self.request_type)
            .field("no_of_performers", &self.no_of_performers)
            .field("timeout", &self.timeout)
            .field("requeue_count", &self.requeue_count)
            .field("requeue_delay", &self.requeue_delay)
            .field("unacceptable_message_limit", &self.unacceptable_message_limit)
            .field(
                "unacceptable_message_limit_window",
                &self.unacceptable_message_limit_window,
            )
            .field("message_pump_type", &self.message_pump_type)
            .finish_non_exhaustive()
    }
}
