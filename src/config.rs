use std::{sync::Arc, time::Duration};

use serde::Deserialize;

use crate::{
    channel::ChannelFactory,
    mapper::RequestType,
    subscription::{ChannelName, RoutingKey, Subscription, SubscriptionName},
};

/// Host settings read from `ACTIVATOR_*` environment variables.
///
/// Every field is optional; the accessors fall back to the subscription defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub host_name: Option<String>,
    pub timeout_ms: Option<u64>,
    pub empty_channel_delay_ms: Option<u64>,
    pub channel_failure_delay_ms: Option<u64>,
    pub requeue_count: Option<i32>,
    pub requeue_delay_ms: Option<u64>,
    pub unacceptable_message_limit: Option<u32>,
    pub unacceptable_message_limit_window_ms: Option<u64>,
    pub performers: Option<usize>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("ACTIVATOR_").from_env::<Self>()?)
    }

    pub fn host_name(&self) -> String {
        self.host_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_owned())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(300))
    }

    pub fn empty_channel_delay(&self) -> Duration {
        Duration::from_millis(self.empty_channel_delay_ms.unwrap_or(500))
    }

    pub fn channel_failure_delay(&self) -> Duration {
        Duration::from_millis(self.channel_failure_delay_ms.unwrap_or(1000))
    }

    pub fn requeue_count(&self) -> i32 {
        self.requeue_count.unwrap_or(-1)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms.unwrap_or(0))
    }

    pub fn unacceptable_message_limit(&self) -> u32 {
        self.unacceptable_message_limit.unwrap_or(0)
    }

    pub fn unacceptable_message_limit_window(&self) -> Option<Duration> {
        self.unacceptable_message_limit_window_ms
            .map(Duration::from_millis)
    }

    pub fn performers(&self) -> usize {
        self.performers.unwrap_or(1)
    }

    /// A subscription carrying this configuration's tuning.
    pub fn subscription(
        &self,
        name: impl Into<SubscriptionName>,
        channel_name: impl Into<ChannelName>,
        routing_key: impl Into<RoutingKey>,
        request_type: impl Into<RequestType>,
        channel_factory: Arc<dyn ChannelFactory>,
    ) -> Subscription {
        Subscription::builder()
            .name(name)
            .channel_name(channel_name)
            .routing_key(routing_key)
            .request_type(request_type)
            .channel_factory(channel_factory)
            .no_of_performers(self.performers())
            .timeout(self.timeout())
            .empty_channel_delay(self.empty_channel_delay())
            .channel_failure_delay(self.channel_failure_delay())
            .requeue_count(self.requeue_count())
            .requeue_delay(self.requeue_delay())
            .unacceptable_message_limit(self.unacceptable_message_limit())
            .maybe_unacceptable_message_limit_window(self.unacceptable_message_limit_window())
            .build()
    }
}
