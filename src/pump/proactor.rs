//! Cooperative pump flavor.
//!
//! The loop runs on a current-thread runtime inside a [`LocalSet`], so every
//! continuation produced while dispatching resumes on the thread that owns
//! the channel and messages are settled in the order they were received.

use std::{sync::Arc, time::Duration};

use snafu::ResultExt;
use tokio::task::LocalSet;

use super::{
    policy::{Outcome, PumpPolicy, Receipt, Requeue},
    MessagePump, PumpCore, PumpExit,
};
use crate::{
    channel::{AsyncChannel, ChannelError},
    error::{ChannelFaultSnafu, MissingMessageSnafu, Result, SpawnSnafu},
    mapper::MessageMapperRegistry,
    message::Message,
    processor::CommandProcessor,
    subscription::{MessagePumpType, SettlePolicy, Subscription},
};

pub struct Proactor {
    core: PumpCore,
    channel: Arc<dyn AsyncChannel>,
    policy: PumpPolicy,
}

impl Proactor {
    pub fn new(
        channel: Arc<dyn AsyncChannel>,
        processor: Arc<dyn CommandProcessor>,
        mappers: MessageMapperRegistry,
        subscription: Arc<Subscription>,
    ) -> Self {
        let policy = PumpPolicy::from_subscription(&subscription);
        Self {
            core: PumpCore::new(processor, mappers, subscription),
            channel,
            policy,
        }
    }

    fn channel_name(&self) -> &str {
        self.channel.name().as_str()
    }

    async fn event_loop(mut self) -> Result<PumpExit> {
        tracing::info!(
            channel = self.channel_name(),
            routing_key = %self.channel.routing_key(),
            subscription = %self.core.subscription().name(),
            "Starting proactor pump"
        );

        loop {
            if self.policy.unacceptable_limit_reached() {
                tracing::error!(
                    channel = self.channel_name(),
                    count = self.policy.unacceptable_count(),
                    "Unacceptable message limit reached; stopping pump"
                );
                self.channel.dispose();
                return Ok(PumpExit::UnacceptableLimit);
            }

            let message = match self.channel.receive(self.policy.timeout()).await {
                Ok(message) => message,
                Err(e) if e.is_transient() => {
                    tracing::warn!(channel = self.channel_name(), "Failed to receive message: {e}");
                    tokio::time::sleep(self.policy.channel_failure_delay()).await;
                    continue;
                }
                Err(ChannelError::Missing { .. }) => {
                    self.channel.dispose();
                    return MissingMessageSnafu {
                        channel: self.channel_name(),
                    }
                    .fail();
                }
                Err(e) => {
                    tracing::error!(channel = self.channel_name(), "Channel faulted: {e}");
                    self.channel.dispose();
                    return Err(e).context(ChannelFaultSnafu {
                        channel: self.channel_name(),
                    });
                }
            };

            let route = match Receipt::classify(&message) {
                Receipt::Idle => {
                    tokio::time::sleep(self.policy.empty_channel_delay()).await;
                    continue;
                }
                Receipt::Unacceptable => {
                    tracing::warn!(
                        channel = self.channel_name(),
                        message_id = %message.id,
                        "Received unacceptable message"
                    );
                    self.policy.record_unacceptable();
                    self.acknowledge(&message).await;
                    continue;
                }
                Receipt::Quit => {
                    tracing::info!(channel = self.channel_name(), "Quit received; stopping pump");
                    self.channel.dispose();
                    return Ok(PumpExit::Quit);
                }
                Receipt::Serviceable(route) => route,
            };

            tracing::debug!(
                channel = self.channel_name(),
                message_id = %message.id,
                message_type = %message.message_type(),
                "Received message"
            );

            let result = match self.core.translate(&message) {
                Ok(request) => self
                    .core
                    .dispatch_async(route, request.as_ref())
                    .await
                    .map_err(Into::into),
                Err(e) => Err(e),
            };

            let channel = self.channel.name().clone();
            match self.policy.outcome(&message, channel.as_str(), result) {
                Outcome::Acknowledge => self.acknowledge(&message).await,
                Outcome::Requeue => self.requeue(message).await,
                Outcome::Reject => self.reject(&message).await,
                Outcome::Stop(error) => {
                    tracing::error!(
                        channel = self.channel_name(),
                        message_id = %message.id,
                        "Stopping pump: {error}"
                    );
                    self.reject(&message).await;
                    self.channel.dispose();
                    return Err(error);
                }
            }
        }
    }

    async fn acknowledge(&self, message: &Message) {
        tracing::debug!(channel = self.channel_name(), message_id = %message.id, "Acknowledging message");
        if let Err(e) = self.channel.acknowledge(message).await {
            tracing::error!(
                channel = self.channel_name(),
                message_id = %message.id,
                "Failed to acknowledge message: {e}"
            );
        }
    }

    async fn reject(&mut self, message: &Message) {
        tracing::debug!(channel = self.channel_name(), message_id = %message.id, "Rejecting message");
        self.policy.record_unacceptable();
        match self.channel.reject(message).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                channel = self.channel_name(),
                message_id = %message.id,
                "Channel declined to reject message"
            ),
            Err(e) => tracing::error!(
                channel = self.channel_name(),
                message_id = %message.id,
                "Failed to reject message: {e}"
            ),
        }
    }

    async fn requeue(&mut self, mut message: Message) {
        let channel = self.channel.name().clone();
        match self.policy.requeue(&mut message, channel.as_str()) {
            Requeue::After(delay) => {
                if !self.try_requeue(&message, delay).await {
                    self.acknowledge(&message).await;
                }
            }
            Requeue::Exhausted(SettlePolicy::Acknowledge) => self.acknowledge(&message).await,
            Requeue::Exhausted(SettlePolicy::Reject) => self.reject(&message).await,
        }
    }

    async fn try_requeue(&self, message: &Message, delay: Duration) -> bool {
        tracing::debug!(
            channel = self.channel_name(),
            message_id = %message.id,
            handled_count = message.handled_count(),
            "Requeueing message"
        );
        match self.channel.requeue(message, delay).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(
                    channel = self.channel_name(),
                    message_id = %message.id,
                    "Channel declined to requeue message; acknowledging"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    channel = self.channel_name(),
                    message_id = %message.id,
                    "Failed to requeue message: {e}; acknowledging"
                );
                false
            }
        }
    }
}

impl MessagePump for Proactor {
    fn pump_type(&self) -> MessagePumpType {
        MessagePumpType::Proactor
    }

    /// Builds a single-threaded scheduler on the calling thread and drives
    /// the loop on it until the pump stops.
    fn run(self: Box<Self>) -> Result<PumpExit> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context(SpawnSnafu {
                channel: self.channel_name(),
            })?;

        let local = LocalSet::new();
        local.block_on(&runtime, (*self).event_loop())
    }
}
