//! Blocking pump flavor. Receive and dispatch both run on the calling thread.

use std::{sync::Arc, thread, time::Duration};

use snafu::ResultExt;

use super::{
    policy::{Outcome, PumpPolicy, Receipt, Requeue},
    MessagePump, PumpCore, PumpExit,
};
use crate::{
    channel::{Channel, ChannelError},
    error::{ChannelFaultSnafu, MissingMessageSnafu, Result},
    mapper::MessageMapperRegistry,
    message::Message,
    processor::CommandProcessor,
    subscription::{MessagePumpType, SettlePolicy, Subscription},
};

pub struct Reactor {
    core: PumpCore,
    channel: Arc<dyn Channel>,
    policy: PumpPolicy,
}

impl Reactor {
    pub fn new(
        channel: Arc<dyn Channel>,
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

    fn event_loop(mut self) -> Result<PumpExit> {
        tracing::info!(
            channel = self.channel_name(),
            routing_key = %self.channel.routing_key(),
            subscription = %self.core.subscription().name(),
            "Starting reactor pump"
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

            let message = match self.channel.receive(self.policy.timeout()) {
                Ok(message) => message,
                Err(e) if e.is_transient() => {
                    tracing::warn!(channel = self.channel_name(), "Failed to receive message: {e}");
                    thread::sleep(self.policy.channel_failure_delay());
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
                    thread::sleep(self.policy.empty_channel_delay());
                    continue;
                }
                Receipt::Unacceptable => {
                    tracing::warn!(
                        channel = self.channel_name(),
                        message_id = %message.id,
                        "Received unacceptable message"
                    );
                    self.policy.record_unacceptable();
                    self.acknowledge(&message);
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

            let result = self
                .core
                .translate(&message)
                .and_then(|request| Ok(self.core.dispatch(route, request.as_ref())?));

            let channel = self.channel.name().clone();
            match self.policy.outcome(&message, channel.as_str(), result) {
                Outcome::Acknowledge => self.acknowledge(&message),
                Outcome::Requeue => self.requeue(message),
                Outcome::Reject => self.reject(&message),
                Outcome::Stop(error) => {
                    tracing::error!(
                        channel = self.channel_name(),
                        message_id = %message.id,
                        "Stopping pump: {error}"
                    );
                    self.reject(&message);
                    self.channel.dispose();
                    return Err(error);
                }
            }
        }
    }

    fn acknowledge(&self, message: &Message) {
        tracing::debug!(channel = self.channel_name(), message_id = %message.id, "Acknowledging message");
        if let Err(e) = self.channel.acknowledge(message) {
            tracing::error!(
                channel = self.channel_name(),
                message_id = %message.id,
                "Failed to acknowledge message: {e}"
            );
        }
    }

    fn reject(&mut self, message: &Message) {
        tracing::debug!(channel = self.channel_name(), message_id = %message.id, "Rejecting message");
        self.policy.record_unacceptable();
        match self.channel.reject(message) {
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

    fn requeue(&mut self, mut message: Message) {
        let channel = self.channel.name().clone();
        match self.policy.requeue(&mut message, channel.as_str()) {
            Requeue::After(delay) => {
                if !self.try_requeue(&message, delay) {
                    self.acknowledge(&message);
                }
            }
            Requeue::Exhausted(SettlePolicy::Acknowledge) => self.acknowledge(&message),
            Requeue::Exhausted(SettlePolicy::Reject) => self.reject(&message),
        }
    }

    fn try_requeue(&self, message: &Message, delay: Duration) -> bool {
        tracing::debug!(
            channel = self.channel_name(),
            message_id = %message.id,
            handled_count = message.handled_count(),
            "Requeueing message"
        );
        match self.channel.requeue(message, delay) {
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

impl MessagePump for Reactor {
    fn pump_type(&self) -> MessagePumpType {
        MessagePumpType::Reactor
    }

    fn run(self: Box<Self>) -> Result<PumpExit> {
        (*self).event_loop()
    }
}
