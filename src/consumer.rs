use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    mapper::MessageMapperRegistry,
    performer::{Job, Performer},
    processor::CommandProcessor,
    subscription::{name_type, Subscription, SubscriptionName},
};

name_type!(
    /// Unique name of one consumer: the subscription name plus a suffix.
    ConsumerName
);

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConsumerState {
    Shut,
    Open,
}

/// One running unit of a subscription.
///
/// Every [`open`](Consumer::open) builds a fresh performer, since a channel
/// is disposed when its pump stops and cannot be reused.
pub struct Consumer {
    name: ConsumerName,
    subscription: Arc<Subscription>,
    processor: Arc<dyn CommandProcessor>,
    mappers: MessageMapperRegistry,
    state: ConsumerState,
    performer: Option<Performer>,
    job: Option<Job>,
}

impl Consumer {
    pub fn new(
        subscription: Arc<Subscription>,
        processor: Arc<dyn CommandProcessor>,
        mappers: MessageMapperRegistry,
    ) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = ConsumerName::new(format!("{}-{}", subscription.name(), &suffix[..8]));

        Self {
            name,
            subscription,
            processor,
            mappers,
            state: ConsumerState::Shut,
            performer: None,
            job: None,
        }
    }

    pub fn name(&self) -> &ConsumerName {
        &self.name
    }

    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.subscription
    }

    pub fn subscription_name(&self) -> &SubscriptionName {
        self.subscription.name()
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConsumerState::Open
    }

    /// Handle to the pump started by the last `open`.
    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    /// Starts a new pump. Opening an open consumer returns its current job
    /// while that job is still running.
    pub fn open(&mut self) -> Result<Job> {
        if let (ConsumerState::Open, Some(job)) = (self.state, &self.job) {
            if !job.is_finished() {
                return Ok(job.clone());
            }
            tracing::debug!(consumer = %self.name, "Pump already stopped; starting a new one");
        }

        let mut performer = Performer::for_subscription(
            self.subscription.clone(),
            self.processor.clone(),
            self.mappers.clone(),
        )?;
        let job = performer.run(self.name.as_str())?;

        tracing::info!(consumer = %self.name, channel = %performer.channel().name(), "Consumer opened");

        self.performer = Some(performer);
        self.job = Some(job.clone());
        self.state = ConsumerState::Open;

        Ok(job)
    }

    /// Asks the pump to stop. Does not wait for it; await the job for that.
    pub fn shut(&mut self) {
        if self.state != ConsumerState::Open {
            return;
        }

        if let Some(performer) = &self.performer {
            performer.stop(self.subscription.routing_key());
        }

        tracing::info!(consumer = %self.name, "Consumer shut");
        self.state = ConsumerState::Shut;
    }
}

impl PartialEq for Consumer {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Consumer {}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("subscription", self.subscription.name())
            .field("state", &self.state)
            .field("job", &self.job)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        channel::in_memory::InMemoryBus,
        message::{Message, MessageType},
        pump::PumpExit,
        subscription::RoutingKey,
        testing::{eventually, within, SpyCommandProcessor, TestRequest},
    };

    fn consumer(bus: &InMemoryBus) -> Consumer {
        consumer_for(bus, "order_placed")
    }

    fn consumer_for(bus: &InMemoryBus, request_type: &str) -> Consumer {
        let subscription = Subscription::builder()
            .name("orders")
            .channel_name("orders.queue")
            .routing_key("orders")
            .request_type(request_type)
            .channel_factory(Arc::new(bus.clone()))
            .timeout(Duration::from_millis(20))
            .empty_channel_delay(Duration::from_millis(5))
            .build();
        let mappers = MessageMapperRegistry::new();
        mappers.register("order_placed", TestRequest::event_mapper());

        Consumer::new(
            Arc::new(subscription),
            Arc::new(SpyCommandProcessor::new()),
            mappers,
        )
    }

    #[test]
    fn test_new_consumer_is_shut() {
        let consumer = consumer(&InMemoryBus::new());

        assert_eq!(consumer.state(), ConsumerState::Shut);
        assert!(consumer.job().is_none());
        assert!(consumer.name().as_str().starts_with("orders-"));
    }

    #[test]
    fn test_names_are_unique() {
        let bus = InMemoryBus::new();
        assert_ne!(consumer(&bus), consumer(&bus));
    }

    #[tokio::test]
    async fn test_open_then_shut() {
        let bus = InMemoryBus::new();
        let mut consumer = consumer(&bus);

        let job = consumer.open().unwrap();
        assert!(consumer.is_open());

        // opening again does not start a second pump
        let again = consumer.open().unwrap();
        assert_eq!(again.name(), job.name());

        consumer.shut();
        assert_eq!(consumer.state(), ConsumerState::Shut);

        let exit = within(Duration::from_secs(5), job.wait()).await.unwrap();
        assert_eq!(exit.unwrap(), PumpExit::Quit);
        assert_eq!(bus.disposed_channels(), 1);
    }

    #[tokio::test]
    async fn test_reopen_uses_fresh_channel() {
        let bus = InMemoryBus::new();
        let mut consumer = consumer(&bus);

        let first = consumer.open().unwrap();
        consumer.shut();
        within(Duration::from_secs(5), first.wait())
            .await
            .unwrap()
            .unwrap();

        let second = consumer.open().unwrap();
        assert!(!second.is_finished());
        consumer.shut();
        within(Duration::from_secs(5), second.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(bus.disposed_channels(), 2);
    }

    #[tokio::test]
    async fn test_open_restarts_stopped_pump() {
        let bus = InMemoryBus::new();
        let mut consumer = consumer_for(&bus, "unmapped");

        bus.enqueue(Message::of_type(
            MessageType::Event,
            RoutingKey::from("orders"),
            "order-1",
        ));
        let first = consumer.open().unwrap();
        assert!(eventually(Duration::from_secs(5), || first.is_finished()).await);
        assert!(consumer.is_open());

        let second = consumer.open().unwrap();
        assert!(!second.is_finished());
        assert_eq!(bus.disposed_channels(), 1);

        consumer.shut();
        let exit = within(Duration::from_secs(5), second.wait()).await.unwrap();
        assert_eq!(exit.unwrap(), PumpExit::Quit);
        assert_eq!(bus.disposed_channels(), 2);
    }

    #[test]
    fn test_shut_when_shut_is_noop() {
        let mut consumer = consumer(&InMemoryBus::new());
        consumer.shut();
        assert_eq!(consumer.state(), ConsumerState::Shut);
    }
}
