//! In-memory broker implementing both channel flavors.
//!
//! Primarily used for testing and for the demo host. Every channel created
//! from one [`InMemoryBus`] shares its queues, so several performers on the
//! same routing key compete for messages like they would on a real broker.
//! The bus keeps a ledger of acknowledged, rejected and requeued messages so
//! tests can observe how the pump settled each one.
//!
//! Every message pushed to the bus takes the next sequence number. A message
//! enqueued directly on a channel remembers the sequence number current at
//! that moment and is only delivered once no visible message at or before it
//! is still waiting, so a quit signal never overtakes work already queued.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use futures_util::{future::BoxFuture, FutureExt};
use tokio::sync::Notify;

use super::{AsyncChannel, Channel, ChannelError, ChannelFactory};
use crate::{
    message::Message,
    subscription::{ChannelName, RoutingKey, Subscription},
    utils::lock,
};

struct Pending {
    seq: u64,
    visible_at: Instant,
    message: Message,
}

#[derive(Default)]
struct Queues {
    /// Last sequence number handed out
    sequence: u64,
    topics: HashMap<RoutingKey, VecDeque<Pending>>,
}

impl Queues {
    /// Takes the first visible message, or reports how long until one becomes visible.
    fn take_visible(
        &mut self,
        routing_key: &RoutingKey,
        now: Instant,
    ) -> Result<Message, Option<Duration>> {
        let Some(queue) = self.topics.get_mut(routing_key) else {
            return Err(None);
        };

        match queue.iter().position(|p| p.visible_at <= now) {
            Some(index) => queue.remove(index).map(|p| p.message).ok_or(None),
            None => Err(queue
                .iter()
                .map(|p| p.visible_at.saturating_duration_since(now))
                .min()),
        }
    }

    fn has_visible_through(&self, routing_key: &RoutingKey, seq: u64, now: Instant) -> bool {
        self.topics.get(routing_key).is_some_and(|queue| {
            queue
                .iter()
                .any(|p| p.seq <= seq && p.visible_at <= now)
        })
    }
}

/// A message enqueued on one channel, held until the broker has caught up to `after`.
struct Buffered {
    after: u64,
    message: Message,
}

#[derive(Default, Clone)]
struct Ledger {
    acknowledged: Vec<Message>,
    rejected: Vec<Message>,
    requeued: Vec<Message>,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<Queues>,
    available: Condvar,
    notify: Notify,
    ledger: Mutex<Ledger>,
    failures: AtomicUsize,
    disposed: AtomicUsize,
}

impl Shared {
    fn push(&self, routing_key: RoutingKey, message: Message, delay: Duration) {
        {
            let mut queues = lock(&self.queues);
            queues.sequence += 1;
            let seq = queues.sequence;
            queues
                .topics
                .entry(routing_key)
                .or_default()
                .push_back(Pending {
                    seq,
                    visible_at: Instant::now() + delay,
                    message,
                });
        }
        self.wake();
    }

    fn wake(&self) {
        self.available.notify_all();
        self.notify.notify_waiters();
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// An in-memory broker. Cloning shares the underlying queues.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `message` on its header topic.
    pub fn enqueue(&self, message: Message) {
        self.shared
            .push(message.header.topic.clone(), message, Duration::ZERO);
    }

    /// Messages waiting on `routing_key`, including delayed ones.
    pub fn stream(&self, routing_key: &RoutingKey) -> Vec<Message> {
        lock(&self.shared.queues)
            .topics
            .get(routing_key)
            .map(|queue| queue.iter().map(|p| p.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn acknowledged(&self) -> Vec<Message> {
        lock(&self.shared.ledger).acknowledged.clone()
    }

    pub fn rejected(&self) -> Vec<Message> {
        lock(&self.shared.ledger).rejected.clone()
    }

    pub fn requeued(&self) -> Vec<Message> {
        lock(&self.shared.ledger).requeued.clone()
    }

    /// Makes the next `count` receives fail with a transient error.
    pub fn fail_receives(&self, count: usize) {
        self.shared.failures.store(count, Ordering::Release);
    }

    /// How many channels created from this bus have been disposed.
    pub fn disposed_channels(&self) -> usize {
        self.shared.disposed.load(Ordering::Acquire)
    }

    pub fn channel(
        &self,
        name: impl Into<ChannelName>,
        routing_key: impl Into<RoutingKey>,
    ) -> InMemoryChannel {
        InMemoryChannel {
            name: name.into(),
            routing_key: routing_key.into(),
            shared: self.shared.clone(),
            buffer: Mutex::new(VecDeque::new()),
            disposed: AtomicBool::new(false),
        }
    }
}

impl ChannelFactory for InMemoryBus {
    fn create_channel(&self, subscription: &Subscription) -> Result<Arc<dyn Channel>, ChannelError> {
        Ok(Arc::new(self.channel(
            subscription.channel_name().clone(),
            subscription.routing_key().clone(),
        )))
    }

    fn create_async_channel(
        &self,
        subscription: &Subscription,
    ) -> Result<Arc<dyn AsyncChannel>, ChannelError> {
        Ok(Arc::new(self.channel(
            subscription.channel_name().clone(),
            subscription.routing_key().clone(),
        )))
    }
}

/// One consumer's view of an [`InMemoryBus`] routing key.
pub struct InMemoryChannel {
    name: ChannelName,
    routing_key: RoutingKey,
    shared: Arc<Shared>,
    buffer: Mutex<VecDeque<Buffered>>,
    disposed: AtomicBool,
}

impl InMemoryChannel {
    fn check_receivable(&self) -> Result<(), ChannelError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ChannelError::Fault {
                channel: self.name.to_string(),
                source: eyre::eyre!("receive on a disposed channel"),
            });
        }

        if self.shared.take_failure() {
            return Err(ChannelError::Failure {
                channel: self.name.to_string(),
                message: "injected receive failure".to_owned(),
            });
        }

        Ok(())
    }

    /// The buffered message once nothing visible is queued ahead of it,
    /// otherwise the next visible broker message.
    fn next_message(&self, queues: &mut Queues, now: Instant) -> Result<Message, Option<Duration>> {
        let mut buffer = lock(&self.buffer);
        if let Some(front) = buffer.front() {
            if !queues.has_visible_through(&self.routing_key, front.after, now) {
                if let Some(buffered) = buffer.pop_front() {
                    return Ok(buffered.message);
                }
            }
        }
        drop(buffer);

        queues.take_visible(&self.routing_key, now)
    }

    fn receive_blocking(&self, timeout: Duration) -> Result<Message, ChannelError> {
        self.check_receivable()?;

        let deadline = Instant::now() + timeout;
        let mut queues = lock(&self.shared.queues);
        loop {
            let now = Instant::now();
            let next = match self.next_message(&mut queues, now) {
                Ok(message) => return Ok(message),
                Err(next) => next,
            };

            if now >= deadline {
                return Ok(Message::none(self.routing_key.clone()));
            }

            let wait = next.map_or(deadline - now, |next| next.min(deadline - now));
            queues = self
                .shared
                .available
                .wait_timeout(queues, wait)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    async fn receive_cooperative(&self, timeout: Duration) -> Result<Message, ChannelError> {
        self.check_receivable()?;

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let next = match self.next_message(&mut lock(&self.shared.queues), now) {
                Ok(message) => return Ok(message),
                Err(next) => next,
            };

            if now >= deadline {
                return Ok(Message::none(self.routing_key.clone()));
            }

            let wait = next.map_or(deadline - now, |next| next.min(deadline - now));
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    fn record_acknowledge(&self, message: &Message) {
        lock(&self.shared.ledger).acknowledged.push(message.clone());
    }

    fn record_reject(&self, message: &Message) -> bool {
        lock(&self.shared.ledger).rejected.push(message.clone());
        true
    }

    fn record_requeue(&self, message: &Message, delay: Duration) -> bool {
        lock(&self.shared.ledger).requeued.push(message.clone());
        self.shared
            .push(self.routing_key.clone(), message.clone(), delay);
        true
    }

    fn buffer(&self, message: Message) {
        {
            // Queue lock first, same order as receive; a waiting receiver then sees the wakeup.
            let queues = lock(&self.shared.queues);
            lock(&self.buffer).push_back(Buffered {
                after: queues.sequence,
                message,
            });
        }
        self.shared.wake();
    }

    fn close(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.shared.disposed.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Channel for InMemoryChannel {
    fn name(&self) -> &ChannelName {
        &self.name
    }

    fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    fn receive(&self, timeout: Duration) -> Result<Message, ChannelError> {
        self.receive_blocking(timeout)
    }

    fn acknowledge(&self, message: &Message) -> Result<(), ChannelError> {
        self.record_acknowledge(message);
        Ok(())
    }

    fn reject(&self, message: &Message) -> Result<bool, ChannelError> {
        Ok(self.record_reject(message))
    }

    fn requeue(&self, message: &Message, delay: Duration) -> Result<bool, ChannelError> {
        Ok(self.record_requeue(message, delay))
    }

    fn enqueue(&self, message: Message) {
        self.buffer(message);
    }

    fn dispose(&self) {
        self.close();
    }
}

impl AsyncChannel for InMemoryChannel {
    fn name(&self) -> &ChannelName {
        &self.name
    }

    fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    fn receive(&self, timeout: Duration) -> BoxFuture<'_, Result<Message, ChannelError>> {
        self.receive_cooperative(timeout).boxed()
    }

    fn acknowledge<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), ChannelError>> {
        async move {
            self.record_acknowledge(message);
            Ok(())
        }
        .boxed()
    }

    fn reject<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<bool, ChannelError>> {
        async move { Ok(self.record_reject(message)) }.boxed()
    }

    fn requeue<'a>(
        &'a self,
        message: &'a Message,
        delay: Duration,
    ) -> BoxFuture<'a, Result<bool, ChannelError>> {
        async move { Ok(self.record_requeue(message, delay)) }.boxed()
    }

    fn enqueue(&self, message: Message) {
        self.buffer(message);
    }

    fn dispose(&self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn setup() -> (InMemoryBus, InMemoryChannel) {
        let bus = InMemoryBus::new();
        let channel = bus.channel(ChannelName::from("orders.queue"), RoutingKey::from("orders"));
        (bus, channel)
    }

    fn event(body: &str) -> Message {
        Message::of_type(MessageType::Event, RoutingKey::from("orders"), body)
    }

    #[test]
    fn test_receive_timeout_yields_none_message() {
        let (_bus, channel) = setup();

        let message = Channel::receive(&channel, Duration::from_millis(20)).unwrap();

        assert_eq!(message.message_type(), MessageType::None);
    }

    #[test]
    fn test_receive_preserves_order() {
        let (bus, channel) = setup();
        bus.enqueue(event("first"));
        bus.enqueue(event("second"));

        let first = Channel::receive(&channel, Duration::from_millis(20)).unwrap();
        let second = Channel::receive(&channel, Duration::from_millis(20)).unwrap();

        assert_eq!(first.body.value(), "first");
        assert_eq!(second.body.value(), "second");
        assert!(bus.stream(&RoutingKey::from("orders")).is_empty());
    }

    #[test]
    fn test_enqueued_quit_waits_for_messages_ahead_of_it() {
        let (bus, channel) = setup();
        bus.enqueue(event("first"));
        bus.enqueue(event("second"));
        Channel::enqueue(&channel, Message::quit(RoutingKey::from("orders")));
        bus.enqueue(event("after quit"));

        let received: Vec<_> = (0..3)
            .map(|_| Channel::receive(&channel, Duration::from_millis(20)).unwrap())
            .collect();

        assert_eq!(received[0].body.value(), "first");
        assert_eq!(received[1].body.value(), "second");
        assert_eq!(received[2].message_type(), MessageType::Quit);
        assert_eq!(bus.stream(&RoutingKey::from("orders")).len(), 1);
    }

    #[test]
    fn test_enqueued_quit_on_empty_queue_is_immediate() {
        let (_bus, channel) = setup();
        Channel::enqueue(&channel, Message::quit(RoutingKey::from("orders")));

        let message = Channel::receive(&channel, Duration::from_secs(5)).unwrap();

        assert_eq!(message.message_type(), MessageType::Quit);
    }

    #[test]
    fn test_enqueued_quit_skips_delayed_requeue() {
        let (bus, channel) = setup();
        Channel::requeue(&channel, &event("later"), Duration::from_secs(60)).unwrap();
        Channel::enqueue(&channel, Message::quit(RoutingKey::from("orders")));

        let message = Channel::receive(&channel, Duration::from_millis(20)).unwrap();

        assert_eq!(message.message_type(), MessageType::Quit);
        assert_eq!(bus.stream(&RoutingKey::from("orders")).len(), 1);
    }

    #[test]
    fn test_messages_taken_by_competing_channel_release_quit() {
        let (bus, channel) = setup();
        let other = bus.channel(ChannelName::from("orders.queue"), RoutingKey::from("orders"));
        bus.enqueue(event("first"));
        Channel::enqueue(&channel, Message::quit(RoutingKey::from("orders")));

        let taken = Channel::receive(&other, Duration::from_millis(20)).unwrap();
        let message = Channel::receive(&channel, Duration::from_millis(20)).unwrap();

        assert_eq!(taken.body.value(), "first");
        assert_eq!(message.message_type(), MessageType::Quit);
    }

    #[tokio::test]
    async fn test_cooperative_enqueued_quit_waits_for_messages_ahead_of_it() {
        let (bus, channel) = setup();
        bus.enqueue(event("first"));
        AsyncChannel::enqueue(&channel, Message::quit(RoutingKey::from("orders")));

        let first = AsyncChannel::receive(&channel, Duration::from_millis(20))
            .await
            .unwrap();
        let second = AsyncChannel::receive(&channel, Duration::from_millis(20))
            .await
            .unwrap();

        assert_eq!(first.body.value(), "first");
        assert_eq!(second.message_type(), MessageType::Quit);
    }

    #[test]
    fn test_requeue_with_delay_hides_message() {
        let (bus, channel) = setup();
        let message = event("later");

        Channel::requeue(&channel, &message, Duration::from_millis(200)).unwrap();

        let first = Channel::receive(&channel, Duration::from_millis(10)).unwrap();
        assert_eq!(first.message_type(), MessageType::None);

        let second = Channel::receive(&channel, Duration::from_millis(500)).unwrap();
        assert_eq!(second.body.value(), "later");
        assert_eq!(bus.requeued().len(), 1);
    }

    #[test]
    fn test_injected_failures_are_transient() {
        let (bus, channel) = setup();
        bus.fail_receives(1);

        let err = Channel::receive(&channel, Duration::from_millis(10)).unwrap_err();
        assert!(err.is_transient());

        let message = Channel::receive(&channel, Duration::from_millis(10)).unwrap();
        assert_eq!(message.message_type(), MessageType::None);
    }

    #[test]
    fn test_dispose_is_counted_once() {
        let (bus, channel) = setup();

        Channel::dispose(&channel);
        Channel::dispose(&channel);

        assert_eq!(bus.disposed_channels(), 1);
        assert!(Channel::receive(&channel, Duration::from_millis(10)).is_err());
    }

    #[tokio::test]
    async fn test_cooperative_receive_wakes_on_publish() {
        let (bus, channel) = setup();

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                bus.enqueue(event("woken"));
            })
        };

        let message = AsyncChannel::receive(&channel, Duration::from_secs(2))
            .await
            .unwrap();
        publisher.await.unwrap();

        assert_eq!(message.body.value(), "woken");
    }

    #[tokio::test]
    async fn test_cooperative_acknowledge_is_recorded() {
        let (bus, channel) = setup();
        bus.enqueue(event("ack me"));

        let message = AsyncChannel::receive(&channel, Duration::from_millis(50))
            .await
            .unwrap();
        AsyncChannel::acknowledge(&channel, &message).await.unwrap();

        assert_eq!(bus.acknowledged(), vec![message]);
    }
}
