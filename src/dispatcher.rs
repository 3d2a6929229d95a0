//! Orchestration of every consumer across a set of subscriptions.
//!
//! [`Dispatcher::receive`] opens all consumers and spawns a supervisor task
//! that waits on their jobs. Jobs of consumers opened later are handed to
//! the supervisor over a channel. When the last job finishes the supervisor
//! marks the dispatcher [`Stopped`](DispatcherState::Stopped); the
//! transition happens under the registry lock, so a consumer opened
//! concurrently is either seen by the supervisor or rejected by the state.
//!
//! ```text
//!  receive() ──► open consumers ──► supervisor ◄── open()/open_subscription()
//!                                       │
//!                 job finished ─► remove consumer ─► none left ─► Stopped
//! ```

use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use futures_util::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::{
    consumer::{Consumer, ConsumerName, ConsumerState},
    error::{Error, Result},
    mapper::MessageMapperRegistry,
    performer::{Job, JobResult},
    processor::CommandProcessor,
    subscription::{Subscription, SubscriptionName},
    utils::lock,
};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DispatcherState {
    NotReady,
    Awaiting,
    Running,
    Stopped,
}

/// Snapshot of one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerInfo {
    pub name: ConsumerName,
    pub subscription: SubscriptionName,
    pub state: ConsumerState,
}

/// Per-subscription report returned by [`Dispatcher::get_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatcherStateItem {
    pub subscription: SubscriptionName,
    pub performers: usize,
    pub consumers: Vec<ConsumerInfo>,
}

struct Registry {
    subscriptions: Vec<Arc<Subscription>>,
    consumers: Vec<Consumer>,
    /// Feeds the supervisor while it runs
    jobs: Option<mpsc::UnboundedSender<Job>>,
}

impl Registry {
    fn subscription(&self, name: &str) -> Result<Arc<Subscription>> {
        self.subscriptions
            .iter()
            .find(|s| s.name().as_str() == name)
            .cloned()
            .ok_or_else(|| Error::subscription_not_found(name))
    }

    fn consumers_of<'a>(
        &'a mut self,
        subscription: &'a SubscriptionName,
    ) -> impl Iterator<Item = &'a mut Consumer> + 'a {
        self.consumers
            .iter_mut()
            .filter(move |c| c.subscription_name() == subscription)
    }

    fn count_open(&self, subscription: &SubscriptionName) -> usize {
        self.consumers
            .iter()
            .filter(|c| c.subscription_name() == subscription && c.is_open())
            .count()
    }
}

struct Inner {
    host_name: String,
    processor: Arc<dyn CommandProcessor>,
    mappers: MessageMapperRegistry,
    registry: Mutex<Registry>,
    state: watch::Sender<DispatcherState>,
}

impl Inner {
    fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    fn consumer(&self, subscription: Arc<Subscription>) -> Consumer {
        Consumer::new(subscription, self.processor.clone(), self.mappers.clone())
    }

    /// Creates shut consumers until `subscription` has one per performer.
    fn provision(&self, registry: &mut Registry, subscription: &Arc<Subscription>) {
        let existing = registry.consumers_of(subscription.name()).count();
        for _ in existing..subscription.no_of_performers() {
            registry.consumers.push(self.consumer(subscription.clone()));
        }
    }

    /// Starts new consumers until `subscription` has one open per performer
    /// and hands their jobs to the supervisor.
    fn open_running(&self, registry: &mut Registry, subscription: &Arc<Subscription>) {
        let open = registry.count_open(subscription.name());

        for _ in open..subscription.no_of_performers() {
            let mut consumer = self.consumer(subscription.clone());
            match consumer.open() {
                Ok(job) => {
                    if let Some(jobs) = &registry.jobs {
                        if jobs.send(job).is_err() {
                            tracing::warn!(consumer = %consumer.name(), "Supervisor is gone");
                        }
                    }
                    registry.consumers.push(consumer);
                }
                Err(e) => {
                    tracing::error!(consumer = %consumer.name(), "Failed to open consumer: {e}");
                }
            }
        }
    }

    fn complete(&self, name: &str, result: JobResult) {
        match result {
            Ok(exit) => tracing::info!(consumer = name, %exit, "Consumer finished"),
            Err(e) if e.is_configuration() => {
                tracing::error!(consumer = name, "Consumer stopped on a configuration error: {e}")
            }
            Err(e) => tracing::error!(consumer = name, "Consumer faulted: {e}"),
        }

        lock(&self.registry)
            .consumers
            .retain(|c| c.name().as_str() != name);
    }
}

fn completion(job: Job) -> BoxFuture<'static, (String, JobResult)> {
    async move {
        let result = job.wait().await;
        (job.name().to_owned(), result)
    }
    .boxed()
}

/// Waits on every job until none remain, then marks the dispatcher stopped.
async fn supervise(inner: Arc<Inner>, initial: Vec<Job>, mut added: mpsc::UnboundedReceiver<Job>) {
    let mut running: FuturesUnordered<_> = initial.into_iter().map(completion).collect();

    loop {
        if running.is_empty() {
            let mut registry = lock(&inner.registry);
            match added.try_recv() {
                Ok(job) => {
                    drop(registry);
                    running.push(completion(job));
                    continue;
                }
                Err(_) => {
                    registry.jobs = None;
                    inner.state.send_replace(DispatcherState::Stopped);
                    tracing::info!(host_name = %inner.host_name, "Dispatcher stopped");
                    return;
                }
            }
        }

        tokio::select! {
            Some(job) = added.recv() => running.push(completion(job)),
            Some((name, result)) = running.next() => inner.complete(&name, result),
        }
    }
}

/// Runs and supervises the consumers of a set of subscriptions.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

#[bon::bon]
impl Dispatcher {
    /// Validates the subscriptions and builds their consumers without starting them.
    #[builder]
    pub fn new(
        processor: Arc<dyn CommandProcessor>,
        #[builder(default)] subscriptions: Vec<Subscription>,
        #[builder(default)] mappers: MessageMapperRegistry,
        #[builder(into)] host_name: Option<String>,
    ) -> Result<Self> {
        let (state, _) = watch::channel(DispatcherState::NotReady);

        let mut registry = Registry {
            subscriptions: Vec::with_capacity(subscriptions.len()),
            consumers: Vec::new(),
            jobs: None,
        };

        for subscription in subscriptions {
            subscription.validate()?;
            if registry.subscription(subscription.name().as_str()).is_ok() {
                return Err(Error::configuration(format!(
                    "subscription {} is registered twice",
                    subscription.name()
                )));
            }
            registry.subscriptions.push(Arc::new(subscription));
        }

        let inner = Inner {
            host_name: host_name.unwrap_or_else(|| "localhost".to_owned()),
            processor,
            mappers,
            registry: Mutex::new(registry),
            state,
        };

        {
            let mut registry = lock(&inner.registry);
            for subscription in registry.subscriptions.clone() {
                inner.provision(&mut registry, &subscription);
            }
        }

        inner.state.send_replace(DispatcherState::Awaiting);

        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

impl Dispatcher {
    pub fn host_name(&self) -> &str {
        &self.inner.host_name
    }

    pub fn state(&self) -> DispatcherState {
        self.inner.state()
    }

    /// A receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<DispatcherState> {
        self.inner.state.subscribe()
    }

    /// Opens every consumer and starts supervising them in the background.
    ///
    /// Valid while awaiting or stopped; must be called from within a tokio runtime.
    pub fn receive(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::invalid_state("receive", format!("outside a runtime ({e})")))?;

        let mut registry = lock(&self.inner.registry);

        let state = self.inner.state();
        if !matches!(state, DispatcherState::Awaiting | DispatcherState::Stopped) {
            return Err(Error::invalid_state("receive", state));
        }

        for subscription in registry.subscriptions.clone() {
            self.inner.provision(&mut registry, &subscription);
        }

        let mut jobs = Vec::with_capacity(registry.consumers.len());
        registry.consumers.retain_mut(|consumer| match consumer.open() {
            Ok(job) => {
                jobs.push(job);
                true
            }
            Err(e) => {
                tracing::error!(consumer = %consumer.name(), "Failed to open consumer: {e}");
                false
            }
        });

        let (tx, rx) = mpsc::unbounded_channel();
        registry.jobs = Some(tx);
        self.inner.state.send_replace(DispatcherState::Running);
        drop(registry);

        tracing::info!(
            host_name = %self.inner.host_name,
            consumers = jobs.len(),
            "Dispatcher running"
        );

        runtime.spawn(supervise(self.inner.clone(), jobs, rx));
        Ok(())
    }

    /// Shuts every open consumer and resolves once the dispatcher has stopped.
    ///
    /// Resolves immediately when the dispatcher is not running.
    pub fn end(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.inner.state.subscribe();

        {
            let mut registry = lock(&self.inner.registry);
            if self.inner.state() == DispatcherState::Running {
                tracing::info!(host_name = %self.inner.host_name, "Ending dispatcher");
                for consumer in registry.consumers.iter_mut() {
                    consumer.shut();
                }
            }
        }

        async move {
            if state
                .wait_for(|s| *s != DispatcherState::Running)
                .await
                .is_err()
            {
                tracing::debug!("Dispatcher dropped while ending");
            }
        }
    }

    /// Starts the named subscription's consumers, or defers until the next
    /// [`receive`](Self::receive) when not running.
    pub fn open(&self, name: impl AsRef<str>) -> Result<()> {
        let mut registry = lock(&self.inner.registry);
        let subscription = registry.subscription(name.as_ref())?;

        if self.inner.state() == DispatcherState::Running {
            self.inner.open_running(&mut registry, &subscription);
        } else {
            self.inner.provision(&mut registry, &subscription);
        }

        Ok(())
    }

    /// Adds `subscription` if its name is unknown, then opens it.
    pub fn open_subscription(&self, subscription: Subscription) -> Result<()> {
        subscription.validate()?;

        let name = subscription.name().clone();
        {
            let mut registry = lock(&self.inner.registry);
            if registry.subscription(name.as_str()).is_err() {
                tracing::info!(subscription = %name, "Adding subscription");
                registry.subscriptions.push(Arc::new(subscription));
            }
        }

        self.open(name.as_str())
    }

    /// Shuts the named subscription's open consumers; others are unaffected.
    pub fn shut(&self, name: impl AsRef<str>) -> Result<()> {
        let mut registry = lock(&self.inner.registry);
        let subscription = registry.subscription(name.as_ref())?;

        for consumer in registry.consumers_of(subscription.name()) {
            consumer.shut();
        }

        Ok(())
    }

    /// Scales a subscription to `performers` consumers.
    ///
    /// While running, surplus consumers are shut and missing ones opened.
    pub fn set_active_performers(&self, name: impl AsRef<str>, performers: usize) -> Result<()> {
        let mut registry = lock(&self.inner.registry);
        let current = registry.subscription(name.as_ref())?;

        let updated = Arc::new(current.with_performers(performers));
        for slot in registry.subscriptions.iter_mut() {
            if slot.name() == updated.name() {
                *slot = updated.clone();
            }
        }

        if self.inner.state() == DispatcherState::Running {
            let open = registry.count_open(updated.name());
            if open > performers {
                registry
                    .consumers_of(updated.name())
                    .filter(|c| c.is_open())
                    .skip(performers)
                    .for_each(|c| c.shut());
            } else {
                self.inner.open_running(&mut registry, &updated);
            }
        } else {
            let mut kept = 0;
            registry.consumers.retain(|c| {
                if c.subscription_name() != updated.name() {
                    return true;
                }
                kept += 1;
                kept <= performers
            });
            self.inner.provision(&mut registry, &updated);
        }

        tracing::info!(subscription = %updated.name(), performers, "Set active performers");
        Ok(())
    }

    pub fn consumers(&self) -> Vec<ConsumerInfo> {
        lock(&self.inner.registry)
            .consumers
            .iter()
            .map(|c| ConsumerInfo {
                name: c.name().clone(),
                subscription: c.subscription_name().clone(),
                state: c.state(),
            })
            .collect()
    }

    /// Handles of every consumer that has been opened.
    pub fn jobs(&self) -> Vec<Job> {
        lock(&self.inner.registry)
            .consumers
            .iter()
            .filter_map(|c| c.job().cloned())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        lock(&self.inner.registry).subscriptions.clone()
    }

    /// Configured performers and live consumers, grouped by subscription.
    pub fn get_state(&self) -> Vec<DispatcherStateItem> {
        let registry = lock(&self.inner.registry);

        registry
            .subscriptions
            .iter()
            .map(|subscription| DispatcherStateItem {
                subscription: subscription.name().clone(),
                performers: subscription.no_of_performers(),
                consumers: registry
                    .consumers
                    .iter()
                    .filter(|c| c.subscription_name() == subscription.name())
                    .map(|c| ConsumerInfo {
                        name: c.name().clone(),
                        subscription: c.subscription_name().clone(),
                        state: c.state(),
                    })
                    .collect(),
            })
            .collect()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("host_name", &self.inner.host_name)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        channel::in_memory::InMemoryBus,
        message::{Message, MessageType},
        subscription::RoutingKey,
        testing::{eventually, within, SpyCommandProcessor, TestRequest},
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn subscription(bus: &InMemoryBus, name: &str, request_type: &str, performers: usize) -> Subscription {
        Subscription::builder()
            .name(name)
            .channel_name(format!("{name}.queue"))
            .routing_key(name)
            .request_type(request_type)
            .channel_factory(Arc::new(bus.clone()))
            .no_of_performers(performers)
            .timeout(Duration::from_millis(20))
            .empty_channel_delay(Duration::from_millis(5))
            .build()
    }

    fn dispatcher(subscriptions: Vec<Subscription>) -> (Dispatcher, Arc<SpyCommandProcessor>) {
        let spy = Arc::new(SpyCommandProcessor::new());
        let mappers = MessageMapperRegistry::new();
        mappers.register("order_placed", TestRequest::event_mapper());

        let dispatcher = Dispatcher::builder()
            .processor(spy.clone())
            .subscriptions(subscriptions)
            .mappers(mappers)
            .host_name("test-host")
            .build()
            .unwrap();

        (dispatcher, spy)
    }

    fn open_count(dispatcher: &Dispatcher, subscription: &str) -> usize {
        dispatcher
            .consumers()
            .iter()
            .filter(|c| c.subscription.as_str() == subscription && c.state == ConsumerState::Open)
            .count()
    }

    #[test]
    fn test_new_builds_shut_consumers() {
        let bus = InMemoryBus::new();
        let (dispatcher, _) = dispatcher(vec![
            subscription(&bus, "orders", "order_placed", 3),
            subscription(&bus, "invoices", "order_placed", 1),
        ]);

        assert_eq!(dispatcher.state(), DispatcherState::Awaiting);
        assert_eq!(dispatcher.host_name(), "test-host");
        assert_eq!(dispatcher.subscriptions().len(), 2);

        let consumers = dispatcher.consumers();
        assert_eq!(consumers.len(), 4);
        assert!(consumers.iter().all(|c| c.state == ConsumerState::Shut));
    }

    #[test]
    fn test_new_rejects_duplicate_subscriptions() {
        let bus = InMemoryBus::new();
        let result = Dispatcher::builder()
            .processor(Arc::new(SpyCommandProcessor::new()))
            .subscriptions(vec![
                subscription(&bus, "orders", "order_placed", 1),
                subscription(&bus, "orders", "order_placed", 1),
            ])
            .build();

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_receive_fans_out_performers() {
        let bus = InMemoryBus::new();
        let (dispatcher, _) = dispatcher(vec![subscription(&bus, "orders", "order_placed", 3)]);

        dispatcher.receive().unwrap();

        assert_eq!(dispatcher.state(), DispatcherState::Running);
        assert_eq!(open_count(&dispatcher, "orders"), 3);
        assert_eq!(dispatcher.jobs().len(), 3);

        within(WAIT, dispatcher.end()).await.unwrap();

        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert!(dispatcher.consumers().is_empty());
        assert_eq!(bus.disposed_channels(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_receive_while_running_fails() {
        let bus = InMemoryBus::new();
        let (dispatcher, _) = dispatcher(vec![subscription(&bus, "orders", "order_placed", 1)]);

        dispatcher.receive().unwrap();
        assert!(matches!(
            dispatcher.receive(),
            Err(Error::InvalidState { .. })
        ));

        within(WAIT, dispatcher.end()).await.unwrap();
    }

    #[test]
    fn test_receive_outside_runtime_fails() {
        let bus = InMemoryBus::new();
        let (dispatcher, _) = dispatcher(vec![subscription(&bus, "orders", "order_placed", 1)]);

        assert!(matches!(
            dispatcher.receive(),
            Err(Error::InvalidState { .. })
        ));
        assert_eq!(dispatcher.state(), DispatcherState::Awaiting);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_end_is_idempotent() {
        let bus = InMemoryBus::new();
        let (dispatcher, _) = dispatcher(vec![subscription(&bus, "orders", "order_placed", 2)]);

        within(WAIT, dispatcher.end()).await.unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Awaiting);

        dispatcher.receive().unwrap();
        within(WAIT, dispatcher.end()).await.unwrap();
        within(WAIT, dispatcher.end()).await.unwrap();

        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_from_stopped() {
        let bus = InMemoryBus::new();
        let (dispatcher, spy) = dispatcher(vec![subscription(&bus, "orders", "order_placed", 1)]);

        dispatcher.receive().unwrap();
        within(WAIT, dispatcher.end()).await.unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);

        dispatcher.receive().unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Running);
        assert_eq!(open_count(&dispatcher, "orders"), 1);

        bus.enqueue(Message::of_type(
            MessageType::Event,
            RoutingKey::from("orders"),
            "order-1",
        ));
        assert!(eventually(WAIT, || spy.calls().len() == 1).await);

        within(WAIT, dispatcher.end()).await.unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shut_only_affects_named_subscription() {
        let bus = InMemoryBus::new();
        let (dispatcher, _) = dispatcher(vec![
            subscription(&bus, "orders", "order_placed", 2),
            subscription(&bus, "invoices", "order_placed", 1),
        ]);

        dispatcher.receive().unwrap();
        dispatcher.shut("orders").unwrap();

        assert!(eventually(WAIT, || dispatcher.consumers().len() == 1).await);
        assert_eq!(open_count(&dispatcher, "invoices"), 1);
        assert_eq!(dispatcher.state(), DispatcherState::Running);

        assert!(matches!(
            dispatcher.shut("unknown"),
            Err(Error::SubscriptionNotFound { .. })
        ));

        within(WAIT, dispatcher.end()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reopen_shut_subscription() {
        let bus = InMemoryBus::new();
        let (dispatcher, _) = dispatcher(vec![
            subscription(&bus, "orders", "order_placed", 2),
            subscription(&bus, "invoices", "order_placed", 1),
        ]);

        dispatcher.receive().unwrap();
        dispatcher.shut("orders").unwrap();
        assert!(eventually(WAIT, || dispatcher.consumers().len() == 1).await);

        dispatcher.open("orders").unwrap();
        assert_eq!(open_count(&dispatcher, "orders"), 2);

        within(WAIT, dispatcher.end()).await.unwrap();
        assert!(dispatcher.consumers().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_subscription_while_running() {
        let bus = InMemoryBus::new();
        let (dispatcher, spy) = dispatcher(vec![subscription(&bus, "orders", "order_placed", 1)]);

        dispatcher.receive().unwrap();
        dispatcher
            .open_subscription(subscription(&bus, "invoices", "order_placed", 2))
            .unwrap();

        assert_eq!(dispatcher.subscriptions().len(), 2);
        assert_eq!(open_count(&dispatcher, "invoices"), 2);

        bus.enqueue(Message::of_type(
            MessageType::Event,
            RoutingKey::from("invoices"),
            "invoice-1",
        ));
        assert!(eventually(WAIT, || spy.payloads() == vec!["invoice-1"]).await);

        within(WAIT, dispatcher.end()).await.unwrap();
        assert_eq!(bus.disposed_channels(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_faulted_consumer_is_removed() {
        let bus = InMemoryBus::new();
        let (dispatcher, _) = dispatcher(vec![
            subscription(&bus, "orders", "order_placed", 1),
            subscription(&bus, "broken", "unmapped", 1),
        ]);

        dispatcher.receive().unwrap();
        bus.enqueue(Message::of_type(
            MessageType::Event,
            RoutingKey::from("broken"),
            "oops",
        ));

        assert!(eventually(WAIT, || dispatcher.consumers().len() == 1).await);
        assert_eq!(dispatcher.state(), DispatcherState::Running);
        assert_eq!(bus.rejected().len(), 1);

        within(WAIT, dispatcher.end()).await.unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_consumer_is_removed() {
        let bus = InMemoryBus::new();
        let mappers = MessageMapperRegistry::new();
        mappers.register("order_placed", TestRequest::event_mapper());

        let dispatcher = Dispatcher::builder()
            .processor(Arc::new(SpyCommandProcessor::responding(|request| {
                let poisoned = request
                    .downcast_ref::<TestRequest>()
                    .is_some_and(|r| r.payload == "poison");
                if poisoned {
                    panic!("handler crashed");
                }
                Ok(())
            })))
            .subscriptions(vec![
                subscription(&bus, "orders", "order_placed", 1),
                subscription(&bus, "invoices", "order_placed", 1),
            ])
            .mappers(mappers)
            .build()
            .unwrap();

        dispatcher.receive().unwrap();
        let job = dispatcher
            .jobs()
            .into_iter()
            .find(|job| job.name().starts_with("orders-"))
            .unwrap();

        bus.enqueue(Message::of_type(
            MessageType::Event,
            RoutingKey::from("orders"),
            "poison",
        ));

        let fault = within(WAIT, job.wait()).await.unwrap().unwrap_err();
        assert!(matches!(*fault, Error::PumpFaulted { .. }));

        assert!(eventually(WAIT, || dispatcher.consumers().len() == 1).await);
        assert_eq!(dispatcher.consumers()[0].subscription.as_str(), "invoices");
        assert_eq!(dispatcher.state(), DispatcherState::Running);

        within(WAIT, dispatcher.end()).await.unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_active_performers() {
        let bus = InMemoryBus::new();
        let (dispatcher, _) = dispatcher(vec![subscription(&bus, "orders", "order_placed", 1)]);

        dispatcher.receive().unwrap();

        dispatcher.set_active_performers("orders", 3).unwrap();
        assert_eq!(open_count(&dispatcher, "orders"), 3);

        dispatcher.set_active_performers("orders", 1).unwrap();
        assert_eq!(open_count(&dispatcher, "orders"), 1);
        assert!(eventually(WAIT, || dispatcher.consumers().len() == 1).await);

        let state = dispatcher.get_state();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].performers, 1);
        assert_eq!(state[0].consumers.len(), 1);
        assert_eq!(state[0].consumers[0].state, ConsumerState::Open);

        within(WAIT, dispatcher.end()).await.unwrap();
    }

    #[test]
    fn test_set_active_performers_before_receive() {
        let bus = InMemoryBus::new();
        let (dispatcher, _) = dispatcher(vec![subscription(&bus, "orders", "order_placed", 3)]);

        dispatcher.set_active_performers("orders", 2).unwrap();
        assert_eq!(dispatcher.consumers().len(), 2);

        dispatcher.set_active_performers("orders", 4).unwrap();
        assert_eq!(dispatcher.consumers().len(), 4);
        assert_eq!(dispatcher.get_state()[0].performers, 4);
    }
}
