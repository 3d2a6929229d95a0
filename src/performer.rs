//! Binds one channel to one pump and runs it on its own thread.

use std::{sync::Arc, thread};

use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use snafu::ResultExt;
use tokio::sync::oneshot;

use crate::{
    channel::{AsyncChannel, Channel},
    error::{Error, Result, SpawnSnafu},
    mapper::MessageMapperRegistry,
    message::Message,
    processor::CommandProcessor,
    pump::{MessagePump, Proactor, PumpExit, Reactor},
    subscription::{ChannelName, MessagePumpType, RoutingKey, Subscription},
};

/// Completion of a pump. The error is shared so every waiter can inspect it.
pub type JobResult = std::result::Result<PumpExit, Arc<Error>>;

/// Handle to a running pump; cloning it yields another waiter on the same run.
#[derive(Clone)]
pub struct Job {
    name: String,
    done: Shared<BoxFuture<'static, JobResult>>,
}

impl Job {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves once the pump has stopped.
    pub fn wait(&self) -> Shared<BoxFuture<'static, JobResult>> {
        self.done.clone()
    }

    /// Whether the pump has stopped, whether or not anyone awaited the job.
    pub fn is_finished(&self) -> bool {
        self.done.peek().is_some() || self.done.clone().now_or_never().is_some()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// The channel a performer drives, kept so it can inject the quit signal.
#[derive(Clone)]
pub enum ChannelRef {
    Blocking(Arc<dyn Channel>),
    Cooperative(Arc<dyn AsyncChannel>),
}

impl ChannelRef {
    pub fn name(&self) -> &ChannelName {
        match self {
            Self::Blocking(channel) => channel.name(),
            Self::Cooperative(channel) => channel.name(),
        }
    }

    pub fn enqueue(&self, message: Message) {
        match self {
            Self::Blocking(channel) => channel.enqueue(message),
            Self::Cooperative(channel) => channel.enqueue(message),
        }
    }
}

pub struct Performer {
    channel: ChannelRef,
    pump: Option<Box<dyn MessagePump>>,
}

impl Performer {
    pub fn new(channel: ChannelRef, pump: Box<dyn MessagePump>) -> Self {
        Self {
            channel,
            pump: Some(pump),
        }
    }

    /// Creates a fresh channel from the subscription's factory and the pump
    /// flavor it asks for.
    pub fn for_subscription(
        subscription: Arc<Subscription>,
        processor: Arc<dyn CommandProcessor>,
        mappers: MessageMapperRegistry,
    ) -> Result<Self> {
        let factory = subscription.channel_factory().clone();
        let channel_fault = |source| Error::ChannelFault {
            channel: subscription.channel_name().to_string(),
            source,
        };

        match subscription.message_pump_type() {
            MessagePumpType::Reactor => {
                let channel = factory
                    .create_channel(&subscription)
                    .map_err(channel_fault)?;
                let pump = Reactor::new(channel.clone(), processor, mappers, subscription);
                Ok(Self::new(ChannelRef::Blocking(channel), Box::new(pump)))
            }
            MessagePumpType::Proactor => {
                let channel = factory
                    .create_async_channel(&subscription)
                    .map_err(channel_fault)?;
                let pump = Proactor::new(channel.clone(), processor, mappers, subscription);
                Ok(Self::new(ChannelRef::Cooperative(channel), Box::new(pump)))
            }
        }
    }

    pub fn channel(&self) -> &ChannelRef {
        &self.channel
    }

    /// Starts the pump on a dedicated thread named `name`.
    ///
    /// A performer runs its pump once. A panic on the pump thread resolves
    /// the job with [`Error::PumpFaulted`].
    pub fn run(&mut self, name: &str) -> Result<Job> {
        let pump = self
            .pump
            .take()
            .ok_or_else(|| Error::invalid_state("run performer", "already started"))?;

        let (tx, rx) = oneshot::channel::<JobResult>();

        tracing::debug!(
            channel = %self.channel.name(),
            pump_type = %pump.pump_type(),
            "Starting performer"
        );

        thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let result = pump.run().map_err(Arc::new);
                if tx.send(result).is_err() {
                    tracing::debug!("Pump finished with nobody waiting");
                }
            })
            .context(SpawnSnafu {
                channel: self.channel.name().as_str(),
            })?;

        let consumer = name.to_owned();
        let done = rx
            .map(move |received| {
                received.unwrap_or_else(|_| Err(Arc::new(Error::PumpFaulted { consumer })))
            })
            .boxed()
            .shared();

        Ok(Job {
            name: name.to_owned(),
            done,
        })
    }

    /// Asks the pump to stop once it has drained what is ahead of the quit message.
    pub fn stop(&self, routing_key: &RoutingKey) {
        tracing::debug!(channel = %self.channel.name(), %routing_key, "Stopping performer");
        self.channel.enqueue(Message::quit(routing_key.clone()));
    }
}
