use std::{any::Any, sync::Arc};

use serde::Deserialize;
use service_activator::{
    channel::in_memory::InMemoryBus,
    config::Config,
    mapper::{MessageMapperRegistry, Request, RequestKind},
    message::{Message, MessageType},
    processor::{CommandProcessor, HandlerError},
    subscription::RoutingKey,
    Dispatcher,
};

/// Event carrying a line of text.
#[derive(Debug)]
struct Greeting {
    id: String,
    text: String,
}

impl Request for Greeting {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> RequestKind {
        RequestKind::Event
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Command decoded from a JSON body.
#[derive(Debug, Deserialize)]
struct PlaceOrder {
    #[serde(skip)]
    id: String,
    order_id: String,
    quantity: u32,
}

impl Request for PlaceOrder {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> RequestKind {
        RequestKind::Command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn map_greeting(message: &Message) -> eyre::Result<Box<dyn Request>> {
    Ok(Box::new(Greeting {
        id: message.id.to_string(),
        text: message.body.value(),
    }))
}

fn map_place_order(message: &Message) -> eyre::Result<Box<dyn Request>> {
    let mut order: PlaceOrder = serde_json::from_slice(message.body.bytes())?;
    order.id = message.id.to_string();
    Ok(Box::new(order))
}

/// Logs every request it receives.
struct LoggingProcessor;

impl CommandProcessor for LoggingProcessor {
    fn send(&self, request: &dyn Request) -> Result<(), HandlerError> {
        let order = request
            .downcast_ref::<PlaceOrder>()
            .ok_or_else(|| HandlerError::configuration("no handler for command"))?;

        tracing::info!(
            request_id = request.id(),
            order_id = %order.order_id,
            quantity = order.quantity,
            "Placed order"
        );
        Ok(())
    }

    fn publish(&self, request: &dyn Request) -> Result<(), HandlerError> {
        match request.downcast_ref::<Greeting>() {
            Some(greeting) => {
                tracing::info!(request_id = request.id(), text = %greeting.text, "Greeted")
            }
            None => tracing::debug!(request_id = request.id(), "No handlers for event"),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    service_activator::init_tracing()?;

    let config = Config::load()?;
    let bus = InMemoryBus::new();

    let mappers = MessageMapperRegistry::new();
    mappers
        .register("greeting", map_greeting)
        .register("order", map_place_order);

    let dispatcher = Dispatcher::builder()
        .processor(Arc::new(LoggingProcessor))
        .subscriptions(vec![
            config.subscription(
                "greetings",
                "greetings.queue",
                "greetings",
                "greeting",
                Arc::new(bus.clone()),
            ),
            config.subscription(
                "orders",
                "orders.queue",
                "orders",
                "order",
                Arc::new(bus.clone()),
            ),
        ])
        .mappers(mappers)
        .host_name(config.host_name())
        .build()?;

    dispatcher.receive()?;

    for (topic, message_type, body) in [
        ("greetings", MessageType::Event, "hello"),
        ("orders", MessageType::Command, r#"{"order_id": "order-1", "quantity": 2}"#),
        ("orders", MessageType::Command, "not json"),
        ("greetings", MessageType::Document, "world"),
    ] {
        bus.enqueue(Message::of_type(message_type, RoutingKey::from(topic), body));
    }

    tracing::info!(
        host_name = dispatcher.host_name(),
        "Dispatcher running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;

    dispatcher.end().await;
    tracing::info!(state = %dispatcher.state(), "Shutdown complete");

    Ok(())
}
