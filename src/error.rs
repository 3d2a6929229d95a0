use snafu::Snafu;

use crate::{channel::ChannelError, message::MessageId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Wiring defect: missing mapper, mismatched request kind, bad subscription.
    #[snafu(display("Configuration error: {message}"))]
    Configuration { message: String },

    #[snafu(display("Channel {channel} failed while receiving"))]
    ChannelFault {
        channel: String,
        #[snafu(source)]
        source: ChannelError,
    },

    #[snafu(display(
        "Could not receive message from {channel}; an empty channel must yield a None message on timeout"
    ))]
    MissingMessage { channel: String },

    #[snafu(display("Dispatcher cannot {operation} while {state}"))]
    InvalidState { operation: String, state: String },

    #[snafu(display("Subscription {name} not found"))]
    SubscriptionNotFound { name: String },

    #[snafu(display("Message pump for {consumer} terminated abnormally"))]
    PumpFaulted { consumer: String },

    #[snafu(display("Failed to spawn pump thread for {channel}"))]
    Spawn {
        channel: String,
        #[snafu(source)]
        source: std::io::Error,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Whatever {
            message: format!("{e}"),
            source: Some(e),
        }
    }
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn missing_mapper(request_type: impl std::fmt::Display, message_id: &MessageId) -> Self {
        Self::Configuration {
            message: format!("No message mapper found for type {request_type} for message {message_id}"),
        }
    }

    pub fn subscription_not_found(name: impl Into<String>) -> Self {
        Self::SubscriptionNotFound { name: name.into() }
    }

    pub fn invalid_state(operation: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// True for faults that stop a single pump because of a wiring defect.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}
