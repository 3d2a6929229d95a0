//! Control-flow policy shared by both pump flavors.
//!
//! The reactor and the proactor differ only in how they wait. Everything
//! that decides what happens to a message lives here so the two loops
//! cannot drift apart: classifying control markers, turning a dispatch
//! result into an [`Outcome`], bounding requeues and tracking the
//! unacceptable-message window.

use std::time::{Duration, Instant};

use snafu::Snafu;

use crate::{
    error::Error,
    mapper::{RequestKind, TranslateError},
    message::{Message, MessageId, MessageType},
    processor::HandlerError,
    subscription::{SettlePolicy, Subscription},
};

/// What a received message asks of the loop before any translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// Nothing arrived; back off and poll again
    Idle,
    /// The transport could not parse the data
    Unacceptable,
    /// Stop the loop
    Quit,
    /// Translate and dispatch along the given route
    Serviceable(Route),
}

impl Receipt {
    pub fn classify(message: &Message) -> Self {
        match message.message_type() {
            MessageType::None => Self::Idle,
            MessageType::Unacceptable => Self::Unacceptable,
            MessageType::Quit => Self::Quit,
            MessageType::Command => Self::Serviceable(Route::Send),
            MessageType::Event | MessageType::Document => Self::Serviceable(Route::Publish),
        }
    }
}

/// How a serviceable message reaches the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Send,
    Publish,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DispatchError {
    #[snafu(context(false), display("{source}"))]
    Translate { source: TranslateError },

    #[snafu(display("Message {message_id} of type {message_type} cannot carry a {kind} request"))]
    KindMismatch {
        message_id: MessageId,
        message_type: MessageType,
        kind: RequestKind,
    },

    #[snafu(context(false), display("{source}"))]
    Handler { source: HandlerError },
}

/// How the loop settles a message after dispatch.
#[derive(Debug)]
pub enum Outcome {
    Acknowledge,
    Requeue,
    Reject,
    /// Reject, dispose the channel and end the pump with this error.
    Stop(Error),
}

/// What to do with a deferred message once its handled count is updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    After(Duration),
    Exhausted(SettlePolicy),
}

/// Counts unacceptable messages within a resetting window.
///
/// The window opens on the first counted message. Once it has elapsed the
/// count resets wholesale; it does not slide.
#[derive(Debug, Clone)]
pub struct UnacceptableMessageLimiter {
    limit: u32,
    window: Option<Duration>,
    count: u32,
    window_start: Option<Instant>,
}

impl UnacceptableMessageLimiter {
    pub fn new(limit: u32, window: Option<Duration>) -> Self {
        Self {
            limit,
            window,
            count: 0,
            window_start: None,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn record(&mut self, now: Instant) {
        self.reset_if_elapsed(now);
        if self.count == 0 {
            self.window_start = Some(now);
        }
        self.count = self.count.saturating_add(1);
    }

    pub fn limit_reached(&mut self, now: Instant) -> bool {
        if self.limit == 0 {
            return false;
        }
        self.reset_if_elapsed(now);
        self.count >= self.limit
    }

    fn reset_if_elapsed(&mut self, now: Instant) {
        let (Some(window), Some(start)) = (self.window, self.window_start) else {
            return;
        };

        if now.saturating_duration_since(start) >= window {
            self.count = 0;
            self.window_start = None;
        }
    }
}

/// Per-pump policy built from a subscription. Owned by exactly one loop.
#[derive(Debug, Clone)]
pub struct PumpPolicy {
    timeout: Duration,
    empty_channel_delay: Duration,
    channel_failure_delay: Duration,
    requeue_limit: Option<u32>,
    requeue_delay: Duration,
    requeue_exhausted: SettlePolicy,
    on_unhandled_error: SettlePolicy,
    limiter: UnacceptableMessageLimiter,
}

impl PumpPolicy {
    pub fn from_subscription(subscription: &Subscription) -> Self {
        Self {
            timeout: subscription.timeout(),
            empty_channel_delay: subscription.empty_channel_delay(),
            channel_failure_delay: subscription.channel_failure_delay(),
            requeue_limit: subscription.requeue_limit(),
            requeue_delay: subscription.requeue_delay(),
            requeue_exhausted: subscription.requeue_exhausted(),
            on_unhandled_error: subscription.on_unhandled_error(),
            limiter: UnacceptableMessageLimiter::new(
                subscription.unacceptable_message_limit(),
                subscription.unacceptable_message_limit_window(),
            ),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn empty_channel_delay(&self) -> Duration {
        self.empty_channel_delay
    }

    pub fn channel_failure_delay(&self) -> Duration {
        self.channel_failure_delay
    }

    pub fn requeue_limit(&self) -> Option<u32> {
        self.requeue_limit
    }

    pub fn unacceptable_count(&self) -> u32 {
        self.limiter.count()
    }

    pub fn record_unacceptable(&mut self) {
        self.limiter.record(Instant::now());
    }

    pub fn unacceptable_limit_reached(&mut self) -> bool {
        self.limiter.limit_reached(Instant::now())
    }

    /// Bumps the handled count and decides whether another requeue is allowed.
    pub fn requeue(&self, message: &mut Message, channel: &str) -> Requeue {
        message.update_handled_count();

        match self.requeue_limit {
            Some(limit) if message.requeue_limit_exceeded(limit) => {
                match message.original_message_id() {
                    Some(original_id) => tracing::error!(
                        channel,
                        message_id = %message.id,
                        original_message_id = %original_id,
                        "Message has been requeued {} times; dropping it",
                        limit
                    ),
                    None => tracing::error!(
                        channel,
                        message_id = %message.id,
                        "Message has been requeued {} times; dropping it",
                        limit
                    ),
                }
                Requeue::Exhausted(self.requeue_exhausted)
            }
            _ => Requeue::After(self.requeue_delay),
        }
    }

    /// Turns the result of translate and dispatch into a settlement.
    ///
    /// Mapping failures are counted toward the unacceptable limit here.
    pub fn outcome(
        &mut self,
        message: &Message,
        channel: &str,
        result: Result<(), DispatchError>,
    ) -> Outcome {
        let error = match result {
            Ok(()) => return Outcome::Acknowledge,
            Err(error) => error,
        };

        match error {
            DispatchError::Translate {
                source:
                    TranslateError::MissingMapper {
                        request_type,
                        message_id,
                    },
            } => Outcome::Stop(Error::missing_mapper(request_type, &message_id)),
            DispatchError::Translate { source } => {
                tracing::warn!(
                    channel,
                    message_id = %message.id,
                    "Failed to map message: {source}"
                );
                if let TranslateError::Mapping { source, .. } = &source {
                    tracing::debug!(channel, message_id = %message.id, "Mapper error: {source:?}");
                }
                self.record_unacceptable();
                Outcome::Acknowledge
            }
            error @ DispatchError::KindMismatch { .. } => {
                Outcome::Stop(Error::configuration(error.to_string()))
            }
            DispatchError::Handler { source } => self.handler_outcome(message, channel, source),
        }
    }

    fn handler_outcome(&self, message: &Message, channel: &str, error: HandlerError) -> Outcome {
        let mut errors = Vec::new();
        flatten(error, &mut errors);

        if errors.iter().any(|e| matches!(e, HandlerError::Defer { .. })) {
            tracing::debug!(channel, message_id = %message.id, "Deferring message");
            return Outcome::Requeue;
        }

        if let Some(HandlerError::Configuration { message: reason }) = errors
            .iter()
            .find(|e| matches!(e, HandlerError::Configuration { .. }))
        {
            return Outcome::Stop(Error::configuration(reason.clone()));
        }

        for error in &errors {
            tracing::error!(
                channel,
                message_id = %message.id,
                "Failed to dispatch message: {error}"
            );
        }

        match self.on_unhandled_error {
            SettlePolicy::Acknowledge => Outcome::Acknowledge,
            SettlePolicy::Reject => Outcome::Reject,
        }
    }
}

fn flatten(error: HandlerError, into: &mut Vec<HandlerError>) {
    match error {
        HandlerError::Aggregate { errors } => {
            for error in errors {
                flatten(error, into);
            }
        }
        other => into.push(other),
    }
}
