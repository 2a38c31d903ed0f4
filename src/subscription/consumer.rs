//! Contains the [Consumer] pipeline: the component that fans one stored
//! Domain Event out to all registered [EventHandler]s, and combines the
//! per-handler outcomes into a single per-message verdict.
//!
//! Handlers run concurrently: there is no ordering guarantee across
//! different handlers for one message, only within one handler's own
//! message sequence. A failing handler cannot block delivery to the
//! others: its error is captured as a failure entry in the combined
//! [Outcome].

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::{event, message};

/// The outcome reported by one [EventHandler] for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handling {
    /// The handler processed the message successfully.
    Success,

    /// The handler does not care about this message type.
    Ignored,

    /// The handler has taken the message in, but is still working on it:
    /// the message must not be acknowledged yet.
    Pending,
}

/// The captured failure of one [EventHandler] for one message.
#[derive(Debug)]
pub struct HandlerFailure {
    /// The diagnostic name of the failing handler.
    pub handler: &'static str,

    /// The error the handler failed with.
    pub error: anyhow::Error,
}

/// The combined verdict for one message, aggregated over all the
/// registered [EventHandler]s.
///
/// The distinction between [`Outcome::Ignored`] ("no handler cared") and
/// [`Outcome::Pending`] ("a handler is still working") is load-bearing:
/// acknowledgement logic advances delivery on the former, and holds it
/// back on the latter.
#[derive(Debug)]
pub enum Outcome {
    /// At least one handler processed the message successfully, and
    /// none failed nor is still working.
    Handled,

    /// Every handler ignored the message.
    Ignored,

    /// At least one handler is still working on the message, and none
    /// failed.
    Pending,

    /// At least one handler failed.
    Failed(Vec<HandlerFailure>),
}

impl Outcome {
    /// Returns whether the message can be acknowledged, advancing the
    /// delivery position past it.
    pub fn acknowledges(&self) -> bool {
        matches!(self, Outcome::Handled | Outcome::Ignored)
    }
}

/// A software component that is able to process stored Domain Events
/// delivered by a [Subscription][crate::subscription::Subscription].
#[async_trait]
pub trait EventHandler<Evt>: Send + Sync + 'static
where
    Evt: message::Message + Send + Sync,
{
    /// A diagnostic name for the handler, used in logs and failure
    /// entries.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Processes one stored Domain Event.
    ///
    /// Errors returned here are captured as [HandlerFailure] entries by
    /// the [Consumer], not propagated: one failing handler cannot block
    /// delivery to the others.
    async fn handle(&self, event: &event::Persisted<Evt>) -> anyhow::Result<Handling>;
}

/// Fans each message out to all registered [EventHandler]s concurrently,
/// and combines their outcomes into a single [Outcome] per message.
pub struct Consumer<Evt>
where
    Evt: message::Message + Send + Sync,
{
    handlers: Vec<Arc<dyn EventHandler<Evt>>>,
}

impl<Evt> Default for Consumer<Evt>
where
    Evt: message::Message + Send + Sync,
{
    fn default() -> Self {
        Self {
            handlers: Vec::default(),
        }
    }
}

impl<Evt> Consumer<Evt>
where
    Evt: message::Message + Send + Sync + 'static,
{
    /// Creates a new [Consumer] with no registered handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new [EventHandler] in the pipeline.
    #[must_use]
    pub fn add_handler<H>(mut self, handler: H) -> Self
    where
        H: EventHandler<Evt>,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Returns whether the pipeline has no registered handlers.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Delivers one stored Domain Event to every registered handler,
    /// concurrently, and combines the per-handler outcomes.
    pub async fn consume(&self, event: &event::Persisted<Evt>) -> Outcome {
        let results = join_all(self.handlers.iter().map(|handler| async move {
            (handler.name(), handler.handle(event).await)
        }))
        .await;

        let mut failures = Vec::new();
        let mut pending = false;
        let mut handled = false;

        for (name, result) in results {
            match result {
                Ok(Handling::Success) => handled = true,
                Ok(Handling::Ignored) => (),
                Ok(Handling::Pending) => pending = true,
                Err(error) => {
                    tracing::error!(
                        handler.name = name,
                        error = %error,
                        "event handler failed"
                    );

                    failures.push(HandlerFailure {
                        handler: name,
                        error,
                    });
                }
            }
        }

        if !failures.is_empty() {
            Outcome::Failed(failures)
        } else if pending {
            Outcome::Pending
        } else if handled {
            Outcome::Handled
        } else {
            Outcome::Ignored
        }
    }
}
