//! This module contains the definition of a [Message] type, which
//! can be used to describe some sort of domain value such as a
//! [Domain Event][crate::event::Envelope] or a
//! [Domain Command][crate::command::Envelope].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Represents a piece of domain data that occurs in the system.
///
/// Each Message has a specific name to it, which should ideally be
/// unique within the domain you're operating in. Example: a Domain Event
/// that represents when an Order was placed can have a `name()`: `"OrderWasPlaced"`.
///
/// The name is used as the stable type identifier for dispatch: the
/// [state folding][crate::state::Fold] reducer table and the
/// [serialization registry][crate::serde::Registry] are both keyed by it.
pub trait Message {
    /// Returns the domain name of the [Message].
    fn name(&self) -> &'static str;
}

/// Optional metadata to attach to an [Envelope] to provide additional context
/// to the [Message] carried out.
pub type Metadata = HashMap<String, String>;

/// Represents a [Message] packaged for persistance and/or processing by other
/// parts of the system.
///
/// It carries the actual message (i.e. a payload), a unique message id,
/// and some optional [Metadata].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T>
where
    T: Message,
{
    /// Unique identifier of the message.
    pub id: Uuid,
    /// The message payload.
    pub message: T,
    /// Optional metadata to provide additional context to the message.
    pub metadata: Metadata,
}

impl<T> Envelope<T>
where
    T: Message,
{
    /// Adds a new entry in the [Envelope]'s [Metadata].
    #[must_use]
    pub fn with_metadata(mut self, key: String, value: String) -> Self {
        self.metadata.insert(key, value);
        self
    }
}

impl<T> From<T> for Envelope<T>
where
    T: Message,
{
    fn from(message: T) -> Self {
        Envelope {
            id: Uuid::new_v4(),
            message,
            metadata: Metadata::default(),
        }
    }
}

impl<T> PartialEq for Envelope<T>
where
    T: Message + PartialEq,
{
    fn eq(&self, other: &Envelope<T>) -> bool {
        self.message == other.message
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct StringMessage(pub(crate) &'static str);

    impl Message for StringMessage {
        fn name(&self) -> &'static str {
            "string_payload"
        }
    }

    #[test]
    fn message_with_metadata_does_not_affect_equality() {
        let message = Envelope::from(StringMessage("hello"));

        let new_message = message
            .clone()
            .with_metadata("hello_world".into(), "test".into())
            .with_metadata("test_number".into(), 1.to_string());

        // Neither the message id nor the metadata affect equality.
        assert_eq!(message, new_message);
    }
}
