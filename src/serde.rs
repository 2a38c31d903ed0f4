//! This module provides traits and implementations for serialization and
//! deserialization, allowing you to convert Domain Events to and from
//! their persisted byte-level representation.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::message;

/// A serializer interface that can be used to serialize a Rust data type
/// into a specific wire format as a byte array.
pub trait Serializer<T>: Send + Sync {
    /// Serializes the given value into the protocol supported by this implementation.
    ///
    /// # Errors
    ///
    /// An error ([`anyhow::Error`]) is returned in case the serialization could not
    /// succeed as expected.
    fn serialize(&self, value: T) -> anyhow::Result<Vec<u8>>;
}

/// A deserializer interface that can be used to deserialize a byte array
/// into an instance of a specific Rust data type from a specific wire format.
pub trait Deserializer<T>: Send + Sync {
    /// Deserializes the given value from a message encoded in the wire format
    /// supported by this implementation.
    ///
    /// # Errors
    ///
    /// An error ([`anyhow::Error`]) is returned in case the deserialization could not
    /// succeed as expected.
    fn deserialize(&self, data: &[u8]) -> anyhow::Result<T>;
}

/// [Serializer] and [Deserializer] that can be used to serialize into and deserialize
/// from a given type into a specific wire format, such as JSON.
pub trait Serde<T>: Serializer<T> + Deserializer<T> + Send + Sync {}

impl<S, T> Serde<T> for S where S: Serializer<T> + Deserializer<T> {}

/// Implements the [Serializer] and [Deserializer] traits, which use the [serde] crate
/// to serialize and deserialize a message into JSON.
#[derive(Debug, Clone, Copy)]
pub struct Json<T>(PhantomData<T>)
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>;

impl<T> Default for Json<T>
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Serializer<T> for Json<T>
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    fn serialize(&self, value: T) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(&value)
            .map_err(|err| anyhow!("failed to serialize value to json: {}", err))
    }
}

impl<T> Deserializer<T> for Json<T>
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    fn deserialize(&self, data: &[u8]) -> anyhow::Result<T> {
        serde_json::from_slice(data)
            .map_err(|err| anyhow!("failed to deserialize value from json: {}", err))
    }
}

/// The byte-level representation of a Domain Event, as persisted by
/// backend adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// The stable type identifier of the serialized message, i.e. its
    /// [`name()`][message::Message::name].
    pub type_name: String,

    /// The content type of the encoded payload, e.g. `"application/json"`.
    pub content_type: String,

    /// The encoded message payload.
    pub bytes: Vec<u8>,
}

/// This error is returned by [`Registry::try_register`] when a type name
/// has already been registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("message type is already registered: {name}")]
pub struct DuplicateType {
    /// The type name that was registered twice.
    pub name: &'static str,
}

/// All possible error types returned by [`Registry::serialize`].
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    /// The message type has not been registered in the [Registry].
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The underlying codec failed to encode the message.
    #[error("failed to encode message: {0}")]
    Codec(#[from] anyhow::Error),
}

/// All possible error types returned by [`Registry::deserialize`].
///
/// Deserialization failures are tagged with their reason, so that a
/// delivery pipeline can report them per message instead of crashing.
#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    /// The message type has not been registered in the [Registry].
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The encoded payload uses a different content type than the
    /// one supported by the [Registry]'s codec.
    #[error("content type mismatch: expected {expected}, found {actual}")]
    ContentTypeMismatch {
        /// The content type supported by the [Registry].
        expected: &'static str,
        /// The content type found in the encoded message.
        actual: String,
    },

    /// The encoded payload is empty.
    #[error("empty payload for message type: {0}")]
    EmptyPayload(String),

    /// The underlying codec failed to decode the message.
    #[error("failed to decode message: {0}")]
    Codec(#[from] anyhow::Error),
}

/// An explicitly constructed registry of the message types known to the
/// application, bound to the [Serde] codec used to convert them to and
/// from their [Encoded] representation.
///
/// The registry is built once at application start, and duplicate
/// registrations are detected at construction time. Prefer passing a
/// [Registry] instance where needed over process-wide singletons, to
/// avoid shared mutable state across concurrent test runs.
#[derive(Clone)]
pub struct Registry<T>
where
    T: message::Message,
{
    serde: Arc<dyn Serde<T>>,
    content_type: &'static str,
    known_types: HashSet<&'static str>,
}

impl<T> std::fmt::Debug for Registry<T>
where
    T: message::Message,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("content_type", &self.content_type)
            .field("known_types", &self.known_types)
            .finish_non_exhaustive()
    }
}

impl<T> PartialEq for Registry<T>
where
    T: message::Message,
{
    fn eq(&self, other: &Self) -> bool {
        self.content_type == other.content_type && self.known_types == other.known_types
    }
}

impl<T> Registry<T>
where
    T: message::Message,
{
    /// Creates a new [Registry] using the specified codec and the content
    /// type it produces.
    pub fn new<S>(serde: S, content_type: &'static str) -> Self
    where
        S: Serde<T> + 'static,
    {
        Self {
            serde: Arc::new(serde),
            content_type,
            known_types: HashSet::default(),
        }
    }

    /// Registers a new message type name in the [Registry].
    ///
    /// # Errors
    ///
    /// Fails with [DuplicateType] if the type name has already
    /// been registered.
    pub fn try_register(mut self, name: &'static str) -> Result<Self, DuplicateType> {
        if !self.known_types.insert(name) {
            return Err(DuplicateType { name });
        }

        Ok(self)
    }

    /// Registers a new message type name in the [Registry].
    ///
    /// # Panics
    ///
    /// Panics if the type name has already been registered. Use
    /// [`Registry::try_register`] to handle the failure instead.
    #[must_use]
    #[track_caller]
    pub fn register(self, name: &'static str) -> Self {
        match self.try_register(name) {
            Ok(registry) => registry,
            Err(err) => panic!("{err}"),
        }
    }

    /// Serializes the given message into its [Encoded] representation,
    /// carrying the type name and content type alongside the payload bytes.
    pub fn serialize(&self, message: T) -> Result<Encoded, SerializeError> {
        let type_name = message.name();

        if !self.known_types.contains(type_name) {
            return Err(SerializeError::UnknownType(type_name.to_owned()));
        }

        let bytes = self.serde.serialize(message)?;

        Ok(Encoded {
            type_name: type_name.to_owned(),
            content_type: self.content_type.to_owned(),
            bytes,
        })
    }

    /// Deserializes a message from its [Encoded] representation.
    pub fn deserialize(&self, encoded: &Encoded) -> Result<T, DeserializeError> {
        if encoded.content_type != self.content_type {
            return Err(DeserializeError::ContentTypeMismatch {
                expected: self.content_type,
                actual: encoded.content_type.clone(),
            });
        }

        if !self.known_types.contains(encoded.type_name.as_str()) {
            return Err(DeserializeError::UnknownType(encoded.type_name.clone()));
        }

        if encoded.bytes.is_empty() {
            return Err(DeserializeError::EmptyPayload(encoded.type_name.clone()));
        }

        Ok(self.serde.deserialize(&encoded.bytes)?)
    }
}

/// The content type produced by the [Json] codec.
pub const CONTENT_TYPE_JSON: &str = "application/json";
