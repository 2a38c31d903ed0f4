//! Contains the types necessary for Optimistic Locking through versioning.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// The zero-based position of an Event within its Event Stream.
///
/// The [Version] of a Stream is the position of its last recorded Event,
/// and is the value used for optimistic concurrency [checks][Check] when
/// appending new Domain Events through an
/// [`Appender`][crate::event::store::Appender].
pub type Version = u64;

/// Used to set a specific expectation during an operation
/// that mutates some sort of resource (e.g. an [Event Stream][crate::event::Stream])
/// that supports versioning.
///
/// It allows for optimistic locking, avoiding data races
/// when modifying the same resource at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Check {
    /// Disables any kind of optimistic locking check, allowing
    /// for any [Version] to be used compared to the new one.
    Any,

    /// Expects that the Event Stream does not exist (or is empty)
    /// for the operation to succeed.
    NoStream,

    /// Expects that the previous [Version] used for the operation
    /// must have the value specified.
    MustBe(Version),
}

impl Display for Check {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Check::Any => f.write_str("any"),
            Check::NoStream => f.write_str("no stream"),
            Check::MustBe(version) => write!(f, "{version}"),
        }
    }
}

/// This error is returned by a function when a version conflict error has
/// been detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("conflict error detected, expected version was: {expected}, found: {actual:?}")]
pub struct ConflictError {
    /// The [Check] that was expected when calling the function that failed.
    pub expected: Check,

    /// The actual [Version] value, which mismatch caused this error.
    /// `None` means the Event Stream does not exist.
    pub actual: Option<Version>,
}
