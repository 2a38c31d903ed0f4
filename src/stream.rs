//! Contains the [StreamName] type, the unique identifier of an
//! [Event Stream][crate::event::Stream] inside an
//! [Event Store][crate::event::store::Store].

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// An opaque, immutable identifier for one ordered Event Stream.
///
/// Stream names are typically derived from an entity type name and
/// the identifier of one of its instances, e.g. `"Order-42"`.
/// Use [`StreamName::for_entity`] to apply this convention, or construct
/// the name directly from a string when a custom mapping is needed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamName(String);

impl StreamName {
    /// Derives the [StreamName] for an entity instance, using the
    /// `"{Type}-{id}"` convention.
    pub fn for_entity<S>(id: &S::Id) -> Self
    where
        S: crate::state::State,
    {
        Self(format!("{}-{}", S::type_name(), id))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StreamName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamName {
    fn from(name: &str) -> Self {
        Self(name.into())
    }
}

impl From<String> for StreamName {
    fn from(name: String) -> Self {
        Self(name.into())
    }
}
