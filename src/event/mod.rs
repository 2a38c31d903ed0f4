//! Module `event` contains types and abstractions helpful for working
//! with Domain Events.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::message;
use crate::stream::StreamName;
use crate::version::Version;

pub mod store;

/// An Event is a [Message][message::Message] carrying the information about
/// a Domain Event, an occurrence in the system lifetime that is relevant
/// for the Domain that is being implemented.
pub type Envelope<T> = message::Envelope<T>;

/// An [Event][Envelope] that has been persisted to the Event
/// [Store][store::Store].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persisted<Evt>
where
    Evt: message::Message,
{
    /// The name of the Event Stream the persisted Event belongs to.
    pub stream_id: StreamName,

    /// The zero-based position of this Event within its Event Stream.
    ///
    /// This value is used for optimistic concurrency checks, to avoid
    /// data races in parallel command evaluations.
    pub version: Version,

    /// The position of this Event in the store-wide event log, across
    /// all Event Streams. Monotonically increasing, assigned by the
    /// Event Store at append time.
    ///
    /// Subscriptions use this value to track their progress through
    /// [checkpoints][crate::checkpoint].
    pub global_position: u64,

    /// The instant the Event was recorded by the Event Store.
    pub recorded_at: DateTime<Utc>,

    /// The actual Domain Event carried by this envelope.
    pub event: Envelope<Evt>,
}

impl<Evt> PartialEq for Persisted<Evt>
where
    Evt: message::Message + PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.stream_id == other.stream_id
            && self.version == other.version
            && self.global_position == other.global_position
            && self.event == other.event
    }
}

/// Specifies the slice of the Event Stream to select when calling
/// [`Streamer::read`][store::Streamer::read].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelect {
    /// Selects all [Events][Envelope] in the Event [Stream].
    All,

    /// Selects all [Events][Envelope] in the Event [Stream] starting from
    /// the Event with the specified [Version].
    From(Version),
}

/// Specifies the slice of the store-wide event log to select when calling
/// [`AllStreamer::read_all`][store::AllStreamer::read_all].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSelect {
    /// Selects all the Events in the store-wide event log.
    All,

    /// Selects all the Events starting from the specified global position.
    From(u64),
}

/// Caps the number of [Events][Envelope] returned by a read operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadLimit {
    /// No limit: reads until the end of the selected slice.
    All,

    /// Reads at most the specified number of Events.
    Max(usize),
}

/// Stream is a stream of [Persisted] Domain Events.
pub type Stream<'a, Evt> = BoxStream<'a, Result<Persisted<Evt>, store::ReadError>>;
