//! Contains the Event [Store] contract and connected abstractions,
//! such as the [`std::collections::HashMap`]'s based [`InMemory`]
//! Event Store implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{iter, once, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::stream::StreamName;
use crate::version::{Check, ConflictError, Version};
use crate::{event, message};

/// All possible error types returned by a read operation on an Event [Store].
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// Error returned when the targeted Event Stream does not exist.
    ///
    /// This variant is kept distinct from other read failures so that
    /// callers can special-case new-entity flows.
    #[error("event stream was not found: {0}")]
    NotFound(StreamName),

    /// Error returned when the [Store] implementation has encountered an error.
    #[error("failed to read domain events, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

/// All possible error types returned by [`Appender::append`].
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// Error returned when [`Appender::append`] encounters a conflict error
    /// while appending the new Domain Events.
    #[error("failed to append new domain events: {0}")]
    Conflict(#[from] ConflictError),

    /// Error returned when the [Appender] implementation has encountered an error.
    #[error("failed to append new domain events, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

/// All possible error types returned by [`Scavenger::truncate`] and
/// [`Scavenger::delete`].
#[derive(Debug, thiserror::Error)]
pub enum ScavengeError {
    /// Error returned when the targeted Event Stream does not exist.
    #[error("event stream was not found: {0}")]
    NotFound(StreamName),

    /// Error returned when the operation encounters a version conflict.
    #[error("failed to scavenge event stream: {0}")]
    Conflict(#[from] ConflictError),

    /// Error returned when the [Scavenger] implementation has encountered an error.
    #[error("failed to scavenge event stream, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

/// The result of a successful [`Appender::append`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// New Domain Events have been recorded in the Event Stream.
    Appended {
        /// The global position of the last Event appended, in the
        /// store-wide event log.
        global_position: u64,

        /// The [Version] of the last Event appended, i.e. the value to
        /// present through [`Check::MustBe`] on the next append to the
        /// same Event Stream.
        next_expected_version: Version,
    },

    /// Nothing was recorded: the append call carried no Domain Events.
    NoOp,
}

impl AppendResult {
    /// Returns the [Version] to expect on the next append to the same
    /// Event Stream, if new Events have been recorded.
    pub fn next_expected_version(&self) -> Option<Version> {
        match self {
            AppendResult::Appended {
                next_expected_version,
                ..
            } => Some(*next_expected_version),
            AppendResult::NoOp => None,
        }
    }
}

/// Interface used to stream [Persisted][event::Persisted] Domain Events
/// from an Event Store to an application.
#[async_trait]
pub trait Streamer<Evt>: Send + Sync
where
    Evt: message::Message + Send + Sync,
{
    /// Returns whether the specified Event Stream exists in the Store.
    async fn stream_exists(&self, id: &StreamName) -> Result<bool, ReadError>;

    /// Opens an Event Stream, streaming back the selected Domain Events in
    /// ascending [Version] order.
    ///
    /// The returned stream fails with [`ReadError::NotFound`] when the
    /// Event Stream does not exist.
    fn read(&self, id: &StreamName, select: event::VersionSelect, limit: event::ReadLimit)
        -> event::Stream<Evt>;

    /// Opens an Event Stream, streaming back Domain Events in descending
    /// [Version] order, starting from the last recorded Event.
    fn read_backwards(&self, id: &StreamName, limit: event::ReadLimit) -> event::Stream<Evt>;
}

/// Interface used to append new Domain Events in an Event Store.
///
/// The [version check][Check] presented to [`append`][Appender::append] is
/// the sole concurrency-control mechanism of the Store: two writers racing
/// on the same Event Stream are serialized by it, and the losing writer is
/// required to reload its state and retry at the caller's layer.
#[async_trait]
pub trait Appender<Evt>: Send + Sync
where
    Evt: message::Message + Send + Sync,
{
    /// Appends new Domain Events to the specified Event Stream.
    ///
    /// The result of this operation carries the new [Version] of the
    /// Event Stream and the global position of the last Event recorded.
    /// Appending an empty list of Events returns [`AppendResult::NoOp`]
    /// without touching the Stream.
    async fn append(
        &self,
        id: StreamName,
        version_check: Check,
        events: Vec<event::Envelope<Evt>>,
    ) -> Result<AppendResult, AppendError>;
}

/// Interface used to remove Domain Events from an Event Store.
#[async_trait]
pub trait Scavenger<Evt>: Send + Sync
where
    Evt: message::Message + Send + Sync,
{
    /// Removes all Events with [Version] lower than `before` from the
    /// specified Event Stream.
    ///
    /// Truncation assumes the older Events have been relocated elsewhere
    /// (e.g. an archive tier): the Stream [Version] is unaffected, and the
    /// store-wide event log keeps serving subscriptions.
    async fn truncate(
        &self,
        id: &StreamName,
        before: Version,
        version_check: Check,
    ) -> Result<(), ScavengeError>;

    /// Deletes the specified Event Stream entirely.
    async fn delete(&self, id: &StreamName, version_check: Check) -> Result<(), ScavengeError>;
}

/// An [Event][event::Envelope] Store, used to store Domain Events in Event
/// Streams -- a stream of Domain Events -- and retrieve them.
///
/// Each Event Stream is represented by a unique [StreamName].
pub trait Store<Evt>: Streamer<Evt> + Appender<Evt> + Scavenger<Evt> + Send + Sync
where
    Evt: message::Message + Send + Sync,
{
}

impl<T, Evt> Store<Evt> for T
where
    T: Streamer<Evt> + Appender<Evt> + Scavenger<Evt> + Send + Sync,
    Evt: message::Message + Send + Sync,
{
}

/// Interface used to stream the store-wide event log, across all Event
/// Streams, in ascending global-position order.
///
/// This is the source of events for [Subscriptions][crate::subscription].
pub trait AllStreamer<Evt>: Send + Sync
where
    Evt: message::Message + Send + Sync,
{
    /// Streams the selected slice of the store-wide event log back to
    /// the application.
    fn read_all(&self, select: event::PositionSelect) -> event::Stream<Evt>;

    /// Opens an endless stream yielding the Domain Events appended to the
    /// Store from the moment of calling this method onwards.
    ///
    /// Since this is a long-running stream, make sure not to *block*
    /// on the full computation of the stream, and prefer using a
    /// `while let` consumer instead.
    fn subscribe_all(&self) -> event::Stream<Evt>;
}

#[derive(Debug)]
struct StreamHolder<Evt>
where
    Evt: message::Message,
{
    // Version of the last event ever appended. Unaffected by truncation.
    version: Version,
    events: Vec<event::Persisted<Evt>>,
}

#[derive(Debug)]
struct InMemoryBackend<Evt>
where
    Evt: message::Message,
{
    event_streams: HashMap<StreamName, StreamHolder<Evt>>,
    log: Vec<event::Persisted<Evt>>,
}

impl<Evt> Default for InMemoryBackend<Evt>
where
    Evt: message::Message,
{
    fn default() -> Self {
        Self {
            event_streams: HashMap::default(),
            log: Vec::default(),
        }
    }
}

/// In-memory implementation of the [Store] and [AllStreamer] traits,
/// backed by a thread-safe [`std::collections::HashMap`].
///
/// Acts both as the reference implementation for backend adapters, and
/// as the test double to run application components against.
#[derive(Debug, Clone)]
pub struct InMemory<Evt>
where
    Evt: message::Message,
{
    backend: Arc<RwLock<InMemoryBackend<Evt>>>,
    feed: broadcast::Sender<event::Persisted<Evt>>,
}

impl<Evt> Default for InMemory<Evt>
where
    Evt: message::Message + Clone,
{
    fn default() -> Self {
        let (feed, _) = broadcast::channel(256);

        Self {
            backend: Arc::default(),
            feed,
        }
    }
}

#[async_trait]
impl<Evt> Streamer<Evt> for InMemory<Evt>
where
    Evt: message::Message + Clone + Send + Sync + 'static,
{
    async fn stream_exists(&self, id: &StreamName) -> Result<bool, ReadError> {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on event store backend");

        Ok(backend.event_streams.contains_key(id))
    }

    fn read(
        &self,
        id: &StreamName,
        select: event::VersionSelect,
        limit: event::ReadLimit,
    ) -> event::Stream<Evt> {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on event store backend");

        let Some(holder) = backend.event_streams.get(id) else {
            let id = id.clone();
            return once(async move { Err(ReadError::NotFound(id)) }).boxed();
        };

        let events = holder
            .events
            .clone()
            .into_iter()
            .filter(move |evt| match select {
                event::VersionSelect::All => true,
                event::VersionSelect::From(v) => evt.version >= v,
            })
            .take(match limit {
                event::ReadLimit::All => usize::MAX,
                event::ReadLimit::Max(n) => n,
            });

        iter(events).map(Ok).boxed()
    }

    fn read_backwards(&self, id: &StreamName, limit: event::ReadLimit) -> event::Stream<Evt> {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on event store backend");

        let Some(holder) = backend.event_streams.get(id) else {
            let id = id.clone();
            return once(async move { Err(ReadError::NotFound(id)) }).boxed();
        };

        let events = holder
            .events
            .clone()
            .into_iter()
            .rev()
            .take(match limit {
                event::ReadLimit::All => usize::MAX,
                event::ReadLimit::Max(n) => n,
            });

        iter(events).map(Ok).boxed()
    }
}

#[async_trait]
impl<Evt> Appender<Evt> for InMemory<Evt>
where
    Evt: message::Message + Clone + Send + Sync + 'static,
{
    async fn append(
        &self,
        id: StreamName,
        version_check: Check,
        events: Vec<event::Envelope<Evt>>,
    ) -> Result<AppendResult, AppendError> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on event store backend");

        let actual_version = backend.event_streams.get(&id).map(|holder| holder.version);

        match version_check {
            Check::Any => (),
            Check::NoStream if actual_version.is_none() => (),
            Check::MustBe(expected) if actual_version == Some(expected) => (),
            expected => {
                return Err(AppendError::Conflict(ConflictError {
                    expected,
                    actual: actual_version,
                }))
            }
        }

        if events.is_empty() {
            return Ok(AppendResult::NoOp);
        }

        let base_version = actual_version.map_or(0, |v| v + 1);
        let base_global = backend.log.len() as u64;
        let recorded_at = Utc::now();

        let persisted_events: Vec<event::Persisted<Evt>> = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| event::Persisted {
                stream_id: id.clone(),
                version: base_version + (i as Version),
                global_position: base_global + (i as u64),
                recorded_at,
                event,
            })
            .collect();

        let last = persisted_events
            .last()
            .cloned()
            .expect("at least one event is being appended");

        backend.log.extend(persisted_events.iter().cloned());

        let holder = backend
            .event_streams
            .entry(id)
            .or_insert_with(|| StreamHolder {
                version: 0,
                events: Vec::default(),
            });

        holder.version = last.version;
        holder.events.extend(persisted_events.iter().cloned());

        // Live subscribers may come and go: a send failure only means
        // no one is listening right now.
        for persisted in persisted_events {
            let _ = self.feed.send(persisted);
        }

        Ok(AppendResult::Appended {
            global_position: last.global_position,
            next_expected_version: last.version,
        })
    }
}

#[async_trait]
impl<Evt> Scavenger<Evt> for InMemory<Evt>
where
    Evt: message::Message + Clone + Send + Sync + 'static,
{
    async fn truncate(
        &self,
        id: &StreamName,
        before: Version,
        version_check: Check,
    ) -> Result<(), ScavengeError> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on event store backend");

        let holder = backend
            .event_streams
            .get_mut(id)
            .ok_or_else(|| ScavengeError::NotFound(id.clone()))?;

        check_against(version_check, holder.version)?;

        holder.events.retain(|evt| evt.version >= before);

        Ok(())
    }

    async fn delete(&self, id: &StreamName, version_check: Check) -> Result<(), ScavengeError> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on event store backend");

        let holder = backend
            .event_streams
            .get(id)
            .ok_or_else(|| ScavengeError::NotFound(id.clone()))?;

        check_against(version_check, holder.version)?;

        backend.event_streams.remove(id);

        Ok(())
    }
}

fn check_against(version_check: Check, actual: Version) -> Result<(), ConflictError> {
    match version_check {
        Check::Any => Ok(()),
        Check::MustBe(expected) if actual == expected => Ok(()),
        expected => Err(ConflictError {
            expected,
            actual: Some(actual),
        }),
    }
}

impl<Evt> AllStreamer<Evt> for InMemory<Evt>
where
    Evt: message::Message + Clone + Send + Sync + 'static,
{
    fn read_all(&self, select: event::PositionSelect) -> event::Stream<Evt> {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on event store backend");

        let events = backend
            .log
            .clone()
            .into_iter()
            .filter(move |evt| match select {
                event::PositionSelect::All => true,
                event::PositionSelect::From(p) => evt.global_position >= p,
            });

        iter(events).map(Ok).boxed()
    }

    fn subscribe_all(&self) -> event::Stream<Evt> {
        BroadcastStream::new(self.feed.subscribe())
            .map(|result| result.map_err(|err| ReadError::Internal(err.into())))
            .boxed()
    }
}

/// Decorator type for an [Event Store][Store] implementation that tracks
/// the list of recorded Domain Events through it.
///
/// Useful for testing purposes, i.e. asserting that Domain Events written
/// through this Event Store instance are the ones expected.
#[derive(Debug, Clone)]
pub struct Tracking<T, Evt>
where
    T: Store<Evt> + Send + Sync,
    Evt: message::Message + Send + Sync,
{
    store: T,
    events: Arc<RwLock<Vec<event::Persisted<Evt>>>>,
}

impl<T, Evt> Tracking<T, Evt>
where
    T: Store<Evt> + Send + Sync,
    Evt: message::Message + Clone + Send + Sync,
{
    /// Returns the list of recorded Domain Events through this decorator so far.
    ///
    /// # Panics
    ///
    /// Since the internal data is thread-safe through an [`RwLock`], this method
    /// could potentially panic while attempting to get a read-only lock on the data recorded.
    pub fn recorded_events(&self) -> Vec<event::Persisted<Evt>> {
        self.events
            .read()
            .expect("acquire lock on recorded events list")
            .clone()
    }

    /// Resets the list of recorded Domain Events through this decorator.
    ///
    /// # Panics
    ///
    /// Since the internal data is thread-safe through an [`RwLock`], this method
    /// could potentially panic while attempting to get a read-write lock to empty the internal store.
    pub fn reset_recorded_events(&self) {
        self.events
            .write()
            .expect("acquire lock on recorded events list")
            .clear();
    }
}

#[async_trait]
impl<T, Evt> Streamer<Evt> for Tracking<T, Evt>
where
    T: Store<Evt> + Send + Sync,
    Evt: message::Message + Clone + Send + Sync,
{
    async fn stream_exists(&self, id: &StreamName) -> Result<bool, ReadError> {
        self.store.stream_exists(id).await
    }

    fn read(
        &self,
        id: &StreamName,
        select: event::VersionSelect,
        limit: event::ReadLimit,
    ) -> event::Stream<Evt> {
        self.store.read(id, select, limit)
    }

    fn read_backwards(&self, id: &StreamName, limit: event::ReadLimit) -> event::Stream<Evt> {
        self.store.read_backwards(id, limit)
    }
}

#[async_trait]
impl<T, Evt> Appender<Evt> for Tracking<T, Evt>
where
    T: Store<Evt> + Send + Sync,
    Evt: message::Message + Clone + Send + Sync,
{
    async fn append(
        &self,
        id: StreamName,
        version_check: Check,
        events: Vec<event::Envelope<Evt>>,
    ) -> Result<AppendResult, AppendError> {
        let result = self
            .store
            .append(id.clone(), version_check, events.clone())
            .await?;

        if let AppendResult::Appended {
            global_position,
            next_expected_version,
        } = result
        {
            let events_size = events.len() as u64;
            let base_version = next_expected_version + 1 - events_size;
            let base_global = global_position + 1 - events_size;
            let recorded_at = Utc::now();

            let mut persisted_events = events
                .into_iter()
                .enumerate()
                .map(|(i, event)| event::Persisted {
                    stream_id: id.clone(),
                    version: base_version + (i as Version),
                    global_position: base_global + (i as u64),
                    recorded_at,
                    event,
                })
                .collect();

            self.events
                .write()
                .expect("acquire lock on recorded events list")
                .append(&mut persisted_events);
        }

        Ok(result)
    }
}

#[async_trait]
impl<T, Evt> Scavenger<Evt> for Tracking<T, Evt>
where
    T: Store<Evt> + Send + Sync,
    Evt: message::Message + Clone + Send + Sync,
{
    async fn truncate(
        &self,
        id: &StreamName,
        before: Version,
        version_check: Check,
    ) -> Result<(), ScavengeError> {
        self.store.truncate(id, before, version_check).await
    }

    async fn delete(&self, id: &StreamName, version_check: Check) -> Result<(), ScavengeError> {
        self.store.delete(id, version_check).await
    }
}

/// Extension trait that can be used to pull in supertypes implemented
/// in this module.
pub trait EventStoreExt<Evt>: Store<Evt> + Send + Sync + Sized
where
    Evt: message::Message + Clone + Send + Sync,
{
    /// Returns a [`Tracking`] instance that decorates the original
    /// [Event Store][Store] instance this method has been called on.
    fn with_recorded_events_tracking(self) -> Tracking<Self, Evt> {
        Tracking {
            store: self,
            events: Arc::default(),
        }
    }
}

impl<T, Evt> EventStoreExt<Evt> for T
where
    T: Store<Evt> + Send + Sync,
    Evt: message::Message + Clone + Send + Sync,
{
}
