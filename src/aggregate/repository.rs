//! Contains the [Repository] contract to load and save [Aggregate]
//! instances, and its Event-sourced implementation over an
//! [Event Store][event::store::Store].

use std::num::NonZeroU64;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use crate::aggregate::{snapshot, Aggregate};
use crate::event::store::{AppendError, AppendResult, ReadError};
use crate::state::State;
use crate::stream::StreamName;
use crate::version::{Check, ConflictError};
use crate::{event, message};

/// All possible error types returned by [`Repository::load`].
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Error returned when the Event Store fails while streaming back
    /// the Aggregate's Event Stream.
    #[error("event store failed while streaming events: {0}")]
    ReadFromStore(#[source] ReadError),

    /// Error returned when the snapshot store fails while loading the
    /// latest [Snapshot][snapshot::Snapshot] for the Aggregate.
    #[error("snapshot store failed while loading the latest snapshot: {0}")]
    Snapshot(#[source] snapshot::Error),
}

/// All possible error types returned by [`Repository::store`].
///
/// The variants are kept distinguishable on purpose, so that command
/// handling call paths can map a concurrency conflict, a missing entity
/// and a store failure to precise outcomes for their callers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Error returned when the optimistic concurrency check failed:
    /// another writer has appended to the same Event Stream first.
    ///
    /// A safe retry requires reloading the Aggregate and re-running the
    /// business logic, not merely re-appending: the Repository never
    /// retries on behalf of the caller.
    #[error("failed to append new domain events: {0}")]
    Conflict(#[source] ConflictError),

    /// Error returned when the Event Store fails while appending the
    /// pending Domain Events to the Aggregate's Event Stream.
    #[error("event store failed while appending events: {0}")]
    AppendToStore(#[source] AppendError),
}

/// A Repository is an object that allows to load and save
/// an [Aggregate] from and to a persistent data store.
#[async_trait]
pub trait Repository<S>: Send + Sync
where
    S: State,
{
    /// Loads an [Aggregate] instance from the data store, referenced by
    /// its unique identifier.
    ///
    /// A missing Event Stream is **not** an error at this layer: a new,
    /// empty [Aggregate] is returned instead, and new-vs-existing is
    /// the caller's decision through the
    /// [existence guards][Aggregate::ensure_exists].
    async fn load(&self, id: &S::Id) -> Result<Aggregate<S>, LoadError>;

    /// Stores the pending changes of an [Aggregate] instance to the
    /// data store.
    ///
    /// An instance with no pending changes short-circuits to
    /// [`AppendResult::NoOp`] without a store round-trip.
    async fn store(
        &self,
        id: &S::Id,
        aggregate: &mut Aggregate<S>,
    ) -> Result<AppendResult, StoreError>;
}

/// Hook invoked on each outgoing Domain Event right before it is
/// appended, e.g. to inject causation/correlation [Metadata][crate::message::Metadata].
pub type AmendEvent<Evt> =
    Arc<dyn Fn(event::Envelope<Evt>) -> event::Envelope<Evt> + Send + Sync>;

/// An Event-sourced implementation of the [Repository] interface.
///
/// It uses an [Event Store][event::store::Store] instance to stream
/// Domain Events for a particular Aggregate, and append the pending
/// Domain Events recorded by it.
///
/// When a [snapshot store][snapshot::Store] is configured, hydration
/// starts from the latest recorded [Snapshot][snapshot::Snapshot] and
/// replays only the Event Stream tail recorded after it.
#[derive(Clone)]
pub struct EventSourced<S, ES>
where
    S: State,
    ES: event::store::Store<S::Event>,
{
    store: ES,
    snapshots: Option<Arc<dyn snapshot::Store<S>>>,
    snapshot_every: Option<NonZeroU64>,
    stream_mapper: Arc<dyn Fn(&S::Id) -> StreamName + Send + Sync>,
    factory: Arc<dyn Fn() -> Aggregate<S> + Send + Sync>,
    amend: Option<AmendEvent<S::Event>>,
}

impl<S, ES> From<ES> for EventSourced<S, ES>
where
    S: State + 'static,
    ES: event::store::Store<S::Event>,
{
    fn from(store: ES) -> Self {
        Self {
            store,
            snapshots: None,
            snapshot_every: None,
            stream_mapper: Arc::new(|id| StreamName::for_entity::<S>(id)),
            factory: Arc::new(Aggregate::new),
            amend: None,
        }
    }
}

impl<S, ES> EventSourced<S, ES>
where
    S: State,
    ES: event::store::Store<S::Event>,
{
    /// Overrides the mapping from an Aggregate identifier to the name
    /// of its Event Stream.
    ///
    /// The default mapping follows the `"{Type}-{id}"` convention,
    /// through [`StreamName::for_entity`].
    #[must_use]
    pub fn with_stream_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&S::Id) -> StreamName + Send + Sync + 'static,
    {
        self.stream_mapper = Arc::new(mapper);
        self
    }

    /// Overrides the factory used to construct new [Aggregate] instances
    /// during hydration, to support states carrying injected dependencies.
    #[must_use]
    pub fn with_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Aggregate<S> + Send + Sync + 'static,
    {
        self.factory = Arc::new(factory);
        self
    }

    /// Sets a hook to amend each outgoing Domain Event right before it
    /// is appended to the Event Store, e.g. to inject causation or
    /// correlation [Metadata][crate::message::Metadata].
    #[must_use]
    pub fn with_event_amendment<F>(mut self, amend: F) -> Self
    where
        F: Fn(event::Envelope<S::Event>) -> event::Envelope<S::Event> + Send + Sync + 'static,
    {
        self.amend = Some(Arc::new(amend));
        self
    }

    /// Enables snapshot-based hydration through the specified
    /// [snapshot store][snapshot::Store], recording a new
    /// [Snapshot][snapshot::Snapshot] every time the Event Stream grows
    /// past a multiple of `every` events.
    #[must_use]
    pub fn with_snapshots<SS>(mut self, snapshots: SS, every: NonZeroU64) -> Self
    where
        SS: snapshot::Store<S> + 'static,
    {
        self.snapshots = Some(Arc::new(snapshots));
        self.snapshot_every = Some(every);
        self
    }
}

#[async_trait]
impl<S, ES> Repository<S> for EventSourced<S, ES>
where
    S: State + Clone,
    ES: event::store::Store<S::Event>,
    S::Event: message::Message + Send + Sync,
{
    async fn load(&self, id: &S::Id) -> Result<Aggregate<S>, LoadError> {
        let stream_id = (self.stream_mapper)(id);
        let mut aggregate = (self.factory)();

        let select = match &self.snapshots {
            Some(snapshots) => snapshots
                .load(&stream_id)
                .await
                .map_err(LoadError::Snapshot)?
                .map_or(event::VersionSelect::All, |snapshot| {
                    let from = snapshot.version + 1;
                    aggregate.load_snapshot(snapshot);
                    event::VersionSelect::From(from)
                }),
            None => event::VersionSelect::All,
        };

        let mut stream = self.store.read(&stream_id, select, event::ReadLimit::All);

        while let Some(result) = stream.next().await {
            match result {
                Ok(persisted) => aggregate.replay(std::iter::once(persisted)),
                // A missing stream is a new entity, not a failure: the
                // caller decides through the existence guards.
                Err(ReadError::NotFound(_)) => break,
                Err(err) => return Err(LoadError::ReadFromStore(err)),
            }
        }

        Ok(aggregate)
    }

    async fn store(
        &self,
        id: &S::Id,
        aggregate: &mut Aggregate<S>,
    ) -> Result<AppendResult, StoreError> {
        if aggregate.changes().is_empty() {
            return Ok(AppendResult::NoOp);
        }

        let stream_id = (self.stream_mapper)(id);
        let original_version = aggregate.original_version();

        let version_check = match original_version {
            Some(version) => Check::MustBe(version),
            None => Check::NoStream,
        };

        let mut events_to_commit = aggregate.take_changes();

        if let Some(amend) = &self.amend {
            events_to_commit = events_to_commit.into_iter().map(|evt| amend(evt)).collect();
        }

        let result = self
            .store
            .append(stream_id.clone(), version_check, events_to_commit)
            .await
            .map_err(|err| match err {
                AppendError::Conflict(conflict) => StoreError::Conflict(conflict),
                other => StoreError::AppendToStore(other),
            })?;

        if let AppendResult::Appended {
            next_expected_version,
            ..
        } = result
        {
            aggregate.mark_committed(next_expected_version);

            self.maybe_record_snapshot(&stream_id, aggregate, original_version)
                .await;
        }

        Ok(result)
    }
}

impl<S, ES> EventSourced<S, ES>
where
    S: State + Clone,
    ES: event::store::Store<S::Event>,
{
    async fn maybe_record_snapshot(
        &self,
        stream_id: &StreamName,
        aggregate: &Aggregate<S>,
        original_version: Option<crate::version::Version>,
    ) {
        let (Some(snapshots), Some(every)) = (&self.snapshots, self.snapshot_every) else {
            return;
        };

        let Some(new_version) = aggregate.original_version() else {
            return;
        };

        let events_before = original_version.map_or(0, |v| v + 1);
        let events_after = new_version + 1;

        if events_after / every.get() > events_before / every.get() {
            let Some(snapshot) = aggregate.snapshot() else {
                return;
            };

            if let Err(error) = snapshots.record(stream_id, snapshot).await {
                tracing::warn!(
                    stream.id = %stream_id,
                    error = %error,
                    "failed to record aggregate snapshot"
                );
            }
        }
    }
}
