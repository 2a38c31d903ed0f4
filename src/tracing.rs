//! Module containing some extension traits to support code instrumentation
//! using the `tracing` crate.
//!
//! Instrumentation is implemented by composition, not inheritance: the
//! decorators here hold an inner implementation of the decorated
//! contract, forward every call to it, and add spans around the calls.

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use tracing::instrument;

use crate::aggregate::repository::{LoadError, StoreError};
use crate::aggregate::{self, Aggregate};
use crate::event::store::{AppendError, AppendResult, ReadError, ScavengeError};
use crate::state::State;
use crate::stream::StreamName;
use crate::version::{Check, Version};
use crate::{event, message};

/// [Event Store][event::store::Store] type wrapper that provides
/// instrumentation features through the `tracing` crate.
#[derive(Debug, Clone)]
pub struct InstrumentedEventStore<T, Evt>
where
    T: event::store::Store<Evt> + Send + Sync,
    Evt: message::Message + Debug + Send + Sync,
{
    store: T,
    event: PhantomData<Evt>,
}

#[async_trait]
impl<T, Evt> event::store::Streamer<Evt> for InstrumentedEventStore<T, Evt>
where
    T: event::store::Store<Evt> + Send + Sync,
    Evt: message::Message + Debug + Send + Sync,
{
    #[instrument(name = "event::store::Streamer.stream_exists", ret, err, skip(self))]
    async fn stream_exists(&self, id: &StreamName) -> Result<bool, ReadError> {
        self.store.stream_exists(id).await
    }

    #[instrument(name = "event::store::Streamer.read", skip(self))]
    fn read(
        &self,
        id: &StreamName,
        select: event::VersionSelect,
        limit: event::ReadLimit,
    ) -> event::Stream<Evt> {
        self.store.read(id, select, limit)
    }

    #[instrument(name = "event::store::Streamer.read_backwards", skip(self))]
    fn read_backwards(&self, id: &StreamName, limit: event::ReadLimit) -> event::Stream<Evt> {
        self.store.read_backwards(id, limit)
    }
}

#[async_trait]
impl<T, Evt> event::store::Appender<Evt> for InstrumentedEventStore<T, Evt>
where
    T: event::store::Store<Evt> + Send + Sync,
    Evt: message::Message + Debug + Send + Sync,
{
    #[instrument(name = "event::store::Appender.append", ret, err, skip(self, events))]
    async fn append(
        &self,
        id: StreamName,
        version_check: Check,
        events: Vec<event::Envelope<Evt>>,
    ) -> Result<AppendResult, AppendError> {
        self.store.append(id, version_check, events).await
    }
}

#[async_trait]
impl<T, Evt> event::store::Scavenger<Evt> for InstrumentedEventStore<T, Evt>
where
    T: event::store::Store<Evt> + Send + Sync,
    Evt: message::Message + Debug + Send + Sync,
{
    #[instrument(name = "event::store::Scavenger.truncate", err, skip(self))]
    async fn truncate(
        &self,
        id: &StreamName,
        before: Version,
        version_check: Check,
    ) -> Result<(), ScavengeError> {
        self.store.truncate(id, before, version_check).await
    }

    #[instrument(name = "event::store::Scavenger.delete", err, skip(self))]
    async fn delete(&self, id: &StreamName, version_check: Check) -> Result<(), ScavengeError> {
        self.store.delete(id, version_check).await
    }
}

/// Extension trait for any [Event Store][event::store::Store] type to
/// provide instrumentation features through the `tracing` crate.
pub trait EventStoreExt<Evt>: event::store::Store<Evt> + Sized
where
    Evt: message::Message + Debug + Send + Sync,
{
    /// Returns an instrumented version of the [Event Store][event::store::Store]
    /// instance.
    fn with_tracing(self) -> InstrumentedEventStore<Self, Evt> {
        InstrumentedEventStore {
            store: self,
            event: PhantomData,
        }
    }
}

impl<T, Evt> EventStoreExt<Evt> for T
where
    T: event::store::Store<Evt> + Send + Sync,
    Evt: message::Message + Debug + Send + Sync,
{
}

/// [Repository][aggregate::Repository] type wrapper that provides
/// instrumentation features through the `tracing` crate.
#[derive(Debug, Clone)]
pub struct InstrumentedRepository<S, Inner>
where
    S: State + Debug,
    S::Id: Debug,
    S::Event: Debug,
    Inner: aggregate::Repository<S>,
{
    inner: Inner,
    state: PhantomData<S>,
}

#[async_trait]
impl<S, Inner> aggregate::Repository<S> for InstrumentedRepository<S, Inner>
where
    S: State + Debug,
    S::Id: Debug,
    S::Event: Debug,
    Inner: aggregate::Repository<S>,
{
    #[instrument(name = "aggregate::Repository.load", err, skip(self))]
    async fn load(&self, id: &S::Id) -> Result<Aggregate<S>, LoadError> {
        self.inner.load(id).await
    }

    #[instrument(name = "aggregate::Repository.store", err, skip(self, aggregate))]
    async fn store(
        &self,
        id: &S::Id,
        aggregate: &mut Aggregate<S>,
    ) -> Result<AppendResult, StoreError> {
        self.inner.store(id, aggregate).await
    }
}

/// Extension trait for any [Repository][aggregate::Repository] type to
/// provide instrumentation features through the `tracing` crate.
pub trait RepositoryExt<S>: aggregate::Repository<S> + Sized
where
    S: State + Debug,
    S::Id: Debug,
    S::Event: Debug,
{
    /// Returns an instrumented version of the [Repository][aggregate::Repository]
    /// instance.
    fn with_tracing(self) -> InstrumentedRepository<S, Self> {
        InstrumentedRepository {
            inner: self,
            state: PhantomData,
        }
    }
}

impl<R, S> RepositoryExt<S> for R
where
    R: aggregate::Repository<S>,
    S: State + Debug,
    S::Id: Debug,
    S::Event: Debug,
{
}
