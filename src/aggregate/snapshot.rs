//! Contains the [Snapshot] type and the contract to store and retrieve
//! snapshots of [Aggregate][crate::aggregate::Aggregate] instances.
//!
//! Snapshots are an optimization over full Event Stream replays: a
//! precomputed `{state, version}` pair lets a
//! [Repository][crate::aggregate::repository::Repository] hydrate an
//! Aggregate from the snapshot version onwards, replaying only the
//! Domain Events recorded after it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::state::State;
use crate::stream::StreamName;
use crate::version::Version;

/// A point-in-time capture of an [Aggregate][crate::aggregate::Aggregate]
/// [State], used to bypass full Event Stream replay during hydration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<S> {
    /// The captured state value.
    pub state: S,

    /// The [Version] of the last Domain Event folded into the
    /// captured state.
    pub version: Version,
}

/// This error is returned by a [Store] implementation when an operation
/// on the underlying data store fails.
#[derive(Debug, thiserror::Error)]
#[error("snapshot store failed: {0}")]
pub struct Error(#[from] pub anyhow::Error);

/// Interface to store and retrieve [Snapshot]s of entity states,
/// keyed by the [StreamName] of the Event Stream they capture.
#[async_trait]
pub trait Store<S>: Send + Sync
where
    S: State,
{
    /// Returns the latest [Snapshot] recorded for the specified
    /// Event Stream, if any.
    async fn load(&self, stream_id: &StreamName) -> Result<Option<Snapshot<S>>, Error>;

    /// Records a new [Snapshot] for the specified Event Stream,
    /// replacing the previous one.
    async fn record(&self, stream_id: &StreamName, snapshot: Snapshot<S>) -> Result<(), Error>;
}

/// In-memory implementation of the snapshot [Store] trait,
/// backed by a thread-safe [`std::collections::HashMap`].
#[derive(Debug, Clone)]
pub struct InMemory<S>
where
    S: State,
{
    backend: Arc<RwLock<HashMap<StreamName, Snapshot<S>>>>,
}

impl<S> Default for InMemory<S>
where
    S: State,
{
    fn default() -> Self {
        Self {
            backend: Arc::default(),
        }
    }
}

#[async_trait]
impl<S> Store<S> for InMemory<S>
where
    S: State + Clone,
{
    async fn load(&self, stream_id: &StreamName) -> Result<Option<Snapshot<S>>, Error> {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on snapshot store backend");

        Ok(backend.get(stream_id).cloned())
    }

    async fn record(&self, stream_id: &StreamName, snapshot: Snapshot<S>) -> Result<(), Error> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on snapshot store backend");

        backend.insert(stream_id.clone(), snapshot);

        Ok(())
    }
}
