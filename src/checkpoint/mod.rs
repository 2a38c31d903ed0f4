//! Module containing support for Checkpoints: the durably persisted
//! "last safely processed" position of one
//! [Subscription][crate::subscription::Subscription] over the store-wide
//! event log.
//!
//! Checkpoints are created once per subscription and survive process
//! restarts: on start, a subscription loads its last [Checkpoint] and
//! resumes reading the log right after it. The
//! [commit handler][commit::CommitHandler] guarantees that the persisted
//! position is never ahead of an unacknowledged predecessor, even under
//! concurrent, out-of-order completions.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod commit;
pub mod sequence;

pub use commit::CommitHandler;
pub use sequence::{CommitPosition, CommitPositionSequence};

/// The unique identifier of one subscriber group over the store-wide
/// event log, owning exactly one [Checkpoint].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for SubscriptionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The durably persisted position of one subscription over the
/// store-wide event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The subscription this [Checkpoint] belongs to.
    pub subscription_id: SubscriptionId,

    /// The global position of the last safely processed event.
    /// `None` means the subscription has never been checkpointed.
    pub position: Option<u64>,
}

/// This error is returned by a [Store] implementation when an operation
/// on the underlying data store fails.
#[derive(Debug, thiserror::Error)]
#[error("checkpoint store failed: {0}")]
pub struct Error(#[from] pub anyhow::Error);

/// Interface to load and persist [Checkpoint]s.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the last [Checkpoint] persisted for the specified
    /// subscription, with `position: None` when the subscription has
    /// never been checkpointed.
    async fn get_last(&self, id: &SubscriptionId) -> Result<Checkpoint, Error>;

    /// Persists a new [Checkpoint], replacing the previous one for the
    /// same subscription, and returns it.
    async fn store(&self, checkpoint: Checkpoint) -> Result<Checkpoint, Error>;
}

#[async_trait]
impl<T> Store for Arc<T>
where
    T: Store,
{
    async fn get_last(&self, id: &SubscriptionId) -> Result<Checkpoint, Error> {
        self.as_ref().get_last(id).await
    }

    async fn store(&self, checkpoint: Checkpoint) -> Result<Checkpoint, Error> {
        self.as_ref().store(checkpoint).await
    }
}

/// In-memory implementation of the checkpoint [Store] trait,
/// backed by a thread-safe [`std::collections::HashMap`].
///
/// Keeps the full history of persisted [Checkpoint]s, so that tests can
/// assert on the exact store calls performed by a
/// [commit handler][commit::CommitHandler].
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    backend: Arc<RwLock<InMemoryBackend>>,
}

#[derive(Debug, Default)]
struct InMemoryBackend {
    checkpoints: HashMap<SubscriptionId, u64>,
    history: Vec<Checkpoint>,
}

impl InMemory {
    /// Returns the full history of [Checkpoint]s persisted through this
    /// instance, in store-call order.
    ///
    /// # Panics
    ///
    /// Since the internal data is thread-safe through an [`RwLock`], this method
    /// could potentially panic while attempting to get a read-only lock on the history.
    pub fn history(&self) -> Vec<Checkpoint> {
        self.backend
            .read()
            .expect("acquire read lock on checkpoint store backend")
            .history
            .clone()
    }
}

#[async_trait]
impl Store for InMemory {
    async fn get_last(&self, id: &SubscriptionId) -> Result<Checkpoint, Error> {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on checkpoint store backend");

        Ok(Checkpoint {
            subscription_id: id.clone(),
            position: backend.checkpoints.get(id).copied(),
        })
    }

    async fn store(&self, checkpoint: Checkpoint) -> Result<Checkpoint, Error> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on checkpoint store backend");

        if let Some(position) = checkpoint.position {
            backend
                .checkpoints
                .insert(checkpoint.subscription_id.clone(), position);
        }

        backend.history.push(checkpoint.clone());

        Ok(checkpoint)
    }
}
