//! Contains the [CommitHandler]: the component that turns per-event
//! completions into durably persisted [Checkpoint]s, batching them and
//! respecting delivery gaps.
//!
//! Completions are buffered through a single-worker bounded
//! [channel worker][crate::worker::ChannelWorker], which serializes all
//! access to the [CommitPositionSequence] without locks being contended.
//! Once the buffer reaches the configured batch size, or on stop, the
//! handler computes the gap-free position and, if there is one, persists
//! it through the [checkpoint Store][Store] and clears the **entire**
//! buffer. Entries past a gap are dropped knowingly: they will be
//! redelivered and re-added after a restart, trading a sliding-window
//! optimization for at-least-once simplicity.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex;

use crate::checkpoint::{Checkpoint, CommitPosition, CommitPositionSequence, Store, SubscriptionId};
use crate::worker::{Backpressure, ChannelWorker, Process, StopError, WorkerOptions, WriteError, Writer};

/// Configuration options for a [CommitHandler].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitHandlerOptions {
    /// The number of buffered completions that triggers a commit attempt.
    pub batch_size: usize,

    /// The capacity of the internal completion queue.
    pub capacity: usize,

    /// The grace period granted to queued completions during
    /// [`CommitHandler::stop`].
    pub stop_grace: Duration,
}

impl Default for CommitHandlerOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            capacity: 128,
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Batches per-event completions into durable [Checkpoint] commits.
///
/// Check out the [module-level documentation][self] for more information.
pub struct CommitHandler {
    worker: ChannelWorker<CommitPosition>,
}

impl CommitHandler {
    /// Creates a new [CommitHandler] for the specified subscription,
    /// persisting its progress through the specified
    /// [checkpoint Store][Store].
    pub fn new<CS>(
        subscription_id: SubscriptionId,
        store: CS,
        options: CommitHandlerOptions,
    ) -> Self
    where
        CS: Store + 'static,
    {
        let store = Arc::new(store);
        let sequence = Arc::new(Mutex::new(CommitPositionSequence::new()));
        let batch_size = options.batch_size.max(1);

        let process: Process<CommitPosition> = {
            let store = Arc::clone(&store);
            let sequence = Arc::clone(&sequence);
            let subscription_id = subscription_id.clone();

            Arc::new(move |position| {
                let store = Arc::clone(&store);
                let sequence = Arc::clone(&sequence);
                let subscription_id = subscription_id.clone();

                async move {
                    let mut sequence = sequence.lock().await;
                    sequence.add(position);

                    if sequence.len() >= batch_size {
                        commit(store.as_ref(), &subscription_id, &mut sequence).await?;
                    }

                    Ok(())
                }
                .boxed()
            })
        };

        let worker = ChannelWorker::new(
            WorkerOptions {
                capacity: options.capacity,
                workers: 1,
                backpressure: Backpressure::Wait,
                stop_grace: options.stop_grace,
            },
            process,
        )
        .with_finalizer(move || {
            // One last flush for whatever is still buffered, only
            // reachable when the queue drained within the grace period.
            async move {
                let mut sequence = sequence.lock().await;
                commit(store.as_ref(), &subscription_id, &mut sequence).await
            }
            .boxed()
        });

        Self { worker }
    }

    /// Submits the completion of one processed event.
    ///
    /// The call suspends while the internal queue is full.
    pub async fn commit(&self, position: CommitPosition) -> Result<(), WriteError> {
        self.worker.write(position).await
    }

    /// Returns a cloneable [Writer] handle to submit completions to
    /// this handler.
    pub fn writer(&self) -> Writer<CommitPosition> {
        self.worker.writer()
    }

    /// Stops the handler: queued completions are drained within the
    /// grace period, and the buffered positions are flushed with one
    /// final commit attempt.
    pub async fn stop(self) -> Result<(), StopError> {
        self.worker.stop().await
    }
}

async fn commit<CS>(
    store: &CS,
    subscription_id: &SubscriptionId,
    sequence: &mut CommitPositionSequence,
) -> anyhow::Result<()>
where
    CS: Store,
{
    let Some(position) = sequence.first_before_gap() else {
        return Ok(());
    };

    // A store failure propagates out of the commit attempt: the buffer
    // is cleared only after a successful commit, so a failure can never
    // cause a skipped position.
    store
        .store(Checkpoint {
            subscription_id: subscription_id.clone(),
            position: Some(position.position),
        })
        .await?;

    tracing::trace!(
        subscription.id = %subscription_id,
        checkpoint.position = position.position,
        checkpoint.sequence = position.sequence,
        "checkpoint committed"
    );

    sequence.clear();

    Ok(())
}
