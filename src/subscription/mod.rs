//! Module containing support for Subscriptions to the Domain Events
//! stored in an [Event Store][crate::event::store::Store].
//!
//! ## What are Subscriptions?
//!
//! Subscriptions receive the Events appended to the store-wide event
//! log, in global-position order, and deliver them into a pipeline of
//! [EventHandler]s. This allows for near real-time processing of
//! multiple things, such as updating **projections** or publishing
//! committed Events to other parts of the system.
//!
//! ## Subscriptions in `eventum`
//!
//! A [Subscription] composes four parts:
//!
//! * a **read-ahead loop**, which catches up from the last persisted
//!   [Checkpoint][crate::checkpoint::Checkpoint] and chains into the
//!   live feed of newly appended Events, de-duplicating the overlap;
//! * a bounded [channel worker][crate::worker::ChannelWorker], applying
//!   the configured backpressure between the read loop and the handlers;
//! * a [Consumer] pipeline, fanning each Event out to the registered
//!   handlers and combining their outcomes;
//! * a [commit handler][crate::checkpoint::CommitHandler], which turns
//!   acknowledged Events into durable, gap-free checkpoint commits.
//!
//! The persisted checkpoint is never ahead of an unacknowledged
//! predecessor. Note that with more than one delivery worker, handlers
//! are **not** guaranteed to observe Events in receipt order: only the
//! externally visible checkpoint is gap-free.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::checkpoint::{self, CommitHandler, CommitPosition};
use crate::checkpoint::commit::CommitHandlerOptions;
use crate::worker::{Backpressure, ChannelWorker, Process, Writer, WorkerOptions, WriteError};
use crate::{event, message, worker};

pub mod consumer;

pub use consumer::{Consumer, EventHandler, Handling, Outcome};

pub use crate::checkpoint::SubscriptionId;

/// The policy applied when the [Consumer] reports a failed [Outcome]
/// for a delivered Event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Propagate the failure and stop the subscription: the Event stays
    /// unacknowledged, and will be redelivered on the next start.
    #[default]
    Abort,

    /// Log the failure and advance past the Event.
    Continue,
}

/// Configuration options for a [Subscription].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// The number of delivery workers running the [Consumer] pipeline.
    ///
    /// With more than one worker, Events are handled concurrently and
    /// completions may happen out of receipt order: the checkpoint
    /// commit protocol is what keeps the persisted position gap-free.
    pub workers: usize,

    /// The capacity of the delivery queue between the read loop and
    /// the workers.
    pub capacity: usize,

    /// The backpressure policy applied when the delivery queue is full.
    ///
    /// With [`Backpressure::FailFast`], a full queue drops the
    /// subscription instead of suspending the read loop: the events are
    /// redelivered from the last checkpoint on the next start.
    pub backpressure: Backpressure,

    /// The policy applied when a delivered Event fails in the
    /// [Consumer] pipeline.
    pub failure_policy: FailurePolicy,

    /// The grace period granted to in-flight deliveries during
    /// [`SubscriptionHandle::stop`].
    pub stop_grace: Duration,

    /// Configuration of the checkpoint [CommitHandler].
    pub checkpoint: CommitHandlerOptions,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            capacity: 128,
            backpressure: Backpressure::default(),
            failure_policy: FailurePolicy::default(),
            stop_grace: Duration::from_secs(5),
            checkpoint: CommitHandlerOptions::default(),
        }
    }
}

/// All possible error types returned by [`Subscription::start`] and
/// [`SubscriptionHandle::stop`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The checkpoint store failed while loading the last [Checkpoint][checkpoint::Checkpoint].
    #[error("failed to load the last subscription checkpoint: {0}")]
    Checkpoint(#[source] checkpoint::Error),

    /// The read loop failed while streaming the store-wide event log.
    #[error("subscription read loop failed: {0}")]
    ReadLoop(#[source] anyhow::Error),

    /// The delivery workers failed, or could not be stopped cleanly.
    #[error("subscription delivery workers failed: {0}")]
    Delivery(#[source] worker::StopError),

    /// The checkpoint commit handler failed, or could not be stopped cleanly.
    #[error("subscription commit handler failed: {0}")]
    Commit(#[source] worker::StopError),
}

/// One subscriber group over the store-wide event log: delivers stored
/// Domain Events into a [Consumer] pipeline, with durable, resumable
/// position tracking.
///
/// Check out the [module-level documentation][self] for more information.
pub struct Subscription<Evt, ES, CS>
where
    Evt: message::Message + Send + Sync + 'static,
    ES: event::store::AllStreamer<Evt> + 'static,
    CS: checkpoint::Store + 'static,
{
    id: SubscriptionId,
    store: ES,
    checkpoints: CS,
    consumer: Consumer<Evt>,
    options: SubscriptionOptions,
}

impl<Evt, ES, CS> Subscription<Evt, ES, CS>
where
    Evt: message::Message + Send + Sync + 'static,
    ES: event::store::AllStreamer<Evt> + 'static,
    CS: checkpoint::Store + 'static,
{
    /// Creates a new [Subscription] over the store-wide event log of
    /// the specified Event Store, tracking its progress through the
    /// specified [checkpoint Store][checkpoint::Store].
    pub fn new(id: SubscriptionId, store: ES, checkpoints: CS, consumer: Consumer<Evt>) -> Self {
        Self {
            id,
            store,
            checkpoints,
            consumer,
            options: SubscriptionOptions::default(),
        }
    }

    /// Overrides the default [SubscriptionOptions].
    #[must_use]
    pub fn with_options(mut self, options: SubscriptionOptions) -> Self {
        self.options = options;
        self
    }

    /// Starts the subscription: loads the last
    /// [Checkpoint][checkpoint::Checkpoint], spawns the read loop and
    /// the delivery workers, and returns the [SubscriptionHandle] to
    /// stop everything in order.
    pub async fn start(self) -> Result<SubscriptionHandle<Evt>, Error> {
        let Self {
            id,
            store,
            checkpoints,
            consumer,
            options,
        } = self;

        let checkpoint = checkpoints
            .get_last(&id)
            .await
            .map_err(Error::Checkpoint)?;

        tracing::debug!(
            subscription.id = %id,
            checkpoint.position = ?checkpoint.position,
            "starting subscription"
        );

        let commit_handler = CommitHandler::new(id.clone(), checkpoints, options.checkpoint.clone());

        let process = delivery_process(
            Arc::new(consumer),
            commit_handler.writer(),
            options.failure_policy,
        );

        let worker = ChannelWorker::new(
            WorkerOptions {
                capacity: options.capacity,
                workers: options.workers,
                backpressure: options.backpressure,
                stop_grace: options.stop_grace,
            },
            process,
        );

        let (cancel, cancel_rx) = watch::channel(false);

        let read_task = tokio::spawn(read_loop(
            id,
            store,
            checkpoint.position,
            worker.writer(),
            cancel_rx,
        ));

        Ok(SubscriptionHandle {
            cancel,
            read_task,
            worker,
            commit_handler,
        })
    }
}

/// Handle to a running [Subscription].
pub struct SubscriptionHandle<Evt>
where
    Evt: message::Message + Send + Sync + 'static,
{
    cancel: watch::Sender<bool>,
    read_task: JoinHandle<anyhow::Result<()>>,
    worker: ChannelWorker<Delivery<Evt>>,
    commit_handler: CommitHandler,
}

impl<Evt> SubscriptionHandle<Evt>
where
    Evt: message::Message + Send + Sync + 'static,
{
    /// Returns whether the subscription read loop is still running.
    pub fn is_running(&self) -> bool {
        !self.read_task.is_finished()
    }

    /// Stops the subscription in order: the read loop is cancelled, the
    /// delivery workers drain with the two-phase protocol, and the
    /// commit handler flushes the buffered positions one last time.
    ///
    /// Unacknowledged Events are simply not checkpointed: they will be
    /// redelivered on the next start, not silently lost.
    pub async fn stop(self) -> Result<(), Error> {
        let _ = self.cancel.send(true);

        let read_result = self.read_task.await;

        self.worker.stop().await.map_err(Error::Delivery)?;
        self.commit_handler.stop().await.map_err(Error::Commit)?;

        match read_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(Error::ReadLoop(error)),
            Err(join_error) if join_error.is_cancelled() => Ok(()),
            Err(join_error) => Err(Error::ReadLoop(join_error.into())),
        }
    }
}

/// One delivered Event, paired with the receipt-order counter assigned
/// by the read loop.
type Delivery<Evt> = (event::Persisted<Evt>, u64);

fn delivery_process<Evt>(
    consumer: Arc<Consumer<Evt>>,
    commits: Writer<CommitPosition>,
    failure_policy: FailurePolicy,
) -> Process<Delivery<Evt>>
where
    Evt: message::Message + Send + Sync + 'static,
{
    use futures::FutureExt;

    Arc::new(move |(event, sequence)| {
        let consumer = Arc::clone(&consumer);
        let commits = commits.clone();

        async move {
            let outcome = consumer.consume(&event).await;

            let acknowledge = match outcome {
                Outcome::Handled | Outcome::Ignored => true,
                Outcome::Pending => {
                    // Not acknowledged: the event is not checkpointed
                    // and will be redelivered on the next start.
                    tracing::debug!(
                        event.global_position = event.global_position,
                        "event is still pending, holding the checkpoint back"
                    );

                    false
                }
                Outcome::Failed(failures) => match failure_policy {
                    FailurePolicy::Abort => {
                        anyhow::bail!(
                            "event at global position {} failed in {} handler(s)",
                            event.global_position,
                            failures.len(),
                        );
                    }
                    // Failures have been logged by the consumer already.
                    FailurePolicy::Continue => true,
                },
            };

            if acknowledge {
                commits
                    .write(CommitPosition {
                        position: event.global_position,
                        sequence,
                    })
                    .await?;
            }

            Ok(())
        }
        .boxed()
    })
}

async fn read_loop<Evt, ES>(
    id: SubscriptionId,
    store: ES,
    from: Option<u64>,
    deliveries: Writer<Delivery<Evt>>,
    mut cancel: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    Evt: message::Message + Send + Sync + 'static,
    ES: event::store::AllStreamer<Evt>,
{
    // Subscribe to the live feed first, so that no event appended
    // between the end of the catch-up read and the subscription start
    // is lost. The overlap produces duplicates, which are discarded
    // below by comparing global positions.
    let live = store.subscribe_all();

    let select = from.map_or(event::PositionSelect::All, |position| {
        event::PositionSelect::From(position + 1)
    });

    let mut stream = store.read_all(select).chain(live);

    let mut last_position = from;
    let mut sequence: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;

            _ = cancel.wait_for(|cancelled| *cancelled) => break,
            next = stream.next() => next,
        };

        // The store has been dropped: nothing left to read.
        let Some(result) = next else {
            break;
        };

        let event = result.map_err(anyhow::Error::from)?;

        if let Some(last) = last_position {
            if event.global_position <= last {
                tracing::trace!(
                    subscription.id = %id,
                    event.global_position = event.global_position,
                    "duplicated event detected; skipping"
                );

                continue;
            }
        }

        last_position = Some(event.global_position);

        let delivery_sequence = sequence;
        sequence += 1;

        match deliveries.write((event, delivery_sequence)).await {
            Ok(()) => (),
            // The workers have been stopped already: clean exit.
            Err(WriteError::Closed) => break,
            Err(WriteError::Full) => {
                // Dropping the subscription is the fail-fast contract:
                // redelivery from the last checkpoint is cheap.
                anyhow::bail!("delivery queue is full");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::checkpoint::Store as CheckpointStore;
    use crate::event::store::{Appender, InMemory};
    use crate::message::tests::StringMessage;
    use crate::stream::StreamName;
    use crate::version::Check;

    #[derive(Clone, Default)]
    struct Collector {
        positions: Arc<StdMutex<Vec<u64>>>,
    }

    impl Collector {
        fn collected(&self) -> Vec<u64> {
            self.positions
                .lock()
                .expect("acquire lock on collected positions")
                .clone()
        }
    }

    #[async_trait]
    impl EventHandler<StringMessage> for Collector {
        async fn handle(
            &self,
            event: &event::Persisted<StringMessage>,
        ) -> anyhow::Result<Handling> {
            self.positions
                .lock()
                .expect("acquire lock on collected positions")
                .push(event.global_position);

            Ok(Handling::Success)
        }
    }

    async fn wait_until<F>(condition: F)
    where
        F: Fn() -> bool,
    {
        for _ in 0..200 {
            if condition() {
                return;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("condition was not met in time");
    }

    async fn append_events(store: &InMemory<StringMessage>, count: usize) {
        let events = (0..count)
            .map(|_| event::Envelope::from(StringMessage("an-event")))
            .collect();

        store
            .append(StreamName::from("stream:test"), Check::Any, events)
            .await
            .expect("append should not fail");
    }

    #[tokio::test]
    async fn it_delivers_the_catch_up_and_live_phases_without_duplicates() {
        let event_store = InMemory::<StringMessage>::default();
        let checkpoint_store = checkpoint::InMemory::default();
        let collector = Collector::default();

        append_events(&event_store, 3).await;

        let handle = Subscription::new(
            SubscriptionId::from("projection:test"),
            event_store.clone(),
            checkpoint_store.clone(),
            Consumer::new().add_handler(collector.clone()),
        )
        .start()
        .await
        .expect("the subscription should start");

        wait_until(|| collector.collected().len() == 3).await;

        // Live phase: appended after the subscription caught up.
        append_events(&event_store, 2).await;

        wait_until(|| collector.collected().len() == 5).await;

        handle.stop().await.expect("stop should not fail");

        assert_eq!(vec![0, 1, 2, 3, 4], collector.collected());

        let checkpoint = checkpoint_store
            .get_last(&SubscriptionId::from("projection:test"))
            .await
            .expect("get_last should not fail");

        assert_eq!(Some(4), checkpoint.position);
    }

    #[tokio::test]
    async fn it_resumes_from_the_last_checkpoint() {
        let event_store = InMemory::<StringMessage>::default();
        let checkpoint_store = checkpoint::InMemory::default();
        let collector = Collector::default();
        let id = SubscriptionId::from("projection:test");

        append_events(&event_store, 4).await;

        checkpoint_store
            .store(checkpoint::Checkpoint {
                subscription_id: id.clone(),
                position: Some(1),
            })
            .await
            .expect("store should not fail");

        let handle = Subscription::new(
            id,
            event_store,
            checkpoint_store,
            Consumer::new().add_handler(collector.clone()),
        )
        .start()
        .await
        .expect("the subscription should start");

        wait_until(|| collector.collected().len() == 2).await;

        handle.stop().await.expect("stop should not fail");

        // Positions 0 and 1 were already checkpointed.
        assert_eq!(vec![2, 3], collector.collected());
    }

    struct FailOnce {
        failed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler<StringMessage> for FailOnce {
        async fn handle(
            &self,
            event: &event::Persisted<StringMessage>,
        ) -> anyhow::Result<Handling> {
            if event.global_position == 0 && self.failed.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient failure");
            }

            Ok(Handling::Success)
        }
    }

    #[tokio::test]
    async fn the_abort_policy_stops_the_subscription_without_checkpointing() {
        let event_store = InMemory::<StringMessage>::default();
        let checkpoint_store = checkpoint::InMemory::default();
        let id = SubscriptionId::from("projection:test");
        let failed = Arc::new(AtomicUsize::new(0));

        append_events(&event_store, 1).await;

        let handle = Subscription::new(
            id,
            event_store,
            checkpoint_store.clone(),
            Consumer::new().add_handler(FailOnce {
                failed: Arc::clone(&failed),
            }),
        )
        .start()
        .await
        .expect("the subscription should start");

        wait_until(|| failed.load(Ordering::SeqCst) > 0).await;

        let error = handle
            .stop()
            .await
            .expect_err("the handler failure should surface");

        assert!(matches!(error, Error::Delivery(_)));
        assert!(checkpoint_store.history().is_empty());
    }

    #[tokio::test]
    async fn the_continue_policy_logs_and_advances_past_the_failure() {
        let event_store = InMemory::<StringMessage>::default();
        let checkpoint_store = checkpoint::InMemory::default();
        let collector = Collector::default();
        let id = SubscriptionId::from("projection:test");

        append_events(&event_store, 2).await;

        let handle = Subscription::new(
            id.clone(),
            event_store,
            checkpoint_store.clone(),
            Consumer::new()
                .add_handler(FailOnce {
                    failed: Arc::default(),
                })
                .add_handler(collector.clone()),
        )
        .with_options(SubscriptionOptions {
            failure_policy: FailurePolicy::Continue,
            ..Default::default()
        })
        .start()
        .await
        .expect("the subscription should start");

        wait_until(|| collector.collected().len() == 2).await;

        handle.stop().await.expect("stop should not fail");

        let checkpoint = checkpoint_store
            .get_last(&id)
            .await
            .expect("get_last should not fail");

        assert_eq!(Some(1), checkpoint.position);
    }

    struct AlwaysPending;

    #[async_trait]
    impl EventHandler<StringMessage> for AlwaysPending {
        async fn handle(
            &self,
            _event: &event::Persisted<StringMessage>,
        ) -> anyhow::Result<Handling> {
            Ok(Handling::Pending)
        }
    }

    #[tokio::test]
    async fn pending_events_are_not_checkpointed() {
        let event_store = InMemory::<StringMessage>::default();
        let checkpoint_store = checkpoint::InMemory::default();
        let id = SubscriptionId::from("projection:test");

        append_events(&event_store, 1).await;

        let handle = Subscription::new(
            id,
            event_store,
            checkpoint_store.clone(),
            Consumer::new().add_handler(AlwaysPending),
        )
        .start()
        .await
        .expect("the subscription should start");

        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.stop().await.expect("stop should not fail");

        assert!(checkpoint_store.history().is_empty());
    }

    #[tokio::test]
    async fn concurrent_workers_still_commit_a_gap_free_checkpoint() {
        let event_store = InMemory::<StringMessage>::default();
        let checkpoint_store = checkpoint::InMemory::default();
        let collector = Collector::default();
        let id = SubscriptionId::from("projection:test");

        append_events(&event_store, 50).await;

        let handle = Subscription::new(
            id.clone(),
            event_store,
            checkpoint_store.clone(),
            Consumer::new().add_handler(collector.clone()),
        )
        .with_options(SubscriptionOptions {
            workers: 4,
            checkpoint: CommitHandlerOptions {
                batch_size: 8,
                ..Default::default()
            },
            ..Default::default()
        })
        .start()
        .await
        .expect("the subscription should start");

        wait_until(|| collector.collected().len() == 50).await;

        handle.stop().await.expect("stop should not fail");

        let checkpoint = checkpoint_store
            .get_last(&id)
            .await
            .expect("get_last should not fail");

        assert_eq!(Some(49), checkpoint.position);

        // Every committed position was gap-free at commit time: the
        // sequence of persisted checkpoints is strictly increasing.
        let history: Vec<_> = checkpoint_store
            .history()
            .into_iter()
            .map(|c| c.position)
            .collect();

        let mut sorted = history.clone();
        sorted.sort();
        assert_eq!(sorted, history);
    }
}
