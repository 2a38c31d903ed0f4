//! Module containing the [ChannelWorker] primitive: a bounded queue
//! paired with a fixed pool of background worker tasks, used to decouple
//! producers from consumers with configurable backpressure.
//!
//! The worker implements a **two-phase stop protocol**: the queue is
//! first closed for writing and the workers are given a bounded grace
//! period to drain the in-flight and queued items; once the grace period
//! is exceeded, the workers are force-cancelled. Cancellation during a
//! suspension point is a clean stop, not an error. This bounds shutdown
//! latency while still giving queued work a chance to complete.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// The backpressure policy applied by [`ChannelWorker::write`] when the
/// internal queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backpressure {
    /// Suspends the caller until space frees up in the queue.
    #[default]
    Wait,

    /// Fails immediately with [`WriteError::Full`].
    ///
    /// Use this policy when redelivery upstream is cheap, e.g. when the
    /// producer reads from a durable log and can simply retry later.
    FailFast,
}

/// Configuration options for a [ChannelWorker].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// The capacity of the internal queue.
    pub capacity: usize,

    /// The number of background worker tasks, fixed at construction time.
    pub workers: usize,

    /// The backpressure policy applied when the internal queue is full.
    pub backpressure: Backpressure,

    /// The grace period granted to queued and in-flight items during
    /// [`ChannelWorker::stop`], before the workers are force-cancelled.
    pub stop_grace: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            capacity: 128,
            workers: 1,
            backpressure: Backpressure::default(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// All possible error types returned by [`ChannelWorker::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The queue is full, and the worker uses the
    /// [fail-fast][Backpressure::FailFast] backpressure policy.
    #[error("channel is full")]
    Full,

    /// The queue has been closed by [`ChannelWorker::stop`].
    #[error("channel is closed")]
    Closed,
}

/// All possible error types returned by [`ChannelWorker::stop`].
#[derive(Debug, thiserror::Error)]
pub enum StopError {
    /// One of the worker tasks failed while processing an item.
    #[error("worker failed while processing an item: {0}")]
    Worker(#[source] anyhow::Error),

    /// The finalize callback returned an error.
    #[error("finalizer failed: {0}")]
    Finalize(#[source] anyhow::Error),
}

/// The processing step invoked by each worker task on the items taken
/// from the queue.
pub type Process<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// The callback invoked at the end of a graceful [`ChannelWorker::stop`],
/// e.g. to flush buffered work one last time.
pub type Finalize = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A bounded queue paired with a fixed pool of background worker tasks.
///
/// Items submitted through [`write`][ChannelWorker::write] are taken by
/// the workers in queue order; when more than one worker is configured,
/// items are processed concurrently and no cross-item ordering is
/// guaranteed.
///
/// Check out the [module-level documentation][self] for the stop protocol.
pub struct ChannelWorker<T>
where
    T: Send + 'static,
{
    sender: mpsc::Sender<T>,
    backpressure: Backpressure,
    stop_grace: Duration,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
    finalize: Option<Finalize>,
}

impl<T> ChannelWorker<T>
where
    T: Send + 'static,
{
    /// Creates a new [ChannelWorker], spawning the configured number of
    /// worker tasks on the current Tokio runtime.
    pub fn new(options: WorkerOptions, process: Process<T>) -> Self {
        let (sender, receiver) = mpsc::channel(options.capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..options.workers.max(1))
            .map(|_| {
                let receiver = Arc::clone(&receiver);
                let process = Arc::clone(&process);

                tokio::spawn(worker_loop(receiver, process))
            })
            .collect();

        Self {
            sender,
            backpressure: options.backpressure,
            stop_grace: options.stop_grace,
            handles,
            finalize: None,
        }
    }

    /// Sets the callback invoked at the end of a graceful
    /// [`stop`][ChannelWorker::stop], after the workers have drained
    /// the queue within the grace period.
    #[must_use]
    pub fn with_finalizer<F>(mut self, finalize: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        self.finalize = Some(Box::new(finalize));
        self
    }

    /// Returns a cloneable [Writer] handle to submit items to this
    /// worker's queue.
    pub fn writer(&self) -> Writer<T> {
        Writer {
            sender: self.sender.clone(),
            backpressure: self.backpressure,
        }
    }

    /// Submits a new item to the queue.
    ///
    /// With the [`Backpressure::Wait`] policy, the call suspends while
    /// the queue is full; with [`Backpressure::FailFast`], it fails
    /// immediately with [`WriteError::Full`] instead.
    pub async fn write(&self, item: T) -> Result<(), WriteError> {
        write(&self.sender, self.backpressure, item).await
    }

    /// Stops the worker with the two-phase protocol: the queue is closed
    /// for writing, the workers are granted the configured grace period
    /// to drain it, and are force-cancelled past it.
    ///
    /// The finalize callback, if set, runs only when the grace period
    /// was not exceeded.
    pub async fn stop(self) -> Result<(), StopError> {
        let Self {
            sender,
            handles,
            finalize,
            stop_grace,
            ..
        } = self;

        // Phase one: close the queue for writing. Workers drain what is
        // left and exit on their own.
        drop(sender);

        let abort_handles: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let mut drained = join_all(handles);

        let results = match tokio::time::timeout(stop_grace, &mut drained).await {
            Ok(results) => results,
            Err(_) => {
                // Phase two: the grace period is over, cancel whatever is
                // still queued or in flight. Unprocessed items are simply
                // not acknowledged upstream, and will be redelivered.
                tracing::warn!(
                    grace = ?stop_grace,
                    "stop grace period exceeded, cancelling workers"
                );

                for abort in abort_handles {
                    abort.abort();
                }

                return collect_worker_errors(drained.await);
            }
        };

        collect_worker_errors(results)?;

        if let Some(finalize) = finalize {
            finalize().await.map_err(StopError::Finalize)?;
        }

        Ok(())
    }
}

/// A cloneable handle to submit items to a [ChannelWorker] queue.
#[derive(Debug, Clone)]
pub struct Writer<T>
where
    T: Send + 'static,
{
    sender: mpsc::Sender<T>,
    backpressure: Backpressure,
}

impl<T> Writer<T>
where
    T: Send + 'static,
{
    /// Submits a new item to the queue.
    ///
    /// Check out [`ChannelWorker::write`] for the backpressure behavior.
    pub async fn write(&self, item: T) -> Result<(), WriteError> {
        write(&self.sender, self.backpressure, item).await
    }
}

async fn write<T>(
    sender: &mpsc::Sender<T>,
    backpressure: Backpressure,
    item: T,
) -> Result<(), WriteError> {
    match backpressure {
        Backpressure::Wait => sender.send(item).await.map_err(|_| WriteError::Closed),
        Backpressure::FailFast => sender.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => WriteError::Full,
            mpsc::error::TrySendError::Closed(_) => WriteError::Closed,
        }),
    }
}

async fn worker_loop<T>(
    receiver: Arc<Mutex<mpsc::Receiver<T>>>,
    process: Process<T>,
) -> anyhow::Result<()>
where
    T: Send + 'static,
{
    loop {
        // The lock is released before processing, so that the other
        // workers can take the next items concurrently.
        let item = { receiver.lock().await.recv().await };

        // A `None` means the queue has been closed and fully drained.
        let Some(item) = item else {
            return Ok(());
        };

        if let Err(error) = process(item).await {
            tracing::error!(error = %error, "worker failed while processing an item");
            return Err(error);
        }
    }
}

fn collect_worker_errors(
    results: Vec<Result<anyhow::Result<()>, tokio::task::JoinError>>,
) -> Result<(), StopError> {
    for result in results {
        match result {
            Ok(Ok(())) => (),
            Ok(Err(error)) => return Err(StopError::Worker(error)),
            // A cancelled worker is a clean stop, not an error.
            Err(join_error) if join_error.is_cancelled() => (),
            Err(join_error) => return Err(StopError::Worker(join_error.into())),
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use futures::FutureExt;

    use super::*;

    fn counting_process(counter: Arc<AtomicUsize>) -> Process<u64> {
        Arc::new(move |_item| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn queued_items_are_processed_exactly_once() {
        let processed = Arc::new(StdMutex::new(Vec::new()));

        let worker = {
            let processed = Arc::clone(&processed);

            ChannelWorker::new(
                WorkerOptions::default(),
                Arc::new(move |item: u64| {
                    let processed = Arc::clone(&processed);
                    async move {
                        processed.lock().expect("acquire lock on items").push(item);
                        Ok(())
                    }
                    .boxed()
                }),
            )
        };

        for item in 0..10 {
            worker.write(item).await.expect("write should not fail");
        }

        worker.stop().await.expect("stop should not fail");

        let processed = processed.lock().expect("acquire lock on items");
        assert_eq!((0..10).collect::<Vec<_>>(), *processed);
    }

    #[tokio::test]
    async fn fail_fast_backpressure_fails_immediately_on_a_full_queue() {
        let (release, mut wait) = mpsc::channel::<()>(1);

        let worker = ChannelWorker::new(
            WorkerOptions {
                capacity: 1,
                workers: 1,
                backpressure: Backpressure::FailFast,
                stop_grace: Duration::from_secs(1),
            },
            Arc::new(move |_item: u64| {
                let release = release.clone();
                async move {
                    // Park the worker until the test is done asserting.
                    release.send(()).await.ok();
                    release.closed().await;
                    Ok(())
                }
                .boxed()
            }),
        );

        // First item: picked up by the worker, which parks itself.
        worker.write(0).await.expect("write should not fail");
        wait.recv().await.expect("the worker should have started");

        // Second item: sits in the queue, filling it up.
        worker.write(1).await.expect("write should not fail");

        let error = worker
            .write(2)
            .await
            .expect_err("the queue is full, the write should fail");

        assert_eq!(WriteError::Full, error);

        drop(wait);
        worker.stop().await.expect("stop should not fail");
    }

    #[tokio::test]
    async fn blocking_backpressure_suspends_the_writer_and_loses_nothing() {
        let counter = Arc::new(AtomicUsize::new(0));

        let worker = ChannelWorker::new(
            WorkerOptions {
                capacity: 1,
                workers: 1,
                backpressure: Backpressure::Wait,
                stop_grace: Duration::from_secs(5),
            },
            counting_process(Arc::clone(&counter)),
        );

        // More writes than capacity: each one either fits or suspends,
        // but none is ever lost.
        for item in 0..20 {
            worker.write(item).await.expect("write should not fail");
        }

        worker.stop().await.expect("stop should not fail");

        assert_eq!(20, counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn the_finalizer_runs_on_a_graceful_stop() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let counter = Arc::new(AtomicUsize::new(0));

        let worker = ChannelWorker::new(
            WorkerOptions::default(),
            counting_process(Arc::clone(&counter)),
        )
        .with_finalizer({
            let finalized = Arc::clone(&finalized);
            move || {
                async move {
                    finalized.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }
        });

        worker.write(1).await.expect("write should not fail");
        worker.stop().await.expect("stop should not fail");

        assert_eq!(1, finalized.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn the_finalizer_is_skipped_when_the_grace_period_is_exceeded() {
        let finalized = Arc::new(AtomicUsize::new(0));

        let worker = ChannelWorker::new(
            WorkerOptions {
                capacity: 8,
                workers: 1,
                backpressure: Backpressure::Wait,
                stop_grace: Duration::from_millis(50),
            },
            Arc::new(|_item: u64| {
                async move {
                    // Far longer than the stop grace period.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                .boxed()
            }),
        )
        .with_finalizer({
            let finalized = Arc::clone(&finalized);
            move || {
                async move {
                    finalized.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }
        });

        worker.write(1).await.expect("write should not fail");
        worker.stop().await.expect("stop should not fail");

        assert_eq!(0, finalized.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn multiple_workers_share_the_queue() {
        let counter = Arc::new(AtomicUsize::new(0));

        let worker = ChannelWorker::new(
            WorkerOptions {
                capacity: 4,
                workers: 4,
                backpressure: Backpressure::Wait,
                stop_grace: Duration::from_secs(5),
            },
            counting_process(Arc::clone(&counter)),
        );

        for item in 0..100 {
            worker.write(item).await.expect("write should not fail");
        }

        worker.stop().await.expect("stop should not fail");

        assert_eq!(100, counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn a_processing_failure_surfaces_from_stop() {
        let worker = ChannelWorker::new(
            WorkerOptions::default(),
            Arc::new(|_item: u64| async move { Err(anyhow::anyhow!("boom")) }.boxed()),
        );

        worker.write(1).await.expect("write should not fail");

        let error = worker
            .stop()
            .await
            .expect_err("the processing failure should surface");

        assert!(matches!(error, StopError::Worker(_)));
    }
}
