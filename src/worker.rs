//! Bounded comparison queue and worker pool.
//!
//! A fixed number of long-lived workers drain a bounded channel of
//! [`CompareJob`]s. Enqueueing never blocks the serving path: a full queue
//! drops the job and the caller records the drop. On shutdown the pool stops
//! accepting, lets in-flight jobs finish within a grace period, and discards
//! whatever is still queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::shadow::{CompareJob, ShadowContext};

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity; the job is dropped.
    QueueFull,
    /// The pool is shutting down and no longer accepts work.
    ShuttingDown,
}

/// Handle to the running worker pool.
pub struct WorkerPool {
    tx: mpsc::Sender<CompareJob>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `count` workers draining a queue of `queue_size` jobs.
    pub fn start(count: usize, queue_size: usize, ctx: Arc<ShadowContext>) -> Self {
        let (tx, rx) = mpsc::channel::<CompareJob>(queue_size);
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();

        let workers = (0..count)
            .map(|id| {
                let rx = Arc::clone(&rx);
                let ctx = Arc::clone(&ctx);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        // Take the next job unless shutdown wins the race;
                        // a job already started always runs to completion.
                        let job = tokio::select! {
                            job = async { rx.lock().await.recv().await } => job,
                            () = shutdown.cancelled() => None,
                        };
                        let Some(job) = job else {
                            debug!(worker = id, "comparison worker stopping");
                            break;
                        };
                        job.run(&ctx).await;
                    }
                })
            })
            .collect();

        info!(workers = count, queue_size, "comparison worker pool started");

        Self {
            tx,
            workers: Mutex::new(workers),
            shutdown,
        }
    }

    /// Non-blocking enqueue. The client has already been served when this is
    /// called, so a full queue is resolved by dropping the job, never by
    /// waiting.
    pub fn try_enqueue(&self, job: CompareJob) -> Result<(), EnqueueError> {
        if self.shutdown.is_cancelled() {
            return Err(EnqueueError::ShuttingDown);
        }
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::ShuttingDown,
        })
    }

    /// Stop accepting jobs, let in-flight jobs finish within `grace`, then
    /// abort stragglers. Queued-but-unstarted jobs are discarded. Returns
    /// whether the drain completed in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();

        let mut workers = self.workers.lock().await;
        let drained = tokio::time::timeout(grace, async {
            for worker in workers.drain(..) {
                let _ = worker.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                grace_secs = grace.as_secs(),
                "comparison workers did not drain in time, aborting"
            );
            for worker in workers.drain(..) {
                worker.abort();
            }
        }
        drained
    }
}
