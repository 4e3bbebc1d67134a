//! Fixed-size worker pool.
//!
//! N long-lived tokio tasks drain one shared job queue. Posting waits for
//! a free worker slot, so at most N jobs are queued or running at any time
//! and a burst of outbound replies cannot spawn unbounded work.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// A unit of work executed by one of the pool's workers.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Errors produced by the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is stopped")]
    Stopped,

    #[error("worker pool needs at least one worker")]
    NoWorkers,
}

/// A queued job together with the worker slot it occupies.
struct Queued {
    job: Job,
    _slot: OwnedSemaphorePermit,
}

/// Bounded pool of workers consuming a shared job queue.
///
/// Back-pressure: [`post`](Pool::post) waits until one of the N worker
/// slots is free. [`stop`](Pool::stop) lets the workers finish every job
/// already accepted, then waits for all of them to exit.
pub struct Pool {
    size: usize,
    slots: Arc<Semaphore>,
    jobs_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Queued>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Creates a pool with `size` workers. Must be called inside a tokio
    /// runtime.
    pub fn new(size: usize) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::NoWorkers);
        }

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel::<Queued>();
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));

        let workers = (0..size)
            .map(|index| tokio::spawn(worker(index, Arc::clone(&jobs_rx))))
            .collect();

        debug!(size, "worker pool started");
        Ok(Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            jobs_tx: std::sync::Mutex::new(Some(jobs_tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Number of workers in the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns `true` once [`stop`](Pool::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.sender().is_none()
    }

    /// Enqueues a job, waiting until a worker slot is free.
    pub async fn post<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.sender().ok_or(PoolError::Stopped)?;
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Stopped)?;

        tx.send(Queued {
            job: Box::pin(job),
            _slot: slot,
        })
        .map_err(|_| PoolError::Stopped)
    }

    /// Stops the pool and waits for every worker to exit.
    ///
    /// Jobs accepted before the call still run. Calling `stop` again is a
    /// no-op.
    pub async fn stop(&self) {
        let tx = self
            .jobs_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if tx.is_none() {
            return;
        }
        drop(tx);
        // Wake posters still waiting for a slot.
        self.slots.close();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                error!("worker task failed: {e}");
            }
        }
        debug!(size = self.size, "worker pool stopped");
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Queued>> {
        self.jobs_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Worker loop: runs jobs until the queue is closed and drained.
async fn worker(index: usize, jobs_rx: Arc<Mutex<mpsc::UnboundedReceiver<Queued>>>) {
    loop {
        let next = jobs_rx.lock().await.recv().await;
        let Some(queued) = next else { break };

        if AssertUnwindSafe(queued.job).catch_unwind().await.is_err() {
            error!(worker = index, "job panicked");
        }
    }
    trace!(worker = index, "worker exited");
}
