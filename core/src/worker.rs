//! Queue consumers.
//!
//! Each worker runs a dequeue loop and hands every message to the
//! orchestrator, one job at a time. Workers share nothing but the queue,
//! the job store and the backoff controller.

use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::engine::Orchestrator;
use crate::core::job::JobStatus;
use crate::core::queue::{Delivery, JobQueue};
use crate::core::throttle::{redelivery_delay, Backoff};
use crate::error::OrchestrationError;
use crate::EngineConfig;

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The orchestrator ran and the job settled in this status.
    Settled(JobStatus),
    /// Redelivery of a job that is running elsewhere or already settled.
    Skipped,
    /// Acked without running: the job is gone or retries are exhausted.
    Dropped,
    /// Probes ran but the terminal write failed. Acked, since a redelivery
    /// would only find the job `running` and skip it.
    Stranded,
    /// Handed back to the queue for a later attempt.
    Retried,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub stranded: usize,
    pub retried: usize,
}

impl WorkerStats {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Settled(JobStatus::Completed) => self.completed += 1,
            Disposition::Settled(JobStatus::Cancelled) => self.cancelled += 1,
            Disposition::Settled(_) => self.failed += 1,
            Disposition::Skipped => self.skipped += 1,
            Disposition::Dropped => self.dropped += 1,
            Disposition::Stranded => self.stranded += 1,
            Disposition::Retried => self.retried += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.completed
            + self.failed
            + self.cancelled
            + self.skipped
            + self.dropped
            + self.stranded
            + self.retried
    }
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, rhs: Self) {
        self.completed += rhs.completed;
        self.failed += rhs.failed;
        self.cancelled += rhs.cancelled;
        self.skipped += rhs.skipped;
        self.dropped += rhs.dropped;
        self.stranded += rhs.stranded;
        self.retried += rhs.retried;
    }
}

pub struct Worker {
    id: usize,
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    backoff: Arc<Backoff>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<Orchestrator>,
        backoff: Arc<Backoff>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            id,
            queue,
            orchestrator,
            backoff,
            max_attempts: config.max_delivery_attempts.max(1),
            retry_delay: config.retry_delay(),
        }
    }

    /// Consumes until `shutdown` fires or the queue is closed and drained.
    /// A job already in progress always runs to completion.
    pub async fn run(self, shutdown: CancellationToken) -> WorkerStats {
        let mut stats = WorkerStats::default();
        info!("worker {} started", self.id);

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.queue.dequeue() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    self.backoff.record_success();
                    stats.record(self.handle(delivery).await);
                }
                Ok(None) => {
                    debug!("worker {}: queue closed and drained", self.id);
                    break;
                }
                Err(e) => {
                    let delay = self.backoff.record_failure();
                    warn!("worker {}: dequeue failed, backing off {}ms: {}", self.id, delay, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.backoff.wait() => {}
                    }
                }
            }
        }

        info!("worker {} stopped after {} message(s)", self.id, stats.processed());
        stats
    }

    /// Runs one delivery through the orchestrator and settles it with the queue.
    pub async fn handle(&self, delivery: Delivery) -> Disposition {
        let job_id = delivery.job_id();
        debug!("worker {}: job {} (attempt {})", self.id, job_id, delivery.attempts);

        let disposition = match self.orchestrator.execute(job_id).await {
            Ok(job) => Disposition::Settled(job.status),
            Err(e) if e.is_noop() => {
                debug!("worker {}: {}", self.id, e);
                Disposition::Skipped
            }
            Err(OrchestrationError::NotFound(_)) => {
                warn!("worker {}: dropping message for missing job {}", self.id, job_id);
                Disposition::Dropped
            }
            Err(e) if e.is_stranded() => {
                error!("worker {}: job {} left running: {}", self.id, job_id, e);
                Disposition::Stranded
            }
            Err(e) if delivery.attempts >= self.max_attempts => {
                error!(
                    "worker {}: job {} gave up after {} attempt(s): {}",
                    self.id, job_id, delivery.attempts, e
                );
                Disposition::Dropped
            }
            Err(e) => {
                let delay = redelivery_delay(self.retry_delay, delivery.attempts);
                warn!("worker {}: job {} will be retried in {:?}: {}", self.id, job_id, delay, e);
                if let Err(qe) = self.queue.nack(&delivery, delay).await {
                    warn!("worker {}: nack for job {} failed: {}", self.id, job_id, qe);
                }
                return Disposition::Retried;
            }
        };

        // A lost ack only means a redelivery, which the orchestrator treats as a no-op.
        if let Err(e) = self.queue.ack(&delivery).await {
            warn!("worker {}: ack for job {} failed: {}", self.id, job_id, e);
        }
        disposition
    }
}

/// A set of workers with one shutdown signal.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<WorkerStats>>,
}

impl WorkerPool {
    /// Spawns `config.workers` workers on the current runtime.
    pub fn spawn(
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<Orchestrator>,
        config: &EngineConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let backoff = Arc::new(Backoff::new());

        let handles = (0..config.workers.max(1))
            .map(|id| {
                let worker = Worker::new(
                    id,
                    Arc::clone(&queue),
                    Arc::clone(&orchestrator),
                    Arc::clone(&backoff),
                    config,
                );
                tokio::spawn(worker.run(shutdown.child_token()))
            })
            .collect();

        Self { queue, shutdown, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Closes the queue and waits until every queued job has been handled.
    pub async fn drain(self) -> WorkerStats {
        self.queue.close().await;
        self.join().await
    }

    /// Stops taking new messages; jobs already running finish first.
    pub async fn shutdown(self) -> WorkerStats {
        self.shutdown.cancel();
        self.join().await
    }

    async fn join(self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for result in join_all(self.handles).await {
            match result {
                Ok(stats) => total += stats,
                Err(e) => error!("worker task ended abnormally: {}", e),
            }
        }
        total
    }
}
