use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::core::job::{DispatchMessage, JobId};
use crate::error::QueueError;

/// A dequeued message plus the bookkeeping needed to ack, nack or remove it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub message: DispatchMessage,
    /// Number of times this message has been handed to a consumer.
    pub attempts: u32,
}

impl Delivery {
    pub fn job_id(&self) -> JobId {
        self.message.job_id
    }
}

/// Transport between the submission path and the workers.
///
/// Delivery is at-least-once: a message that is dequeued but never acked can
/// come back. Consumers must be idempotent.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, message: DispatchMessage) -> Result<(), QueueError>;

    /// Waits for the next ready message. Returns `Ok(None)` once the queue is
    /// closed and nothing is left waiting or delayed.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Hands an in-flight message back for redelivery after `delay`.
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Messages not yet started: the waiting partition, then the delayed one.
    async fn list_pending(&self) -> Result<Vec<Delivery>, QueueError>;

    /// Withdraws a not-yet-started message. Returns false if it was already
    /// picked up or never existed.
    async fn remove(&self, delivery: &Delivery) -> Result<bool, QueueError>;

    /// Stops accepting new messages. Already queued work still drains.
    async fn close(&self);
}

#[derive(Default)]
struct QueueInner {
    next_id: u64,
    waiting: VecDeque<Delivery>,
    delayed: Vec<(Instant, Delivery)>,
    inflight: HashMap<u64, Delivery>,
    closed: bool,
}

impl QueueInner {
    fn is_queued(&self, job_id: JobId) -> bool {
        self.waiting.iter().any(|d| d.job_id() == job_id)
            || self.delayed.iter().any(|(_, d)| d.job_id() == job_id)
    }

    /// Moves delayed messages whose time has come to the back of `waiting`.
    fn promote_due(&mut self, now: Instant) {
        let mut due = Vec::new();
        self.delayed.retain(|(at, d)| {
            if *at <= now {
                due.push((*at, d.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(at, d)| (*at, d.id));
        self.waiting.extend(due.into_iter().map(|(_, d)| d));
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

/// In-process queue with waiting, delayed and in-flight partitions.
///
/// A job id that is already waiting or delayed is not enqueued twice.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every unacked in-flight message to the waiting partition, as a
    /// broker does when a consumer dies before acknowledging.
    pub async fn requeue_inflight(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let mut stale: Vec<Delivery> = inner.inflight.drain().map(|(_, d)| d).collect();
        stale.sort_by_key(|d| d.id);
        let count = stale.len();
        inner.waiting.extend(stale);
        drop(inner);
        for _ in 0..count {
            self.notify.notify_one();
        }
        count
    }

    pub async fn inflight_len(&self) -> usize {
        self.inner.lock().await.inflight.len()
    }

    /// Number of messages still waiting or delayed.
    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.waiting.len() + inner.delayed.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, message: DispatchMessage) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if inner.is_queued(message.job_id) {
            return Ok(());
        }
        inner.next_id += 1;
        let delivery = Delivery { id: inner.next_id, message, attempts: 0 };
        inner.waiting.push_back(delivery);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        loop {
            // Registered before the check so a notify between check and wait is not lost.
            let notified = self.notify.notified();

            let next_due = {
                let mut inner = self.inner.lock().await;
                inner.promote_due(Instant::now());
                if let Some(mut delivery) = inner.waiting.pop_front() {
                    delivery.attempts += 1;
                    inner.inflight.insert(delivery.id, delivery.clone());
                    return Ok(Some(delivery));
                }
                if inner.closed && inner.delayed.is_empty() {
                    return Ok(None);
                }
                inner.next_due()
            };

            match next_due {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.inner.lock().await.inflight.remove(&delivery.id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(d) = inner.inflight.remove(&delivery.id) else {
            return Ok(());
        };
        if delay.is_zero() {
            inner.waiting.push_back(d);
        } else {
            inner.delayed.push((Instant::now() + delay, d));
        }
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<Delivery>, QueueError> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<Delivery> = inner.waiting.iter().cloned().collect();
        let mut delayed: Vec<&(Instant, Delivery)> = inner.delayed.iter().collect();
        delayed.sort_by_key(|(at, d)| (*at, d.id));
        pending.extend(delayed.into_iter().map(|(_, d)| d.clone()));
        Ok(pending)
    }

    async fn remove(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        if let Some(pos) = inner.waiting.iter().position(|d| d.id == delivery.id) {
            inner.waiting.remove(pos);
            return Ok(true);
        }
        if let Some(pos) = inner.delayed.iter().position(|(_, d)| d.id == delivery.id) {
            inner.delayed.remove(pos);
            return Ok(true);
        }
        Ok(false)
    }

    async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn msg() -> DispatchMessage {
        DispatchMessage { job_id: JobId::new() }
    }

    #[tokio::test]
    async fn test_fifo_and_attempts() {
        let queue = MemoryQueue::new();
        let (a, b) = (msg(), msg());
        queue.enqueue(a).await.unwrap();
        queue.enqueue(b).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.message, a);
        assert_eq!(second.message, b);
        assert_eq!(first.attempts, 1);
        assert_eq!(queue.inflight_len().await, 2);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.inflight_len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_waiting_message_is_collapsed() {
        let queue = MemoryQueue::new();
        let m = msg();
        queue.enqueue(m).await.unwrap();
        queue.enqueue(m).await.unwrap();
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_only_touches_pending() {
        let queue = MemoryQueue::new();
        queue.enqueue(msg()).await.unwrap();
        queue.enqueue(msg()).await.unwrap();

        let started = queue.dequeue().await.unwrap().unwrap();
        assert!(!queue.remove(&started).await.unwrap());

        let pending = queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(queue.remove(&pending[0]).await.unwrap());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_nack_redelivers_after_delay() {
        let queue = MemoryQueue::new();
        queue.enqueue(msg()).await.unwrap();
        let first = queue.dequeue().await.unwrap().unwrap();

        queue.nack(&first, Duration::from_millis(30)).await.unwrap();
        assert_eq!(queue.list_pending().await.unwrap().len(), 1);

        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_requeue_inflight_models_redelivery() {
        let queue = MemoryQueue::new();
        queue.enqueue(msg()).await.unwrap();
        let first = queue.dequeue().await.unwrap().unwrap();

        assert_eq!(queue.requeue_inflight().await, 1);
        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(again.message, first.message);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = Arc::new(MemoryQueue::new());
        queue.enqueue(msg()).await.unwrap();
        queue.close().await;

        assert_eq!(queue.enqueue(msg()).await, Err(QueueError::Closed));
        assert!(queue.dequeue().await.unwrap().is_some());
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocked_consumer_wakes_on_enqueue_and_close() {
        let queue = Arc::new(MemoryQueue::new());

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(msg()).await.unwrap();
        assert!(consumer.await.unwrap().unwrap().is_some());

        let idle = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close().await;
        assert!(idle.await.unwrap().unwrap().is_none());
    }
}
