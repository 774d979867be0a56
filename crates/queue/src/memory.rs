//! In-process queue backend.
//!
//! Mirrors the Redis backend's settlement semantics so workers can be tested
//! without a broker. Unsettled messages stay "in flight" until
//! [`MemoryQueue::recover_unacked`] hands them back, which is what the broker
//! does when a consumer dies.

use async_trait::async_trait;
use mailverify_common::{AppError, AppResult};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::backend::{Delivery, QueueBackend};
use crate::retry::DeadLetterEntry;

#[derive(Default)]
struct State {
    ready: VecDeque<Delivery>,
    in_flight: HashMap<String, Delivery>,
    dead: Vec<DeadLetterEntry>,
    acked: u64,
    discarded: u64,
}

/// Queue kept in memory.
#[derive(Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    next_id: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl MemoryQueue {
    /// Create an empty queue whose idle receive waits up to `poll_interval`.
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            unavailable: Arc::new(AtomicBool::new(false)),
            poll_interval,
        }
    }

    /// Simulate an unreachable broker for every operation.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Return every unsettled message to the head of the queue.
    pub async fn recover_unacked(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut recovered: Vec<Delivery> = state.in_flight.drain().map(|(_, d)| d).collect();
        recovered.sort_by(|a, b| b.id.cmp(&a.id));
        let count = recovered.len();
        for delivery in recovered {
            state.ready.push_front(delivery);
        }
        drop(state);
        if count > 0 {
            self.notify.notify_one();
        }
        count
    }

    /// Messages waiting to be received.
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Messages received but not settled.
    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Messages acknowledged so far.
    pub async fn acked(&self) -> u64 {
        self.state.lock().await.acked
    }

    /// Messages dropped by a nack without requeue.
    pub async fn discarded(&self) -> u64 {
        self.state.lock().await.discarded
    }

    /// Dead-lettered messages.
    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.state.lock().await.dead.clone()
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(AppError::Queue("memory queue is unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn next_id(&self) -> String {
        format!("{:020}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn settle(&self, delivery: &Delivery) -> AppResult<Delivery> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .in_flight
            .remove(&delivery.id)
            .ok_or_else(|| AppError::Queue(format!("unknown delivery {}", delivery.id)))
    }

    async fn try_take(&self) -> Option<Delivery> {
        let mut state = self.state.lock().await;
        let delivery = state.ready.pop_front()?;
        state
            .in_flight
            .insert(delivery.id.clone(), delivery.clone());
        Some(delivery)
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn declare(&self) -> AppResult<()> {
        self.check_available()
    }

    async fn publish(&self, body: &[u8]) -> AppResult<()> {
        self.check_available()?;
        let delivery = Delivery {
            id: self.next_id(),
            body: body.to_vec(),
            attempt: 1,
        };
        self.state.lock().await.ready.push_back(delivery);
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self) -> AppResult<Option<Delivery>> {
        self.check_available()?;
        if let Some(delivery) = self.try_take().await {
            return Ok(Some(delivery));
        }
        let _ = tokio::time::timeout(self.poll_interval, self.notify.notified()).await;
        Ok(self.try_take().await)
    }

    async fn ack(&self, delivery: &Delivery) -> AppResult<()> {
        self.settle(delivery).await?;
        self.state.lock().await.acked += 1;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> AppResult<()> {
        let settled = self.settle(delivery).await?;
        let mut state = self.state.lock().await;
        if requeue {
            state.ready.push_back(Delivery {
                id: self.next_id(),
                body: settled.body,
                attempt: settled.attempt.saturating_add(1),
            });
            drop(state);
            self.notify.notify_one();
        } else {
            state.discarded += 1;
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> AppResult<()> {
        let settled = self.settle(delivery).await?;
        self.state.lock().await.dead.push(DeadLetterEntry::new(
            settled.body,
            settled.attempt,
            reason.to_string(),
        ));
        Ok(())
    }
}
