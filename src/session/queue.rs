//! Bounded FIFO used between the session's dispatcher tasks.
//!
//! Producers wait up to a deadline for space, consumers wait until an item
//! arrives or the owning scope is cancelled. `clear` drops everything queued,
//! which is how barge-in discards pending work.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
}

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    push_timeout: Duration,
    closed: CancellationToken,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_push_timeout(capacity, DEFAULT_PUSH_TIMEOUT)
    }

    pub fn with_push_timeout(capacity: usize, push_timeout: Duration) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            push_timeout,
            closed: CancellationToken::new(),
        }
    }

    pub async fn push(&self, item: T) -> Result<(), QueueError> {
        let deadline = tokio::time::Instant::now() + self.push_timeout;
        let mut item = Some(item);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.is_cancelled() {
                return Err(QueueError::Closed);
            }
            {
                let mut items = self.items.lock();
                if items.len() < self.capacity {
                    if let Some(item) = item.take() {
                        items.push_back(item);
                    }
                    drop(items);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed.cancelled() => return Err(QueueError::Closed),
                _ = tokio::time::sleep_until(deadline) => return Err(QueueError::Full),
            }
        }
    }

    /// Wait for the next item. Returns `None` once `cancel` fires or the queue closes.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.items.lock().pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if self.closed.is_cancelled() {
                return None;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
                _ = self.closed.cancelled() => return None,
            }
        }
    }

    /// Drop all queued items and return how many were discarded.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut items = self.items.lock();
            let dropped = items.len();
            items.clear();
            dropped
        };
        self.not_full.notify_waiters();
        dropped
    }

    pub fn close(&self) {
        self.closed.cancel();
        self.clear();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
