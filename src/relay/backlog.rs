//! Bounded drop-oldest queue for audio bound to a slow upstream link

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// Default number of frames held per session before the oldest is evicted
pub const DEFAULT_BACKLOG: usize = 32;

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    evicted: u64,
}

/// Single-consumer queue that never blocks the producer
///
/// When full, `push` evicts the oldest item so the newest audio always goes
/// out first once the link recovers.
#[derive(Debug)]
pub struct Backlog<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> Backlog<T> {
    /// Create a backlog holding at most `capacity` items (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                evicted: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, returning `true` if the oldest had to be evicted
    ///
    /// Items pushed after `close` are discarded.
    pub fn push(&self, item: T) -> bool {
        let evicted = {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            let evicted = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.evicted += 1;
                true
            } else {
                false
            };
            inner.items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Wait for the next item; `None` once closed and drained
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting items and wake the consumer
    ///
    /// Items already queued are still returned by `pop`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Items currently queued
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether the backlog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Total items evicted since creation
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn full_backlog_drops_oldest() {
        let backlog = Backlog::new(3);
        for i in 0..5 {
            backlog.push(i);
        }

        assert_eq!(backlog.len(), 3);
        assert_eq!(backlog.evicted(), 2);
        assert_eq!(backlog.pop().await, Some(2));
        assert_eq!(backlog.pop().await, Some(3));
        assert_eq!(backlog.pop().await, Some(4));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let backlog = Backlog::new(4);
        backlog.push("a");
        backlog.close();

        assert!(!backlog.push("late"));
        assert_eq!(backlog.pop().await, Some("a"));
        assert_eq!(backlog.pop().await, None);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let backlog = Arc::new(Backlog::new(4));
        let consumer = {
            let backlog = Arc::clone(&backlog);
            tokio::spawn(async move { backlog.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        backlog.push(7_u32);

        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let backlog: Arc<Backlog<u32>> = Arc::new(Backlog::new(4));
        let consumer = {
            let backlog = Arc::clone(&backlog);
            tokio::spawn(async move { backlog.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        backlog.close();

        assert_eq!(consumer.await.unwrap(), None);
    }
}
