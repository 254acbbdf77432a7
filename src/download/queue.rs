use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::core::error::QueueError;
use crate::core::metrics;

/// Default capacity of a pipeline queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Bounded FIFO queue feeding one worker pool.
///
/// Many producers, many consumers. Items are handed out strictly in
/// insertion order; any priority carried by an item is not used for ordering.
pub struct WorkQueue<T> {
    /// Pipeline name, used for logs and metrics
    name: &'static str,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    available: Notify,
    closed: AtomicBool,
}

impl<T: Send> WorkQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Appends an item. Returns its 1-based position in the queue.
    pub async fn push(&self, item: T) -> Result<usize, QueueError> {
        self.try_push(item).await.map_err(|(e, _)| e)
    }

    /// Like [`push`](Self::push), but a rejected item is handed back.
    pub async fn try_push(&self, item: T) -> Result<usize, (QueueError, T)> {
        if self.closed.load(Ordering::Acquire) {
            return Err((QueueError::Closed(self.name), item));
        }

        let position = {
            let mut items = self.items.lock().await;
            if items.len() >= self.capacity {
                log::warn!("{} queue is full ({} tasks), rejecting task", self.name, items.len());
                return Err((
                    QueueError::Full {
                        pipeline: self.name,
                        capacity: self.capacity,
                    },
                    item,
                ));
            }
            items.push_back(item);
            metrics::update_queue_depth(self.name, items.len());
            items.len()
        };

        self.available.notify_one();
        Ok(position)
    }

    /// Takes the oldest item without waiting.
    pub async fn try_pop(&self) -> Option<T> {
        let mut items = self.items.lock().await;
        let item = items.pop_front();
        if item.is_some() {
            metrics::update_queue_depth(self.name, items.len());
        }
        item
    }

    /// Waits for the oldest item; `None` once `shutdown` is cancelled.
    pub async fn pop(&self, shutdown: &CancellationToken) -> Option<T> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(item) = self.try_pop().await {
                // Pass the wakeup on in case more items are waiting.
                if !self.is_empty().await {
                    self.available.notify_one();
                }
                return Some(item);
            }

            tokio::select! {
                _ = self.available.notified() => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Takes every queued item at once, oldest first.
    pub async fn drain(&self) -> Vec<T> {
        let mut items = self.items.lock().await;
        let drained: Vec<T> = items.drain(..).collect();
        if !drained.is_empty() {
            metrics::update_queue_depth(self.name, 0);
        }
        drained
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Rejects further pushes; queued items can still be drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = WorkQueue::new("test-fifo", 10);
        for i in 0..5 {
            assert_eq!(queue.push(i).await.unwrap(), i + 1);
        }
        let mut out = Vec::new();
        while let Some(i) = queue.try_pop().await {
            out.push(i);
        }
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_drain_empties_a_closed_queue() {
        let queue = WorkQueue::new("test-drain", 10);
        for i in 0..3 {
            queue.push(i).await.unwrap();
        }
        queue.close();
        assert_eq!(queue.drain().await, vec![0, 1, 2]);
        assert!(queue.is_empty().await);
        assert!(queue.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let queue = WorkQueue::new("test-full", 2);
        queue.push("a").await.unwrap();
        queue.push("b").await.unwrap();
        assert_eq!(
            queue.push("c").await,
            Err(QueueError::Full {
                pipeline: "test-full",
                capacity: 2
            })
        );
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_rejected_item_is_handed_back() {
        let queue = WorkQueue::new("test-back", 1);
        queue.push(String::from("first")).await.unwrap();
        let (err, item) = queue.try_push(String::from("second")).await.unwrap_err();
        assert!(matches!(err, QueueError::Full { .. }));
        assert_eq!(item, "second");
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_but_drains() {
        let queue = WorkQueue::new("test-closed", 4);
        queue.push(1).await.unwrap();
        queue.close();
        assert_eq!(queue.push(2).await, Err(QueueError::Closed("test-closed")));
        assert_eq!(queue.try_pop().await, Some(1));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(WorkQueue::new("test-wait", 4));
        let shutdown = CancellationToken::new();

        let consumer = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { queue.pop(&shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(42).await.unwrap();
        assert_eq!(consumer.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_pop_returns_none_on_shutdown() {
        let queue: Arc<WorkQueue<u8>> = Arc::new(WorkQueue::new("test-shutdown", 4));
        let shutdown = CancellationToken::new();

        let consumer = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { queue.pop(&shutdown).await })
        };

        shutdown.cancel();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_every_consumer_gets_an_item() {
        let queue = Arc::new(WorkQueue::new("test-many", 16));
        let shutdown = CancellationToken::new();

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { queue.pop(&shutdown).await })
            })
            .collect();

        for i in 0..3 {
            queue.push(i).await.unwrap();
        }

        let mut got: Vec<i32> = Vec::new();
        for consumer in consumers {
            got.push(consumer.await.unwrap().unwrap());
        }
        got.sort();
        assert_eq!(got, vec![0, 1, 2]);
    }
}
