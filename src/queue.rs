use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

/// Typed FIFO between an Indexer and a DB Writer, one per chain.
///
/// `put` blocks once `len() >= ceiling`, giving the Indexer a back-pressure
/// hook so an outpaced writer can't grow the queue without bound.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    not_full: Notify,
    ceiling: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(ceiling: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            not_full: Notify::new(),
            ceiling,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Appends `item`, waiting if the queue is already at capacity.
    pub async fn put(&self, item: T) {
        loop {
            {
                let mut guard = self.inner.lock().await;
                if guard.len() < self.ceiling {
                    guard.push_back(item);
                    return;
                }
            }
            self.not_full.notified().await;
        }
    }

    /// Removes and returns up to `max` items from the front, or none if empty.
    /// Does not wait; callers poll on their own sleep interval.
    pub async fn take_batch(&self, max: usize) -> Vec<T> {
        let mut guard = self.inner.lock().await;
        let n = max.min(guard.len());
        let batch: Vec<T> = guard.drain(..n).collect();
        if !batch.is_empty() {
            self.not_full.notify_waiters();
        }
        batch
    }

    /// Re-queues `items` at the head, preserving their relative order, used
    /// when a batch commit fails fatally and must not be lost.
    pub async fn requeue_front(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let mut guard = self.inner.lock().await;
        for item in items.into_iter().rev() {
            guard.push_front(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_take_preserves_order() {
        let q: BoundedQueue<i32> = BoundedQueue::new(10);
        q.put(1).await;
        q.put(2).await;
        q.put(3).await;
        assert_eq!(q.take_batch(2).await, vec![1, 2]);
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn requeue_front_restores_original_order() {
        let q: BoundedQueue<i32> = BoundedQueue::new(10);
        q.put(3).await;
        q.requeue_front(vec![1, 2]).await;
        assert_eq!(q.take_batch(3).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn put_blocks_past_ceiling_until_space_freed() {
        let q: std::sync::Arc<BoundedQueue<i32>> = std::sync::Arc::new(BoundedQueue::new(1));
        q.put(1).await;

        let q2 = q.clone();
        let blocked = tokio::spawn(async move {
            q2.put(2).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        let _ = q.take_batch(1).await;
        blocked.await.unwrap();
        assert_eq!(q.len().await, 1);
    }
}
