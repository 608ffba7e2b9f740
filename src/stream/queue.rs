//! Bounded FIFO that evicts its oldest element instead of blocking.
//!
//! Producers (camera callbacks) must never wait on consumers, so an enqueue onto a full
//! queue drops the front element. Consumers never wait either: `dequeue` on an empty
//! queue returns `None`.
//!
//! # Example
//! ```
//! use volume_station::stream::FixedCapacityQueue;
//!
//! let mut queue = FixedCapacityQueue::new(2);
//! queue.enqueue(1);
//! queue.enqueue(2);
//! queue.enqueue(3);
//! assert_eq!(queue.dequeue(), Some(2));
//! assert_eq!(queue.dequeue(), Some(3));
//! assert_eq!(queue.dequeue(), None);
//! ```

use std::collections::VecDeque;

/// Capacity used by every frame stream.
pub const FRAME_QUEUE_CAPACITY: usize = 5;

/// Ring buffer with latest-wins overflow.
#[derive(Debug, Clone)]
pub struct FixedCapacityQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> FixedCapacityQueue<T> {
    /// Create an empty queue. A capacity of 0 is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item, evicting from the front while over capacity.
    ///
    /// Returns the number of evicted items.
    pub fn enqueue(&mut self, item: T) -> usize {
        self.items.push_back(item);
        let mut evicted = 0;
        while self.items.len() > self.capacity {
            self.items.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Oldest item, if any.
    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of buffered items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every buffered item.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T> Default for FixedCapacityQueue<T> {
    fn default() -> Self {
        Self::new(FRAME_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_keeps_latest_in_push_order() {
        let mut queue = FixedCapacityQueue::default();
        for i in 0..12 {
            queue.enqueue(i);
        }
        assert_eq!(queue.len(), FRAME_QUEUE_CAPACITY);

        let drained: Vec<_> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(drained, vec![7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_enqueue_reports_evictions() {
        let mut queue = FixedCapacityQueue::new(2);
        assert_eq!(queue.enqueue('a'), 0);
        assert_eq!(queue.enqueue('b'), 0);
        assert_eq!(queue.enqueue('c'), 1);
    }

    #[test]
    fn test_dequeue_empty_returns_none() {
        let mut queue: FixedCapacityQueue<u8> = FixedCapacityQueue::new(3);
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_under_capacity_is_fifo() {
        let mut queue = FixedCapacityQueue::new(5);
        queue.enqueue("x");
        queue.enqueue("y");
        assert_eq!(queue.dequeue(), Some("x"));
        assert_eq!(queue.dequeue(), Some("y"));
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let mut queue = FixedCapacityQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.enqueue(1);
        queue.enqueue(2);
        queue.clear();
        assert!(queue.is_empty());
    }
}
