/*!
 * Bounded FIFO buffers for messages and frames.
 *
 * A [`MessageBuffer`] has a single owner (a postman's inbound queue, a
 * machine's inbox) and performs no synchronization of its own.
 */
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default buffer capacity
pub const DEFAULT_CAPACITY: usize = 100;

/// What a full buffer does with a new item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new item with [`Error::Overflow`]
    Reject,
    /// Drop the oldest item to make room
    #[default]
    EvictOldest,
}

/// A bounded, ordered holding area
#[derive(Debug, Clone)]
pub struct MessageBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> MessageBuffer<T> {
    /// Create a buffer with the default capacity and eviction policy
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, OverflowPolicy::default())
    }

    /// Create a buffer with an explicit capacity and overflow policy
    ///
    /// A capacity of zero is raised to one.
    pub fn with_capacity(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            policy,
        }
    }

    /// Append an item
    ///
    /// Under [`OverflowPolicy::EvictOldest`] a full buffer drops its oldest
    /// item and returns it; under [`OverflowPolicy::Reject`] the new item is
    /// refused.
    pub fn store(&mut self, item: T) -> Result<Option<T>> {
        let mut evicted = None;
        if self.is_full() {
            match self.policy {
                OverflowPolicy::Reject => return Err(Error::Overflow(self.capacity)),
                OverflowPolicy::EvictOldest => evicted = self.items.pop_front(),
            }
        }
        self.items.push_back(item);
        Ok(evicted)
    }

    /// Remove and return the oldest item, or `None` when empty
    pub fn get(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Look at the oldest item without removing it
    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    /// Whether the buffer holds no items
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the buffer is at capacity
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Number of buffered items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Maximum number of items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured overflow policy
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Drop every buffered item
    pub fn flush(&mut self) {
        self.items.clear();
    }

    /// Remove every buffered item in FIFO order
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }
}

impl<T> Default for MessageBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut buffer = MessageBuffer::with_capacity(5, OverflowPolicy::Reject);
        for i in 0..5 {
            buffer.store(i).unwrap();
        }
        let drained: Vec<_> = std::iter::from_fn(|| buffer.get()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_get_on_empty_is_none() {
        let mut buffer: MessageBuffer<String> = MessageBuffer::new();
        assert_eq!(buffer.get(), None);
        assert_eq!(buffer.capacity(), DEFAULT_CAPACITY);
        assert_eq!(buffer.policy(), OverflowPolicy::EvictOldest);
    }

    #[test]
    fn test_evict_oldest() {
        let mut buffer = MessageBuffer::with_capacity(3, OverflowPolicy::EvictOldest);
        buffer.store("a").unwrap();
        buffer.store("b").unwrap();
        assert!(!buffer.is_full());
        buffer.store("c").unwrap();
        assert!(buffer.is_full());

        let evicted = buffer.store("d").unwrap();
        assert_eq!(evicted, Some("a"));
        assert_eq!(buffer.len(), 3);
        assert!(buffer.is_full());
        assert_eq!(buffer.peek(), Some(&"b"));
    }

    #[test]
    fn test_reject_when_full() {
        let mut buffer = MessageBuffer::with_capacity(2, OverflowPolicy::Reject);
        buffer.store(1).unwrap();
        buffer.store(2).unwrap();
        assert!(matches!(buffer.store(3), Err(Error::Overflow(2))));
        assert_eq!(buffer.drain().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_flush_and_zero_capacity() {
        let mut buffer = MessageBuffer::with_capacity(0, OverflowPolicy::EvictOldest);
        assert_eq!(buffer.capacity(), 1);
        buffer.store(7).unwrap();
        buffer.flush();
        assert!(buffer.is_empty());
    }
}
