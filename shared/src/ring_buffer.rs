//! Fixed-capacity ring buffer indexed by age.
//!
//! Age 0 is the most recently pushed item. Once the buffer is full each push
//! evicts the oldest item. Reads past the retained history are errors rather
//! than default values, so a caller can never mistake a missing frame for a
//! zeroed one.

use crate::error::{NetcodeError, Result};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    written: u64,
}

impl<T> RingBuffer<T> {
    /// Creates an empty buffer. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            written: 0,
        }
    }

    /// Appends an item, returning the evicted oldest item when full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        self.written += 1;
        evicted
    }

    /// Returns the item `age` pushes before the newest.
    pub fn get(&self, age: usize) -> Result<&T> {
        let size = self.items.len();
        if age >= size {
            return Err(NetcodeError::OutOfRange { age, size });
        }
        Ok(&self.items[size - 1 - age])
    }

    pub fn get_mut(&mut self, age: usize) -> Result<&mut T> {
        let size = self.items.len();
        if age >= size {
            return Err(NetcodeError::OutOfRange { age, size });
        }
        Ok(&mut self.items[size - 1 - age])
    }

    pub fn newest(&self) -> Result<&T> {
        self.items.back().ok_or(NetcodeError::EmptyBuffer)
    }

    pub fn oldest(&self) -> Result<&T> {
        self.items.front().ok_or(NetcodeError::EmptyBuffer)
    }

    /// Inserts at an absolute position counted from the oldest item, evicting
    /// the oldest item first if the buffer is full.
    pub(crate) fn insert_at(&mut self, index: usize, item: T) {
        let mut index = index.min(self.items.len());
        if self.items.len() == self.capacity {
            self.items.pop_front();
            index = index.saturating_sub(1);
        }
        self.items.insert(index, item);
        self.written += 1;
    }

    /// Iterates oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> + ExactSizeIterator {
        self.items.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of items ever written, including evicted ones.
    pub fn items_written(&self) -> u64 {
        self.written
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_three_example() {
        let mut buffer = RingBuffer::new(3);
        for frame in 1..=4 {
            buffer.push(frame);
        }

        assert_eq!(*buffer.get(0).unwrap(), 4);
        assert_eq!(*buffer.get(1).unwrap(), 3);
        assert_eq!(*buffer.get(2).unwrap(), 2);
        assert_eq!(
            buffer.get(3),
            Err(NetcodeError::OutOfRange { age: 3, size: 3 })
        );
    }

    #[test]
    fn test_wraparound_many_pushes() {
        let capacity = 5;
        let pushed = 23;
        let mut buffer = RingBuffer::new(capacity);
        for i in 1..=pushed {
            buffer.push(i);
        }

        assert_eq!(*buffer.get(0).unwrap(), pushed);
        assert_eq!(*buffer.get(capacity - 1).unwrap(), pushed - capacity + 1);
        assert!(buffer.get(capacity).is_err());
        assert_eq!(buffer.items_written(), pushed as u64);
        assert!(buffer.is_full());
    }

    #[test]
    fn test_partial_fill_range() {
        let mut buffer = RingBuffer::new(8);
        buffer.push('a');
        buffer.push('b');

        assert_eq!(buffer.len(), 2);
        assert_eq!(*buffer.get(1).unwrap(), 'a');
        assert_eq!(
            buffer.get(2),
            Err(NetcodeError::OutOfRange { age: 2, size: 2 })
        );
    }

    #[test]
    fn test_empty_accessors_fail() {
        let buffer: RingBuffer<u32> = RingBuffer::new(4);
        assert_eq!(buffer.newest(), Err(NetcodeError::EmptyBuffer));
        assert_eq!(buffer.oldest(), Err(NetcodeError::EmptyBuffer));
        assert!(buffer.get(0).is_err());
    }

    #[test]
    fn test_newest_oldest_and_eviction() {
        let mut buffer = RingBuffer::new(2);
        assert_eq!(buffer.push(1), None);
        assert_eq!(buffer.push(2), None);
        assert_eq!(buffer.push(3), Some(1));

        assert_eq!(*buffer.newest().unwrap(), 3);
        assert_eq!(*buffer.oldest().unwrap(), 2);
    }

    #[test]
    fn test_insert_at_when_full_evicts_oldest() {
        let mut buffer = RingBuffer::new(3);
        buffer.push(10);
        buffer.push(30);
        buffer.push(40);

        buffer.insert_at(1, 20);

        let items: Vec<_> = buffer.iter().copied().collect();
        assert_eq!(items, vec![20, 30, 40]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut buffer = RingBuffer::new(0);
        buffer.push(1);
        buffer.push(2);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(*buffer.get(0).unwrap(), 2);
    }
}
