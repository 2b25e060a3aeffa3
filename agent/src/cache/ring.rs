//! Fixed-capacity ring buffer

use std::sync::RwLock;

struct Ring<T> {
    items: Vec<T>,
    /// Slot overwritten by the next insert once the buffer is full
    index: usize,
}

/// Keeps the most recent `capacity` items
pub struct RingBuffer<T> {
    ring: RwLock<Ring<T>>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: RwLock::new(Ring {
                items: Vec::with_capacity(capacity),
                index: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append, overwriting the oldest item once full
    pub fn insert(&self, item: T) {
        let mut ring = self.ring.write().unwrap_or_else(|e| e.into_inner());
        if ring.items.len() < self.capacity {
            ring.items.push(item);
            return;
        }
        let index = ring.index;
        ring.items[index] = item;
        ring.index = (index + 1) % self.capacity;
    }

    /// Items oldest first
    pub fn collect(&self) -> Vec<T> {
        let ring = self.ring.read().unwrap_or_else(|e| e.into_inner());
        let (newer, older) = ring.items.split_at(ring.index);
        older.iter().chain(newer.iter()).cloned().collect()
    }

    /// Collect and empty the buffer in one step
    pub fn drain(&self) -> Vec<T> {
        let mut ring = self.ring.write().unwrap_or_else(|e| e.into_inner());
        let index = ring.index;
        let mut items = std::mem::take(&mut ring.items);
        ring.index = 0;
        items.rotate_left(index);
        items
    }

    pub fn clear(&self) {
        let mut ring = self.ring.write().unwrap_or_else(|e| e.into_inner());
        ring.items.clear();
        ring.index = 0;
    }

    pub fn len(&self) -> usize {
        let ring = self.ring.read().unwrap_or_else(|e| e.into_inner());
        ring.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_fill_keeps_order() {
        let ring = RingBuffer::new(4);
        ring.insert(1);
        ring.insert(2);
        assert_eq!(ring.collect(), vec![1, 2]);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_drain_empties() {
        let ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.insert(i);
        }
        assert_eq!(ring.drain(), vec![2, 3, 4]);
        assert!(ring.is_empty());

        ring.insert(9);
        assert_eq!(ring.collect(), vec![9]);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let ring = RingBuffer::new(0);
        ring.insert("a");
        ring.insert("b");
        assert_eq!(ring.collect(), vec!["b"]);
    }
}
