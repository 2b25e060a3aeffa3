//! Ring buffer unit tests

use std::sync::Arc;

use dt_agent::cache::ring::RingBuffer;

#[test]
fn test_ring_keeps_insertion_order_under_capacity() {
    let ring = RingBuffer::new(4);
    ring.insert(1);
    ring.insert(2);

    assert_eq!(ring.collect(), vec![1, 2]);
    assert_eq!(ring.len(), 2);
}

#[test]
fn test_ring_wraps_oldest_first() {
    let ring = RingBuffer::new(3);
    for i in 1..=5 {
        ring.insert(i);
    }

    // 1 and 2 were overwritten
    assert_eq!(ring.collect(), vec![3, 4, 5]);
    assert_eq!(ring.len(), 3);
    assert_eq!(ring.capacity(), 3);
}

#[test]
fn test_ring_drain_empties() {
    let ring = RingBuffer::new(2);
    for i in 0..7 {
        ring.insert(i);
    }

    assert_eq!(ring.drain(), vec![5, 6]);
    assert!(ring.is_empty());

    ring.insert(9);
    assert_eq!(ring.collect(), vec![9]);
}

#[test]
fn test_ring_zero_capacity_keeps_latest() {
    let ring = RingBuffer::new(0);
    ring.insert("a");
    ring.insert("b");
    assert_eq!(ring.collect(), vec!["b"]);
}

#[test]
fn test_ring_concurrent_inserts() {
    let ring = Arc::new(RingBuffer::new(100));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    ring.insert(t * 1000 + i);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(ring.len(), 100);
    ring.clear();
    assert!(ring.is_empty());
}
