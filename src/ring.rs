//! Named, bounded, lock-free rings.
//!
//! A [`Ring`] carries owned objects between threads: received buffers in ring
//! mode, buffers headed for transmission, and offload messages. Neither side
//! ever blocks; a full ring hands the object back.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use arrayvec::ArrayVec;
use crossbeam::queue::ArrayQueue;

/// Enqueue/dequeue accounting of a ring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub enq_success: u64,
    pub enq_fail: u64,
    pub deq_success: u64,
}

pub struct Ring<T> {
    name: String,
    queue: ArrayQueue<T>,
    enq_success: AtomicU64,
    enq_fail: AtomicU64,
    deq_success: AtomicU64,
}

impl<T> Ring<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            queue: ArrayQueue::new(capacity.max(1)),
            enq_success: AtomicU64::new(0),
            enq_fail: AtomicU64::new(0),
            deq_success: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueues one object. On a full ring the object is returned.
    #[inline]
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        match self.queue.push(item) {
            Ok(()) => {
                self.enq_success.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(item) => {
                self.enq_fail.fetch_add(1, Ordering::Relaxed);
                Err(item)
            }
        }
    }

    #[inline]
    pub fn dequeue(&self) -> Option<T> {
        let rv = self.queue.pop();
        if rv.is_some() {
            self.deq_success.fetch_add(1, Ordering::Relaxed);
        }
        rv
    }

    /// Moves up to the free space of `burst` objects into it and returns how
    /// many were dequeued by this call.
    #[inline]
    pub fn dequeue_burst<const N: usize>(&self, burst: &mut ArrayVec<T, N>) -> usize {
        let mut n = 0;
        while !burst.is_full() {
            match self.queue.pop() {
                Some(item) => {
                    burst.push(item);
                    n += 1;
                }
                None => break,
            }
        }
        if n > 0 {
            self.deq_success.fetch_add(n as u64, Ordering::Relaxed);
        }
        n
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            enq_success: self.enq_success.load(Ordering::Relaxed),
            enq_fail: self.enq_fail.load(Ordering::Relaxed),
            deq_success: self.deq_success.load(Ordering::Relaxed),
        }
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_ring_returns_item() {
        let ring = Ring::new("rx", 2);
        ring.enqueue(1).unwrap();
        ring.enqueue(2).unwrap();
        assert_eq!(ring.enqueue(3), Err(3));
        assert_eq!(ring.stats().enq_fail, 1);
        assert_eq!(ring.stats().enq_success, 2);
    }

    #[test]
    fn test_dequeue_burst_respects_capacity() {
        let ring = Ring::new("rx", 16);
        for i in 0..10 {
            ring.enqueue(i).unwrap();
        }
        let mut burst: ArrayVec<i32, 4> = ArrayVec::new();
        assert_eq!(ring.dequeue_burst(&mut burst), 4);
        assert_eq!(burst.as_slice(), &[0, 1, 2, 3]);
        burst.clear();
        assert_eq!(ring.dequeue_burst(&mut burst), 4);
        burst.clear();
        assert_eq!(ring.dequeue_burst(&mut burst), 2);
        burst.clear();
        assert_eq!(ring.dequeue_burst(&mut burst), 0);
        assert_eq!(ring.stats().deq_success, 10);
        assert!(ring.is_empty());
    }
}
