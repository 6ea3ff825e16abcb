//! Single-producer single-consumer bounded queue.
//!
//! The producer is the IRQ handler, the consumer the kernel loop. Head
//! and tail are free-running counters; a slot index is the counter masked
//! by the power-of-two capacity, so all `N` slots are usable.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

pub struct SpscQueue<T, const N: usize> {
    ring: [UnsafeCell<MaybeUninit<T>>; N],
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl<T: Send, const N: usize> Sync for SpscQueue<T, N> {}

impl<T: Copy, const N: usize> SpscQueue<T, N> {
    pub fn new() -> Self {
        assert!(N.is_power_of_two());
        Self {
            ring: core::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Producer side. Returns false when the queue is full.
    pub fn enqueue(&self, value: T) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) == N {
            return false;
        }
        unsafe {
            (*self.ring[head & (N - 1)].get()).write(value);
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side.
    pub fn dequeue(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let value = unsafe { (*self.ring[tail & (N - 1)].get()).assume_init() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Relaxed) == self.head.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_the_first_enqueue_past_capacity() {
        let queue: SpscQueue<u32, 256> = SpscQueue::new();

        for i in 0..256 {
            assert!(queue.enqueue(i), "enqueue {} should have fit", i);
        }
        assert!(!queue.enqueue(256));
    }

    #[test]
    fn drains_in_arrival_order() {
        let queue: SpscQueue<u32, 256> = SpscQueue::new();

        for i in 0..200 {
            assert!(queue.enqueue(i));
        }
        for i in 0..200 {
            assert_eq!(queue.dequeue(), Some(i));
        }
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn wraps_around_without_loss() {
        let queue: SpscQueue<u32, 4> = SpscQueue::new();

        for round in 0..10u32 {
            for i in 0..3 {
                assert!(queue.enqueue(round * 3 + i));
            }
            for i in 0..3 {
                assert_eq!(queue.dequeue(), Some(round * 3 + i));
            }
        }
    }

    #[test]
    fn concurrent_producer_consumer_preserves_the_sequence() {
        use std::sync::Arc;

        let queue: Arc<SpscQueue<u32, 256>> = Arc::new(SpscQueue::new());
        let consumer_queue = Arc::clone(&queue);

        let consumer = std::thread::spawn(move || {
            let mut expected = 0u32;
            while expected < 10_000 {
                if let Some(value) = consumer_queue.dequeue() {
                    assert_eq!(value, expected);
                    expected += 1;
                }
            }
        });

        let mut sent = 0u32;
        while sent < 10_000 {
            if queue.enqueue(sent) {
                sent += 1;
            }
        }

        consumer.join().unwrap();
    }
}
