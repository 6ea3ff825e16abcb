//! Multi-producer multi-consumer bounded queue with per-slot sequence
//! counters, after Dmitry Vyukov
//! (https://www.1024cores.net/home/lock-free-algorithms/queues/bounded-mpmc-queue).
//!
//! Only a single producer/consumer pair is active on the single-core
//! kernel; the stronger guarantee is kept so mailboxes survive a
//! multi-core port unchanged.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Capacity must be a power of two of at least 2.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InvalidCapacity;

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct MpmcQueue<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

unsafe impl<T: Send> Sync for MpmcQueue<T> {}
unsafe impl<T: Send> Send for MpmcQueue<T> {}

impl<T: Copy> MpmcQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, InvalidCapacity> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(InvalidCapacity);
        }

        let buffer = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Ok(Self {
            buffer,
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        })
    }

    /// Returns false when the queue is full.
    pub fn enqueue(&self, value: T) -> bool {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        let slot = loop {
            let slot = &self.buffer[pos & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);

            if sequence == pos {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break slot,
                    Err(current) => pos = current,
                }
            } else if sequence < pos {
                return false;
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        };

        unsafe {
            (*slot.value.get()).write(value);
        }
        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
        true
    }

    pub fn dequeue(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = loop {
            let slot = &self.buffer[pos & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);

            if sequence == pos.wrapping_add(1) {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break slot,
                    Err(current) => pos = current,
                }
            } else if sequence <= pos {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        };

        let value = unsafe { (*slot.value.get()).assume_init() };
        slot.sequence
            .store(pos.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn capacity_must_be_a_power_of_two() {
        assert!(MpmcQueue::<u32>::new(0).is_err());
        assert!(MpmcQueue::<u32>::new(1).is_err());
        assert!(MpmcQueue::<u32>::new(3).is_err());
        assert!(MpmcQueue::<u32>::new(256).is_ok());
    }

    #[test]
    fn full_and_empty_are_detected() {
        let queue = MpmcQueue::new(4).unwrap();

        assert_eq!(queue.dequeue(), None);
        for i in 0..4 {
            assert!(queue.enqueue(i));
        }
        assert!(!queue.enqueue(4));
        for i in 0..4 {
            assert_eq!(queue.dequeue(), Some(i));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn no_loss_no_duplication_under_contention() {
        const PRODUCERS: u32 = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u32 = 5_000;

        let queue: Arc<MpmcQueue<u32>> = Arc::new(MpmcQueue::new(64).unwrap());

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let value = p * PER_PRODUCER + i;
                        while !queue.enqueue(value) {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        static DONE: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        match queue.dequeue() {
                            Some(value) => seen.push(value),
                            None => {
                                if DONE.load(std::sync::atomic::Ordering::Acquire) {
                                    // Producers are finished: one last drain
                                    // and the tail cannot grow again
                                    while let Some(value) = queue.dequeue() {
                                        seen.push(value);
                                    }
                                    break;
                                }
                                std::thread::yield_now();
                            }
                        }
                    }
                    seen
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        DONE.store(true, std::sync::atomic::Ordering::Release);

        let mut all = HashSet::new();
        let mut total = 0usize;
        for consumer in consumers {
            for value in consumer.join().unwrap() {
                assert!(all.insert(value), "value {} dequeued twice", value);
                total += 1;
            }
        }
        assert_eq!(total, (PRODUCERS * PER_PRODUCER) as usize);
    }
}
