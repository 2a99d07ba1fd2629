//! Bounded single-producer/single-consumer rings of owned handles.
//!
//! The same cached-head protocol as the kernel rings, entirely in user
//! space: the producer owns the write head, the consumer the read head,
//! each keeps a cached copy of the other and refreshes it only when its own
//! view runs dry. Capacity is a power of two; with ring capacity twice the
//! buffer pool, neither side can wedge the other under steady state.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct Shared<T> {
    mask: u32,
    size: u32,
    /// Write head; only the producer stores, release-ordered.
    producer: AtomicU32,
    /// Read head; only the consumer stores, release-ordered.
    consumer: AtomicU32,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Slots are only touched by whichever side currently owns them per the
// head/tail protocol.
unsafe impl<T: Send> Sync for Shared<T> {}
unsafe impl<T: Send> Send for Shared<T> {}

/// The enqueue half, held by exactly one thread.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    cached_producer: u32,
    cached_consumer: u32,
}

/// The dequeue half, held by exactly one thread.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    cached_producer: u32,
    cached_consumer: u32,
}

/// Create a ring of the given power-of-two capacity.
pub fn ring<T>(capacity: u32) -> (Producer<T>, Consumer<T>) {
    assert!(capacity.is_power_of_two());

    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let shared = Arc::new(Shared {
        mask: capacity - 1,
        size: capacity,
        producer: AtomicU32::new(0),
        consumer: AtomicU32::new(0),
        slots,
    });

    (
        Producer {
            shared: shared.clone(),
            cached_producer: 0,
            cached_consumer: 0,
        },
        Consumer {
            shared,
            cached_producer: 0,
            cached_consumer: 0,
        },
    )
}

impl<T> Producer<T> {
    /// Enqueue one item; hands it back when the ring is full.
    ///
    /// A full ring is back-pressure, not an error; callers spin (and emit
    /// PAUSE frames) around it.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        let shared = &*self.shared;

        let mut free = self.cached_consumer.wrapping_sub(self.cached_producer);
        if free == 0 {
            // Shift the refreshed consumer up by the ring size so the
            // difference counts free slots, wrap-around included.
            self.cached_consumer = shared
                .consumer
                .load(Ordering::Acquire)
                .wrapping_add(shared.size);
            free = self.cached_consumer.wrapping_sub(self.cached_producer);
            if free == 0 {
                return Err(item);
            }
        }

        let idx = (self.cached_producer & shared.mask) as usize;
        // Safety: the slot is free by the head/tail protocol; only this
        // thread produces.
        unsafe { (*shared.slots[idx].get()).write(item) };

        self.cached_producer = self.cached_producer.wrapping_add(1);
        // The slot write above must be visible before the new head.
        shared.producer.store(self.cached_producer, Ordering::Release);
        Ok(())
    }
}

impl<T> Consumer<T> {
    /// Dequeue one item, if any.
    pub fn pop(&mut self) -> Option<T> {
        let shared = &*self.shared;

        let mut available = self.cached_producer.wrapping_sub(self.cached_consumer);
        if available == 0 {
            self.cached_producer = shared.producer.load(Ordering::Acquire);
            available = self.cached_producer.wrapping_sub(self.cached_consumer);
            if available == 0 {
                return None;
            }
        }

        let idx = (self.cached_consumer & shared.mask) as usize;
        // Safety: the slot was produced (acquire-read head above) and is not
        // yet released; only this thread consumes.
        let item = unsafe { (*shared.slots[idx].get()).assume_init_read() };

        self.cached_consumer = self.cached_consumer.wrapping_add(1);
        // Our read of the slot must be ordered before handing it back.
        shared.consumer.store(self.cached_consumer, Ordering::Release);
        Some(item)
    }

    /// Dequeue up to `max` items into `out`; returns how many.
    pub fn pop_bulk(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.pop() {
                Some(item) => {
                    out.push(item);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // Both halves are gone; whatever is still queued gets dropped here.
        let consumer = *self.consumer.get_mut();
        let producer = *self.producer.get_mut();
        let mut head = consumer;
        while head != producer {
            let idx = (head & self.mask) as usize;
            unsafe { (*self.slots[idx].get()).assume_init_drop() };
            head = head.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let (mut tx, mut rx) = ring::<u32>(8);
        for i in 0..5 {
            tx.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn capacity_is_honored() {
        let (mut tx, mut rx) = ring::<u32>(4);
        for i in 0..4 {
            tx.push(i).unwrap();
        }
        assert_eq!(tx.push(99), Err(99));

        assert_eq!(rx.pop(), Some(0));
        tx.push(99).unwrap();
        assert_eq!(tx.push(100), Err(100));
    }

    #[test]
    fn wraparound_many_times() {
        let (mut tx, mut rx) = ring::<u64>(2);
        for i in 0..1000u64 {
            tx.push(i).unwrap();
            assert_eq!(rx.pop(), Some(i));
        }
    }

    #[test]
    fn pop_bulk_drains_in_order() {
        let (mut tx, mut rx) = ring::<u32>(8);
        for i in 0..6 {
            tx.push(i).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(rx.pop_bulk(&mut out, 4), 4);
        assert_eq!(out, vec![0, 1, 2, 3]);
        assert_eq!(rx.pop_bulk(&mut out, 4), 2);
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn queued_boxes_are_dropped_with_the_ring() {
        let (mut tx, rx) = ring::<Box<u32>>(4);
        tx.push(Box::new(1)).unwrap();
        tx.push(Box::new(2)).unwrap();
        drop(tx);
        drop(rx);
        // Nothing to assert; miri/asan would flag the leak or double free.
    }

    #[test]
    fn cross_thread_transfer() {
        let (mut tx, mut rx) = ring::<Box<u64>>(16);
        let producer = std::thread::spawn(move || {
            for i in 0..10_000u64 {
                let mut item = Box::new(i);
                loop {
                    match tx.push(item) {
                        Ok(()) => break,
                        Err(back) => item = back,
                    }
                    std::hint::spin_loop();
                }
            }
        });

        let mut expect = 0u64;
        while expect < 10_000 {
            if let Some(item) = rx.pop() {
                assert_eq!(*item, expect);
                expect += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().unwrap();
    }
}
