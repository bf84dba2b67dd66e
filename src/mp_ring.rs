//! Multi-producer, single-consumer ring buffer.
//!
//! [`MpRingBuffer`] wraps a [`RingBuffer`] and serializes every producer-side
//! mutation behind a [`ScopedRawMutex`], so `push` can be called through a
//! shared reference from any number of threads or interrupt handlers. The
//! consumer side stays lock-free except for the requeue operations, which
//! write at `head` and therefore take the lock as well.
//!
//! Requeueing moves an element from the front of the queue to the back in
//! place, which lets a consumer keep repeating work queued without popping and
//! re-pushing it (and without ever losing its slot to a producer in between).

use core::fmt;

use crate::error::{Full, ResizeError};
use crate::lock::{DefaultLock, ScopedRawMutex};
use crate::loom::atomic::Ordering;
use crate::ring::{Consumer, RingBuffer};

/// Bounded FIFO for many producers and one consumer.
pub struct MpRingBuffer<T, L = DefaultLock> {
    ring: RingBuffer<T>,
    lock: L,
}

impl<T, L: ScopedRawMutex + Default> MpRingBuffer<T, L> {
    /// Create a zero-capacity queue.
    pub fn new() -> Self {
        Self::with_lock(0, L::default())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_lock(capacity, L::default())
    }
}

impl<T, L: ScopedRawMutex> MpRingBuffer<T, L> {
    pub fn with_lock(capacity: usize, lock: L) -> Self {
        Self {
            ring: RingBuffer::with_capacity(capacity),
            lock,
        }
    }

    /// Take over an existing ring buffer and its queued elements.
    pub fn from_ring(ring: RingBuffer<T>, lock: L) -> Self {
        Self { ring, lock }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.ring.available()
    }

    #[inline]
    pub fn available_for_push(&self) -> usize {
        self.ring.available_for_push()
    }

    /// Push one value. May be called concurrently from any number of
    /// producers.
    pub fn push(&self, value: T) -> Result<(), Full<T>> {
        // SAFETY: the lock makes us the only producer.
        self.lock.with_lock(|| unsafe { self.ring.push_unchecked(value) })
    }

    /// Push clones of as many elements of `src` as fit. The elements land
    /// contiguously; no other producer can interleave.
    pub fn push_n(&self, src: &[T]) -> usize
    where
        T: Clone,
    {
        // SAFETY: the lock makes us the only producer.
        self.lock.with_lock(|| unsafe { self.ring.push_n_unchecked(src) })
    }

    /// Create the consumer handle.
    ///
    /// # Panics
    /// If a consumer handle is already alive.
    #[track_caller]
    pub fn consumer(&self) -> MpConsumer<'_, T, L> {
        MpConsumer {
            inner: self.ring.consumer(),
            lock: &self.lock,
        }
    }

    /// Create the consumer handle, or `None` if one is already alive.
    pub fn try_consumer(&self) -> Option<MpConsumer<'_, T, L>> {
        self.ring.try_consumer().map(|inner| MpConsumer {
            inner,
            lock: &self.lock,
        })
    }
}

impl<T, L: ScopedRawMutex + Default> Default for MpRingBuffer<T, L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, L: ScopedRawMutex + Default> From<RingBuffer<T>> for MpRingBuffer<T, L> {
    fn from(ring: RingBuffer<T>) -> Self {
        Self::from_ring(ring, L::default())
    }
}

impl<T, L: fmt::Debug> fmt::Debug for MpRingBuffer<T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpRingBuffer")
            .field("ring", &self.ring)
            .field("lock", &self.lock)
            .finish()
    }
}

/// Read side of an [`MpRingBuffer`].
pub struct MpConsumer<'a, T, L = DefaultLock> {
    inner: Consumer<'a, T>,
    lock: &'a L,
}

impl<T, L: ScopedRawMutex> MpConsumer<'_, T, L> {
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        self.inner.pop()
    }

    #[inline]
    pub fn pop_n(&mut self, dst: &mut [T]) -> usize {
        self.inner.pop_n(dst)
    }

    #[inline]
    pub fn peek(&self) -> Option<&T> {
        self.inner.peek()
    }

    pub fn flush(&mut self) {
        self.inner.flush()
    }

    /// See [`Consumer::for_each`].
    pub fn for_each(&mut self, visit: impl FnMut(T)) {
        self.inner.for_each(visit)
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.inner.available()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Resize the queue, keeping the queued elements in order.
    ///
    /// Producers are held off by the lock for the duration of the resize.
    ///
    /// # Panics
    /// If `capacity` is `usize::MAX`.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), ResizeError> {
        let ring = self.inner.ring;
        // SAFETY: the lock excludes producers, and `&mut self` is the only
        // consumer.
        self.lock
            .with_lock(|| unsafe { ring.resize_unchecked(capacity) })
    }

    /// Move the oldest element to the back of the queue and return it.
    ///
    /// The queue length is unchanged. Returns `None` if the queue is empty.
    pub fn pop_requeue(&mut self) -> Option<&mut T> {
        let ring = self.inner.ring;
        let idx = self.lock.with_lock(|| {
            let tail = ring.tail.load(Ordering::Relaxed);
            let head = ring.head.load(Ordering::Relaxed);
            if tail == head {
                return None;
            }
            // SAFETY: we hold the lock and the consumer handle.
            unsafe { requeue_front(ring, tail, head) };
            Some(head)
        })?;
        // SAFETY: the element now sits just behind `head`, where no producer
        // writes until it has been popped, and popping needs `&mut self`.
        Some(unsafe { ring.value_mut(idx) })
    }

    /// Visit every element queued at the time of the call, oldest first, and
    /// keep or drop each one.
    ///
    /// If `keep` returns `true` the element is moved to the back of the queue;
    /// otherwise it is dropped. Kept elements land behind everything that was
    /// queued when the pass started and are not visited again by this pass.
    /// Elements pushed by producers during the pass are not visited either;
    /// they may end up before or after requeued elements.
    ///
    /// Returns `false` if the queue was empty.
    ///
    /// If `keep` panics, the element it was looking at stays at the front of
    /// the queue.
    pub fn for_each_requeue(&mut self, mut keep: impl FnMut(&mut T) -> bool) -> bool {
        let ring = self.inner.ring;
        let size = ring.size();
        let end = ring.head.load(Ordering::Acquire);
        let mut tail = ring.tail.load(Ordering::Relaxed);
        if tail == end {
            return false;
        }

        while tail != end {
            // SAFETY: `tail` is occupied and only the consumer touches it.
            let value = unsafe { ring.value_mut(tail) };
            if keep(value) {
                self.lock.with_lock(|| {
                    let head = ring.head.load(Ordering::Relaxed);
                    // SAFETY: we hold the lock and the consumer handle.
                    unsafe { requeue_front(ring, tail, head) };
                });
            } else {
                // SAFETY: `tail` is occupied and only the consumer touches it.
                let dropped = unsafe { ring.read_slot(tail) };
                ring.tail.store((tail + 1) % size, Ordering::Release);
                drop(dropped);
            }
            tail = (tail + 1) % size;
        }
        true
    }
}

/// Move the element at `tail` into the free slot at `head` and advance both.
///
/// Both indices move while the lock is held, so producers never observe the
/// moment where a full queue's `head` has caught up with its old `tail`.
///
/// # Safety
/// The caller holds the producer lock, is the only consumer, and the queue is
/// not empty.
unsafe fn requeue_front<T>(ring: &RingBuffer<T>, tail: usize, head: usize) {
    let size = ring.size();
    unsafe {
        let value = ring.read_slot(tail);
        ring.write_slot(head, value);
    }
    ring.tail.store((tail + 1) % size, Ordering::Release);
    ring.head.store((head + 1) % size, Ordering::Release);
}

impl<T, L: fmt::Debug> fmt::Debug for MpConsumer<'_, T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpConsumer")
            .field("inner", &self.inner)
            .field("lock", self.lock)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::MpRingBuffer;
    use crate::lock::SpinLock;
    use crate::ring::RingBuffer;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::vec::Vec;

    type Queue<T> = MpRingBuffer<T, SpinLock>;

    #[test]
    fn pop_requeue_rotates() {
        let queue = Queue::with_capacity(3);
        queue.push_n(&[1, 2, 3]);
        let mut consumer = queue.consumer();

        assert_eq!(consumer.pop_requeue().copied(), Some(1));
        assert_eq!(consumer.available(), 3);
        assert_eq!(consumer.pop(), Some(2));
        assert_eq!(consumer.pop(), Some(3));
        assert_eq!(consumer.pop(), Some(1));
        assert_eq!(consumer.pop_requeue(), None);
    }

    #[test]
    fn pop_requeue_returns_mutable_element() {
        let queue = Queue::with_capacity(2);
        queue.push(10).unwrap();
        let mut consumer = queue.consumer();

        *consumer.pop_requeue().unwrap() += 1;
        assert_eq!(consumer.peek(), Some(&11));
    }

    #[test]
    fn pop_requeue_at_capacity_keeps_queue_full() {
        let queue = Queue::with_capacity(3);
        queue.push_n(&[1, 2, 3]);
        let mut consumer = queue.consumer();

        for expected in [1, 2, 3, 1] {
            assert_eq!(consumer.pop_requeue().copied(), Some(expected));
            assert!(queue.push(9).is_err());
            assert_eq!(consumer.available(), 3);
        }

        let mut out = [0; 3];
        assert_eq!(consumer.pop_n(&mut out), 3);
        assert_eq!(out, [2, 3, 1]);
    }

    #[test]
    fn for_each_requeue_on_empty_returns_false() {
        let queue = Queue::<u32>::with_capacity(4);
        let mut calls = 0;
        assert!(!queue.consumer().for_each_requeue(|_| {
            calls += 1;
            true
        }));
        assert_eq!(calls, 0);
    }

    #[test]
    fn for_each_requeue_keeps_even() {
        let queue = Queue::with_capacity(5);
        queue.push_n(&[1, 2, 3, 4, 5]);
        let mut consumer = queue.consumer();

        let mut visited = Vec::new();
        assert!(consumer.for_each_requeue(|v| {
            visited.push(*v);
            *v % 2 == 0
        }));
        assert_eq!(visited, [1, 2, 3, 4, 5]);

        let mut rest = Vec::new();
        consumer.for_each(|v| rest.push(v));
        assert_eq!(rest, [2, 4]);
    }

    #[test]
    fn for_each_requeue_ignores_concurrent_pushes() {
        let queue = Queue::with_capacity(4);
        queue.push_n(&[1, 2]);
        let mut consumer = queue.consumer();

        let mut visited = Vec::new();
        consumer.for_each_requeue(|v| {
            visited.push(*v);
            queue.push(*v + 100).unwrap();
            true
        });
        assert_eq!(visited, [1, 2]);
        assert_eq!(consumer.available(), 4);

        let mut rest = Vec::new();
        consumer.for_each(|v| rest.push(v));
        // Pushes and requeues race for the back; here they alternate.
        assert_eq!(rest, [101, 1, 102, 2]);
    }

    #[test]
    fn full_queue_requeue_does_not_admit_producers() {
        let queue = Queue::with_capacity(2);
        queue.push_n(&[1, 2]);
        let mut consumer = queue.consumer();

        consumer.for_each_requeue(|v| {
            assert!(queue.push(*v + 100).is_err());
            true
        });
        assert_eq!(consumer.available(), 2);
        assert_eq!(consumer.pop(), Some(1));
        assert_eq!(consumer.pop(), Some(2));
    }

    #[test]
    fn requeue_survives_panicking_predicate() {
        let queue = Queue::with_capacity(3);
        queue.push_n(&[1, 2, 3]);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            queue.consumer().for_each_requeue(|v| {
                if *v == 2 {
                    panic!("boom");
                }
                false
            });
        }));
        assert!(result.is_err());

        let mut consumer = queue.try_consumer().expect("consumer released on unwind");
        assert_eq!(consumer.pop(), Some(2));
        assert_eq!(consumer.pop(), Some(3));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn dropped_elements_are_released() {
        let marker = Arc::new(());
        let queue = Queue::with_capacity(4);
        for _ in 0..4 {
            queue.push(marker.clone()).unwrap();
        }

        let mut n = 0;
        queue.consumer().for_each_requeue(|_| {
            n += 1;
            n % 2 == 0
        });
        assert_eq!(Arc::strong_count(&marker), 3);
    }

    #[test]
    fn consumer_resize_keeps_order() {
        let queue = Queue::with_capacity(2);
        queue.push_n(&[1, 2]);
        let mut consumer = queue.consumer();

        assert!(consumer.set_capacity(1).is_err());
        consumer.set_capacity(4).unwrap();
        assert_eq!(queue.push_n(&[3, 4, 5]), 2);

        let mut out = [0; 4];
        assert_eq!(consumer.pop_n(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn converts_from_ring_buffer() {
        let ring = RingBuffer::with_capacity(2);
        ring.producer().push(9).unwrap();
        let queue: Queue<i32> = ring.into();
        assert_eq!(queue.capacity(), 2);
        assert_eq!(queue.consumer().pop(), Some(9));
    }

    #[test]
    fn many_producers_one_consumer() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 2_000;
        let queue = Queue::with_capacity(8);

        std::thread::scope(|s| {
            for p in 0..PRODUCERS {
                let queue = &queue;
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        while queue.push((p, i)).is_err() {
                            std::thread::yield_now();
                        }
                    }
                });
            }

            let mut consumer = queue.consumer();
            let mut next = [0usize; PRODUCERS];
            let mut received = 0;
            while received < PRODUCERS * PER_PRODUCER {
                match consumer.pop() {
                    Some((p, i)) => {
                        assert_eq!(i, next[p], "producer {p} out of order");
                        next[p] += 1;
                        received += 1;
                    }
                    None => std::thread::yield_now(),
                }
            }
        });
    }

    proptest! {
        #[test]
        fn requeue_partitions_in_order(
            values in proptest::collection::vec(any::<u8>(), 0..16),
            keep in proptest::collection::vec(any::<bool>(), 16),
            skip in 0usize..16,
        ) {
            let queue = Queue::with_capacity(16);
            {
                let mut consumer = queue.consumer();
                for _ in 0..skip {
                    queue.push(0).unwrap();
                    consumer.pop();
                }
            }
            queue.push_n(&values);

            let mut consumer = queue.consumer();
            let mut i = 0;
            let ran = consumer.for_each_requeue(|_| {
                let k = keep[i];
                i += 1;
                k
            });
            prop_assert_eq!(ran, !values.is_empty());
            prop_assert_eq!(i, values.len());

            let expected: Vec<u8> = values
                .iter()
                .zip(&keep)
                .filter(|(_, k)| **k)
                .map(|(v, _)| *v)
                .collect();
            prop_assert_eq!(consumer.available(), expected.len());

            let mut drained = Vec::new();
            consumer.for_each(|v| drained.push(v));
            prop_assert_eq!(drained, expected);
        }
    }
}
