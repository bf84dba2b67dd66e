//! Resizable lock-free SPSC ring buffer.
//!
//! # Overview
//! - Single producer, single consumer, enforced by handing out at most one
//!   [`Producer`] and one [`Consumer`] at a time.
//! - Bounded: a full buffer rejects pushes and hands the value back.
//! - Storage holds `capacity + 1` slots. The spare slot keeps "empty"
//!   (`head == tail`) and "full" (`head + 1 == tail`) apart without a counter.
//! - A zero-capacity buffer (the [`Default`]) is valid: it holds nothing and
//!   rejects every push until it is resized.
//!
//! # Memory ordering
//! The producer writes the slot and then publishes `head` with `Release`; the
//! consumer loads `head` with `Acquire` before reading a slot. The consumer
//! moves the value out and then publishes `tail` with `Release`; the producer
//! loads `tail` with `Acquire` before reusing a slot.
//!
//! # Resizing
//! [`RingBuffer::set_capacity`] takes `&mut self`, so no handle can be alive
//! while the storage is replaced. Queued elements are preserved in order.

use alloc::boxed::Box;
use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, MaybeUninit};

use crate::error::{Full, ResizeError};
use crate::loom::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::loom::cell::UnsafeCell;

type Slot<T> = UnsafeCell<MaybeUninit<T>>;

fn slot_array<T>(len: usize) -> Box<[Slot<T>]> {
    (0..len)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect()
}

/// Slots needed for `capacity` elements plus the spare one.
#[track_caller]
fn slot_count(capacity: usize) -> usize {
    match capacity.checked_add(1) {
        Some(size) => size,
        None => panic!("ring buffer capacity overflow"),
    }
}

#[inline]
fn claim(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
}

/// Bounded FIFO for one producer and one consumer.
pub struct RingBuffer<T> {
    /// Next slot to write. Owned by the producer.
    pub(crate) head: AtomicUsize,
    /// Next slot to read. Owned by the consumer.
    pub(crate) tail: AtomicUsize,
    /// Number of slots, `capacity + 1`.
    size: AtomicUsize,
    storage: UnsafeCell<Box<[Slot<T>]>>,
    producer_active: AtomicBool,
    consumer_active: AtomicBool,
}

unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Create a zero-capacity buffer. Call [`set_capacity`](Self::set_capacity)
    /// once the real capacity is known.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a buffer that holds at most `capacity` elements.
    ///
    /// # Panics
    /// If `capacity` is `usize::MAX`.
    pub fn with_capacity(capacity: usize) -> Self {
        let size = slot_count(capacity);
        Self {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            size: AtomicUsize::new(size),
            storage: UnsafeCell::new(slot_array(size)),
            producer_active: AtomicBool::new(false),
            consumer_active: AtomicBool::new(false),
        }
    }

    /// Maximum number of elements the buffer can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size() - 1
    }

    /// Snapshot of the number of queued elements.
    #[inline]
    pub fn available(&self) -> usize {
        let size = self.size();
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail).wrapping_add(size) % size
    }

    /// Snapshot of the number of free slots.
    #[inline]
    pub fn available_for_push(&self) -> usize {
        self.capacity().saturating_sub(self.available())
    }

    /// Resize the buffer, keeping the queued elements in order.
    ///
    /// Fails without touching anything if more than `capacity` elements are
    /// queued.
    ///
    /// # Panics
    /// If `capacity` is `usize::MAX`.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), ResizeError> {
        // SAFETY: `&mut self` rules out any live handle.
        unsafe { self.resize_unchecked(capacity) }
    }

    /// Create the producer handle.
    ///
    /// # Panics
    /// If a producer handle is already alive.
    #[track_caller]
    pub fn producer(&self) -> Producer<'_, T> {
        match self.try_producer() {
            Some(producer) => producer,
            None => panic!("RingBuffer::producer called while a producer is active"),
        }
    }

    /// Create the producer handle, or `None` if one is already alive.
    pub fn try_producer(&self) -> Option<Producer<'_, T>> {
        claim(&self.producer_active).then(|| Producer {
            ring: self,
            _not_sync: PhantomData,
        })
    }

    /// Create the consumer handle.
    ///
    /// # Panics
    /// If a consumer handle is already alive.
    #[track_caller]
    pub fn consumer(&self) -> Consumer<'_, T> {
        match self.try_consumer() {
            Some(consumer) => consumer,
            None => panic!("RingBuffer::consumer called while a consumer is active"),
        }
    }

    /// Create the consumer handle, or `None` if one is already alive.
    pub fn try_consumer(&self) -> Option<Consumer<'_, T>> {
        claim(&self.consumer_active).then(|| Consumer { ring: self })
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// # Safety
    /// The storage must not be replaced while the returned reference is used.
    #[inline]
    unsafe fn slot(&self, idx: usize) -> &Slot<T> {
        self.storage.with(|slots| unsafe { &(&*slots)[idx] })
    }

    /// # Safety
    /// Slot `idx` is vacant and owned by the caller.
    #[inline]
    pub(crate) unsafe fn write_slot(&self, idx: usize, value: T) {
        unsafe {
            self.slot(idx).with_mut(|p| {
                (*p).write(value);
            })
        }
    }

    /// Move the value out of slot `idx`, leaving it vacant.
    ///
    /// # Safety
    /// Slot `idx` is occupied and owned by the caller.
    #[inline]
    pub(crate) unsafe fn read_slot(&self, idx: usize) -> T {
        unsafe { self.slot(idx).with(|p| (*p).assume_init_read()) }
    }

    /// # Safety
    /// Slot `idx` is occupied and nothing else references it for `'_`.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn value_mut(&self, idx: usize) -> &mut T {
        unsafe { self.slot(idx).with_mut(|p| (*p).assume_init_mut()) }
    }

    /// # Safety
    /// The caller is the only producer.
    pub(crate) unsafe fn push_unchecked(&self, value: T) -> Result<(), Full<T>> {
        let size = self.size();
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % size;
        if next == self.tail.load(Ordering::Acquire) {
            return Err(Full(value));
        }

        unsafe { self.write_slot(head, value) };

        self.head.store(next, Ordering::Release);
        Ok(())
    }

    /// Copy as many elements of `src` as fit, in order. Returns the count
    /// copied.
    ///
    /// # Safety
    /// The caller is the only producer.
    pub(crate) unsafe fn push_n_unchecked(&self, src: &[T]) -> usize
    where
        T: Clone,
    {
        let size = self.size();
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let free = tail.wrapping_sub(head).wrapping_add(size - 1) % size;
        let n = src.len().min(free);
        if n == 0 {
            return 0;
        }

        // First run up to the end of storage, second run from slot 0.
        let first = n.min(size - head);
        for (i, value) in src[..first].iter().enumerate() {
            unsafe { self.write_slot(head + i, value.clone()) };
        }
        for (i, value) in src[first..n].iter().enumerate() {
            unsafe { self.write_slot(i, value.clone()) };
        }

        self.head.store((head + n) % size, Ordering::Release);
        n
    }

    /// # Safety
    /// The caller is the only consumer.
    pub(crate) unsafe fn pop_unchecked(&self) -> Option<T> {
        let size = self.size();
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }

        let value = unsafe { self.read_slot(tail) };

        self.tail.store((tail + 1) % size, Ordering::Release);
        Some(value)
    }

    /// # Safety
    /// The caller is the only consumer.
    pub(crate) unsafe fn pop_n_unchecked(&self, dst: &mut [T]) -> usize {
        let size = self.size();
        let mut tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let avail = head.wrapping_sub(tail).wrapping_add(size) % size;
        let n = dst.len().min(avail);
        if n == 0 {
            return 0;
        }

        // Release each slot before the old `dst` element is dropped.
        for out in &mut dst[..n] {
            let value = unsafe { self.read_slot(tail) };
            tail = (tail + 1) % size;
            self.tail.store(tail, Ordering::Release);
            *out = value;
        }
        n
    }

    /// # Safety
    /// The caller is the only consumer, and must not pop while the reference
    /// is alive.
    pub(crate) unsafe fn peek_unchecked(&self) -> Option<&T> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        Some(unsafe { self.slot(tail).with(|p| (*p).assume_init_ref()) })
    }

    /// Drain everything up to the `head` observed on entry.
    ///
    /// # Safety
    /// The caller is the only consumer.
    pub(crate) unsafe fn for_each_unchecked(&self, mut visit: impl FnMut(T)) {
        let size = self.size();
        let head = self.head.load(Ordering::Acquire);
        let mut tail = self.tail.load(Ordering::Relaxed);
        while tail != head {
            let value = unsafe { self.read_slot(tail) };
            tail = (tail + 1) % size;
            self.tail.store(tail, Ordering::Release);
            visit(value);
        }
    }

    /// # Safety
    /// No producer or consumer may touch the buffer during the call.
    pub(crate) unsafe fn resize_unchecked(&self, capacity: usize) -> Result<(), ResizeError> {
        let size = self.size();
        let new_size = slot_count(capacity);
        if new_size == size {
            return Ok(());
        }

        let queued = self.available();
        if queued > capacity {
            return Err(ResizeError {
                requested: capacity,
                queued,
            });
        }

        let fresh = slot_array::<T>(new_size);
        let tail = self.tail.load(Ordering::Relaxed);
        for (i, dst) in fresh[..queued].iter().enumerate() {
            let value = unsafe { self.read_slot((tail + i) % size) };
            dst.with_mut(|p| unsafe {
                (*p).write(value);
            });
        }

        // Old slots are `MaybeUninit`, so dropping the storage drops no `T`.
        self.storage.with_mut(|slots| unsafe { *slots = fresh });
        self.size.store(new_size, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        self.head.store(queued, Ordering::Release);

        log::debug!("ring buffer resized: capacity {} -> {capacity}, {queued} queued", size - 1);
        Ok(())
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        if mem::needs_drop::<T>() {
            // SAFETY: `&mut self` rules out any live handle.
            unsafe { self.for_each_unchecked(drop) };
        }
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

/// Write side of a [`RingBuffer`].
///
/// `Send` but not `Sync`: it can move to another thread, but only one thread
/// pushes at a time.
pub struct Producer<'a, T> {
    ring: &'a RingBuffer<T>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> Producer<'_, T> {
    /// Push one value. Wait-free; safe to call from an interrupt handler.
    #[inline]
    pub fn push(&self, value: T) -> Result<(), Full<T>> {
        // SAFETY: this is the only producer handle.
        unsafe { self.ring.push_unchecked(value) }
    }

    /// Push clones of as many elements of `src` as fit, in order.
    /// Returns how many were pushed, which may be less than `src.len()`.
    #[inline]
    pub fn push_n(&self, src: &[T]) -> usize
    where
        T: Clone,
    {
        // SAFETY: this is the only producer handle.
        unsafe { self.ring.push_n_unchecked(src) }
    }

    #[inline]
    pub fn available_for_push(&self) -> usize {
        self.ring.available_for_push()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T> Drop for Producer<'_, T> {
    fn drop(&mut self) {
        self.ring.producer_active.store(false, Ordering::Release);
    }
}

impl<T> fmt::Debug for Producer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer").field("ring", self.ring).finish()
    }
}

/// Read side of a [`RingBuffer`].
pub struct Consumer<'a, T> {
    pub(crate) ring: &'a RingBuffer<T>,
}

impl<T> Consumer<'_, T> {
    /// Remove the oldest element, or `None` if the buffer is empty.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: this is the only consumer handle.
        unsafe { self.ring.pop_unchecked() }
    }

    /// Move up to `dst.len()` elements into `dst`, oldest first.
    /// Returns the number moved.
    #[inline]
    pub fn pop_n(&mut self, dst: &mut [T]) -> usize {
        // SAFETY: this is the only consumer handle.
        unsafe { self.ring.pop_n_unchecked(dst) }
    }

    /// The element the next [`pop`](Self::pop) would return.
    #[inline]
    pub fn peek(&self) -> Option<&T> {
        // SAFETY: popping needs `&mut self`, so the slot stays put while
        // the reference lives.
        unsafe { self.ring.peek_unchecked() }
    }

    /// Drop every queued element.
    pub fn flush(&mut self) {
        // SAFETY: this is the only consumer handle.
        unsafe { self.ring.for_each_unchecked(drop) }
    }

    /// Drain the elements queued at the time of the call, oldest first.
    ///
    /// Each element is removed before `visit` sees it, so if `visit` panics the
    /// visited elements are gone and the rest are still queued. Elements pushed
    /// during the traversal are left for the next call.
    pub fn for_each(&mut self, visit: impl FnMut(T)) {
        // SAFETY: this is the only consumer handle.
        unsafe { self.ring.for_each_unchecked(visit) }
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.ring.available()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T> Drop for Consumer<'_, T> {
    fn drop(&mut self) {
        self.ring.consumer_active.store(false, Ordering::Release);
    }
}

impl<T> fmt::Debug for Consumer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("ring", self.ring).finish()
    }
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::RingBuffer;
    use crate::loom::{self, sync::Arc, thread};

    #[test]
    fn spsc_push_pop() {
        loom::model(|| {
            let ring = Arc::new(RingBuffer::with_capacity(2));

            let producer_thread = thread::spawn({
                let ring = ring.clone();
                move || {
                    let producer = ring.producer();
                    for i in 0..3 {
                        let mut value = i;
                        while let Err(full) = producer.push(value) {
                            value = full.into_inner();
                            thread::yield_now();
                        }
                    }
                }
            });

            let mut consumer = ring.consumer();
            let mut expected = 0;
            while expected < 3 {
                match consumer.pop() {
                    Some(v) => {
                        assert_eq!(v, expected);
                        expected += 1;
                    }
                    None => thread::yield_now(),
                }
            }
            drop(consumer);

            producer_thread.join().unwrap();
        })
    }
}
