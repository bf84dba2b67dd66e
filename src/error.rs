//! Error types.
//!
//! Every failure in this crate is local and synchronous: a rejected push hands
//! the value back, a rejected resize leaves the queue untouched, and a rejected
//! schedule request means the callback will never run.

use core::fmt;

/// Returned by `push` when the ring buffer has no free slot.
///
/// The rejected value is handed back to the caller.
#[derive(Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ring buffer is full")]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    /// Recover the value that could not be pushed.
    #[inline]
    pub fn into_inner(self) -> T {
        self.0
    }
}

// Not derived, so `Full<T>` is an error for any `T`.
impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Full").finish_non_exhaustive()
    }
}

/// Returned by `set_capacity` when more elements are queued than the requested
/// capacity could hold. The queue is left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot resize ring buffer to capacity {requested}: {queued} elements are queued")]
pub struct ResizeError {
    pub requested: usize,
    pub queued: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ScheduleError {
    /// The task queue already holds `capacity` tasks.
    #[error("scheduler queue is full ({capacity} tasks pending)")]
    QueueFull { capacity: usize },
}
