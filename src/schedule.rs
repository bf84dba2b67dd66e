//! Cooperative scheduler for deferred calls.
//!
//! Any context (another thread, an interrupt handler, or a running task) can
//! hand a callback to a [`Scheduler`]; the callback then runs the next time
//! the owner of the scheduler calls [`Scheduler::run_due`], typically from
//! its main loop and optionally from yield points nested inside it.
//!
//! # Task lifecycle
//! A task's callback returns `true` to stay scheduled and `false` to be
//! removed. Tasks with a repeat interval only run once their interval has
//! elapsed; tasks without one run on every pass. A task restricted to
//! [`RunPolicy::MainLoopOnly`] is skipped when `run_due` is called from a
//! yield point.
//!
//! # Re-entrancy
//! Only one dispatch pass runs at a time. A `run_due` call made while a pass
//! is in progress (for example from inside a task that yields) returns
//! immediately without running anything.
//!
//! # Backpressure
//! The task queue holds at most `N` tasks ([`SCHEDULED_FN_MAX_COUNT`] by
//! default) and never grows. A full queue rejects new tasks with
//! [`ScheduleError::QueueFull`]; the rejected callback never runs.

use alloc::boxed::Box;
use core::fmt;
use core::time::Duration;

use crate::error::ScheduleError;
use crate::lock::{DefaultLock, ScopedRawMutex};
use crate::mp_ring::MpRingBuffer;
use crate::timeout::{Clock, PollTimeout};

/// Default maximum number of queued tasks.
pub const SCHEDULED_FN_MAX_COUNT: usize = 32;

/// Where a task is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPolicy {
    /// From the main loop or from any yield point.
    #[default]
    Anywhere,
    /// Only from the main loop.
    MainLoopOnly,
}

/// Where [`Scheduler::run_due`] is being called from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    MainLoop,
    Yield,
}

/// A queued callback together with its timer and run policy.
pub struct ScheduledTask {
    callback: Box<dyn FnMut() -> bool + Send>,
    due: PollTimeout,
    policy: RunPolicy,
}

impl ScheduledTask {
    #[inline]
    pub fn policy(&self) -> RunPolicy {
        self.policy
    }

    /// Repeat interval in microseconds; `0` for tasks that run every pass.
    #[inline]
    pub fn interval_us(&self) -> u64 {
        self.due.period()
    }

    fn should_skip(&mut self, ctx: Context, now: u64) -> bool {
        (self.policy == RunPolicy::MainLoopOnly && ctx != Context::MainLoop)
            || !self.due.expired_retrigger(now)
    }

    /// Run the callback. A panicking callback is removed.
    #[cfg(feature = "std")]
    fn invoke(&mut self) -> bool {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (self.callback)())) {
            Ok(keep) => keep,
            Err(_) => {
                log::warn!("scheduled callback panicked; removing it");
                false
            }
        }
    }

    #[cfg(not(feature = "std"))]
    fn invoke(&mut self) -> bool {
        (self.callback)()
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("due", &self.due)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Runs deferred callbacks from a single designated context.
///
/// `C` supplies the time used for repeat intervals, `L` serializes producers
/// (see [`lock`](crate::lock)), and `N` bounds the number of queued tasks.
///
/// A scheduler is meant to live for the whole program, shared by reference
/// (an `Arc`, a leaked `&'static`, or a reference handed down from `main`).
/// Construction allocates the task queue, so a `static` needs a lazy
/// initializer.
pub struct Scheduler<C, L = DefaultLock, const N: usize = SCHEDULED_FN_MAX_COUNT> {
    queue: MpRingBuffer<ScheduledTask, L>,
    clock: C,
}

impl<C: Clock, L: ScopedRawMutex + Default, const N: usize> Scheduler<C, L, N> {
    pub fn new(clock: C) -> Self {
        Self::with_lock(clock, L::default())
    }
}

impl<C: Clock, L: ScopedRawMutex, const N: usize> Scheduler<C, L, N> {
    pub fn with_lock(clock: C, lock: L) -> Self {
        Self {
            queue: MpRingBuffer::with_lock(N, lock),
            clock,
        }
    }

    /// Queue `callback` to run on every pass once `repeat` has elapsed since
    /// it last ran (or since now, for the first run). A zero `repeat` makes it
    /// run on every pass. The callback keeps running for as long as it
    /// returns `true`.
    pub fn schedule_repeating(
        &self,
        callback: impl FnMut() -> bool + Send + 'static,
        repeat: Duration,
        policy: RunPolicy,
    ) -> Result<(), ScheduleError> {
        let repeat_us = u64::try_from(repeat.as_micros()).unwrap_or(PollTimeout::NEVER);
        let task = ScheduledTask {
            callback: Box::new(callback),
            due: PollTimeout::new(self.clock.now_micros(), repeat_us),
            policy,
        };

        self.queue.push(task).map_err(|_| {
            log::warn!("schedule rejected: {N} tasks already queued");
            ScheduleError::QueueFull { capacity: N }
        })
    }

    /// Queue `callback` to run once, on the next pass that `policy` allows.
    pub fn schedule_once(
        &self,
        callback: impl FnOnce() + Send + 'static,
        policy: RunPolicy,
    ) -> Result<(), ScheduleError> {
        let mut callback = Some(callback);
        self.schedule_repeating(
            move || {
                if let Some(callback) = callback.take() {
                    callback();
                }
                false
            },
            Duration::ZERO,
            policy,
        )
    }

    /// Run every queued task that is due and allowed in `ctx`.
    ///
    /// Tasks queued while the pass runs wait for the next pass. Calling this
    /// while another pass is in progress does nothing.
    pub fn run_due(&self, ctx: Context) {
        let Some(mut queue) = self.queue.try_consumer() else {
            log::trace!("run_due({ctx:?}) skipped: a pass is already running");
            return;
        };

        queue.for_each_requeue(|task| {
            if task.should_skip(ctx, self.clock.now_micros()) {
                return true;
            }
            task.invoke()
        });
    }

    /// Number of queued tasks.
    #[inline]
    pub fn pending(&self) -> usize {
        self.queue.available()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        N
    }

    #[inline]
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

impl<C, L, const N: usize> fmt::Debug for Scheduler<C, L, N>
where
    L: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
