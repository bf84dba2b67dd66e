//! Deferred-execution primitives for no-std embedded targets.
//!
//! # Highlights
//! - Lock-free SPSC ring buffer with bulk push/pop and in-place resizing.
//! - Multi-producer wrapper that serializes producers behind a pluggable lock
//!   and can requeue elements without moving them out of the buffer.
//! - Cooperative scheduler that runs callbacks, once or on an interval, from
//!   one designated context, safe against re-entrant dispatch.
//! - No allocation on the push/pop path.
//!
//! # Quick start
//! ```
//! use ph_schedule::{Context, RingBuffer, RunPolicy, Scheduler};
//! use core::sync::atomic::{AtomicU64, Ordering};
//! use core::time::Duration;
//!
//! let ring = RingBuffer::<u32>::with_capacity(4);
//! let producer = ring.producer();
//! let mut consumer = ring.consumer();
//! producer.push(42).unwrap();
//! assert_eq!(consumer.pop(), Some(42));
//!
//! static NOW_US: AtomicU64 = AtomicU64::new(0);
//! let scheduler: Scheduler<_> = Scheduler::new(|| NOW_US.load(Ordering::Relaxed));
//!
//! scheduler
//!     .schedule_repeating(|| true, Duration::from_millis(10), RunPolicy::MainLoopOnly)
//!     .unwrap();
//! scheduler.schedule_once(|| {}, RunPolicy::Anywhere).unwrap();
//!
//! // Main loop body:
//! scheduler.run_due(Context::MainLoop);
//! assert_eq!(scheduler.pending(), 1);
//! ```
//!
//! # No-std
//! The crate is `#![no_std]` and needs `alloc`. Tests require `std`.
//!
//! # Safety and concurrency
//! [`RingBuffer`] is SPSC: `producer()`/`consumer()` panic if called while
//! another handle of the same kind is alive. [`MpRingBuffer`] accepts pushes
//! from any number of threads or interrupt handlers, but still has a single
//! consumer handle. The [`Scheduler`] uses that consumer handle as its
//! dispatch guard, so at most one `run_due` pass runs at a time.
//!
//! # Semantics
//! - Empty `pop`/`peek` return `None`.
//! - `push` on a full buffer returns [`Full`] carrying the rejected value.
//! - `push_n`/`pop_n` may transfer fewer elements than asked; they return the
//!   count actually moved.
//! - Resizing to fewer slots than queued elements fails with [`ResizeError`]
//!   and changes nothing.
//!
//! # Features
//! - `std`: `StdLock`, `StdClock`, and catching panics from scheduled
//!   callbacks.
//! - `critical-section`: `CriticalSectionLock`, which masks interrupts while
//!   producers push.
//! - `portable-atomic`: use `portable-atomic` for targets without native
//!   atomic CAS.
#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub(crate) mod loom;

pub mod error;
pub mod lock;
pub mod mp_ring;
pub mod ring;
pub mod schedule;
pub mod timeout;

pub use error::{Full, ResizeError, ScheduleError};
pub use lock::DefaultLock;
pub use mp_ring::{MpConsumer, MpRingBuffer};
pub use ring::{Consumer, Producer, RingBuffer};
pub use schedule::{Context, RunPolicy, SCHEDULED_FN_MAX_COUNT, ScheduledTask, Scheduler};
#[cfg(feature = "std")]
pub use timeout::StdClock;
pub use timeout::{Clock, PollTimeout};
