//! Locks that serialize the producer side of [`MpRingBuffer`](crate::MpRingBuffer).
//!
//! Queue code only ever sees the [`ScopedRawMutex`] trait from the
//! [`mutex-traits`] crate; which implementation backs it is chosen by the
//! caller or, for [`DefaultLock`], by feature flags:
//!
//! - [`CriticalSectionLock`] (`critical-section` feature) runs the critical
//!   section under [`critical_section::with`]. On single-core targets this
//!   masks interrupts, so an interrupt handler that pushes can never spin on a
//!   lock held by the code it interrupted.
//! - [`StdLock`] (`std` feature) is a [`std::sync::Mutex`].
//! - [`SpinLock`] is always available. It is not interrupt-safe.
//!
//! [`mutex-traits`]: https://docs.rs/mutex-traits

pub use mutex_traits::{ConstInit, ScopedRawMutex};

use core::fmt;

use crate::loom::atomic::{AtomicBool, Ordering};
use crate::loom::hint;

/// Best-effort lock picked from the enabled features.
///
/// - `cfg(loom)`: a `loom` mutex.
/// - `std`: [`StdLock`].
/// - `critical-section`: [`CriticalSectionLock`].
/// - otherwise: [`SpinLock`].
#[must_use = "why create a `DefaultLock` if you're not going to lock it?"]
pub struct DefaultLock(Inner);

impl DefaultLock {
    #[cfg(not(loom))]
    #[inline]
    pub const fn new() -> Self {
        Self(Inner::new())
    }

    #[cfg(loom)]
    #[track_caller]
    pub fn new() -> Self {
        Self(Inner::new())
    }
}

impl Default for DefaultLock {
    #[track_caller]
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DefaultLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

#[cfg(not(loom))]
impl ConstInit for DefaultLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

unsafe impl ScopedRawMutex for DefaultLock {
    #[inline]
    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.0.with_lock(f)
    }

    #[inline]
    fn try_with_lock<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        self.0.try_with_lock(f)
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.0.is_locked()
    }
}

#[cfg(loom)]
use loom_impl::LoomLock as Inner;

#[cfg(all(not(loom), feature = "std"))]
use self::StdLock as Inner;

#[cfg(all(not(loom), not(feature = "std"), feature = "critical-section"))]
use self::CriticalSectionLock as Inner;

#[cfg(all(not(loom), not(feature = "std"), not(feature = "critical-section")))]
use self::SpinLock as Inner;

/// Test-and-set spinlock.
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    #[cfg(not(loom))]
    #[inline]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(not(loom))]
impl ConstInit for SpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

/// Releases the flag on drop, so a panicking closure does not wedge the lock.
struct Unlock<'a>(&'a AtomicBool);

impl Drop for Unlock<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

unsafe impl ScopedRawMutex for SpinLock {
    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        while !self.try_acquire() {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        let _unlock = Unlock(&self.locked);
        f()
    }

    fn try_with_lock<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if !self.try_acquire() {
            return None;
        }
        let _unlock = Unlock(&self.locked);
        Some(f())
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Lock backed by [`critical_section::with`].
///
/// Nesting is allowed: `critical-section` implementations are re-entrant.
#[cfg(feature = "critical-section")]
pub struct CriticalSectionLock {
    depth: critical_section::Mutex<core::cell::Cell<usize>>,
}

#[cfg(feature = "critical-section")]
impl CriticalSectionLock {
    #[inline]
    pub const fn new() -> Self {
        Self {
            depth: critical_section::Mutex::new(core::cell::Cell::new(0)),
        }
    }
}

#[cfg(feature = "critical-section")]
impl Default for CriticalSectionLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "critical-section")]
impl fmt::Debug for CriticalSectionLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalSectionLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(feature = "critical-section")]
impl ConstInit for CriticalSectionLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

#[cfg(feature = "critical-section")]
unsafe impl ScopedRawMutex for CriticalSectionLock {
    #[inline]
    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Leave<'a>(&'a core::cell::Cell<usize>);

        impl Drop for Leave<'_> {
            fn drop(&mut self) {
                self.0.set(self.0.get() - 1);
            }
        }

        critical_section::with(|cs| {
            let depth = self.depth.borrow(cs);
            depth.set(depth.get() + 1);
            let _leave = Leave(depth);
            f()
        })
    }

    #[inline]
    fn try_with_lock<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        Some(self.with_lock(f))
    }

    #[inline]
    fn is_locked(&self) -> bool {
        critical_section::with(|cs| self.depth.borrow(cs).get() != 0)
    }
}

/// Lock backed by [`std::sync::Mutex`]. Poisoning is ignored: the guarded
/// state is the ring buffer's indices, which stay consistent across a panic.
#[cfg(feature = "std")]
pub struct StdLock(std::sync::Mutex<()>);

#[cfg(feature = "std")]
impl StdLock {
    #[inline]
    pub const fn new() -> Self {
        Self(std::sync::Mutex::new(()))
    }
}

#[cfg(feature = "std")]
impl Default for StdLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl fmt::Debug for StdLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(feature = "std")]
impl ConstInit for StdLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

#[cfg(feature = "std")]
unsafe impl ScopedRawMutex for StdLock {
    #[inline]
    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f()
    }

    #[inline]
    fn try_with_lock<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _guard = match self.0.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(std::sync::TryLockError::WouldBlock) => return None,
        };
        Some(f())
    }

    fn is_locked(&self) -> bool {
        matches!(
            self.0.try_lock(),
            Err(std::sync::TryLockError::WouldBlock)
        )
    }
}

#[cfg(loom)]
mod loom_impl {
    use super::ScopedRawMutex;

    pub(super) struct LoomLock(loom::sync::Mutex<()>);

    impl core::fmt::Debug for LoomLock {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.debug_struct("LoomLock")
                .field("locked", &self.is_locked())
                .finish()
        }
    }

    impl LoomLock {
        #[track_caller]
        pub(super) fn new() -> Self {
            Self(loom::sync::Mutex::new(()))
        }
    }

    unsafe impl ScopedRawMutex for LoomLock {
        #[inline]
        fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
            let _guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
            f()
        }

        #[inline]
        fn try_with_lock<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
            let _guard = self.0.try_lock().ok()?;
            Some(f())
        }

        fn is_locked(&self) -> bool {
            self.0.try_lock().is_err()
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn lock_trait_impls() {
        fn assert_lock<T: ScopedRawMutex + Send + Sync + Default + fmt::Debug>() {}
        fn assert_const_init<T: ConstInit>() {}

        assert_lock::<DefaultLock>();
        assert_lock::<SpinLock>();
        assert_const_init::<DefaultLock>();

        static _GLOBAL: DefaultLock = DefaultLock::new();
    }

    #[test]
    fn spin_lock_reports_state() {
        let lock = SpinLock::new();
        assert!(!lock.is_locked());
        lock.with_lock(|| {
            assert!(lock.is_locked());
            assert_eq!(lock.try_with_lock(|| ()), None);
        });
        assert!(!lock.is_locked());
        assert_eq!(lock.try_with_lock(|| 5), Some(5));
    }

    #[test]
    fn spin_lock_released_on_panic() {
        let lock = SpinLock::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lock.with_lock(|| panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(!lock.is_locked());
    }

    #[test]
    fn spin_lock_excludes_threads() {
        let lock = SpinLock::new();
        let counter = core::cell::Cell::new(0u32);
        struct Shared<'a>(&'a core::cell::Cell<u32>);
        // SAFETY: only touched while `lock` is held.
        unsafe impl Sync for Shared<'_> {}
        impl Shared<'_> {
            fn bump(&self) {
                self.0.set(self.0.get() + 1);
            }
        }
        let shared = Shared(&counter);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        lock.with_lock(|| shared.bump());
                    }
                });
            }
        });
        assert_eq!(counter.get(), 4000);
    }

    #[cfg(feature = "critical-section")]
    #[test]
    fn critical_section_lock_nests() {
        let lock = CriticalSectionLock::new();
        assert!(!lock.is_locked());
        let inner = lock.with_lock(|| lock.with_lock(|| lock.is_locked()));
        assert!(inner);
        assert!(!lock.is_locked());
    }

    #[cfg(feature = "std")]
    #[test]
    fn std_lock_reports_state() {
        let lock = StdLock::new();
        assert!(!lock.is_locked());
        lock.with_lock(|| assert!(lock.is_locked()));
        assert!(!lock.is_locked());
    }
}
