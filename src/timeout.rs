//! Polled timeouts.
//!
//! A [`PollTimeout`] is checked by asking "has the period elapsed yet?"
//! rather than by waiting on it. Time is a monotonic microsecond count read
//! from a [`Clock`]; all comparisons use wrapping arithmetic, so a clock that
//! wraps around is handled as long as periods are shorter than the wrap.

/// Monotonic microsecond time source.
pub trait Clock {
    fn now_micros(&self) -> u64;
}

impl<F: Fn() -> u64> Clock for F {
    #[inline]
    fn now_micros(&self) -> u64 {
        self()
    }
}

/// [`Clock`] measuring from its own creation with [`std::time::Instant`].
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn now_micros(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// A period measured from a reference point.
///
/// A period of `0` means "always expired"; [`PollTimeout::NEVER`] never
/// expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTimeout {
    start: u64,
    period: u64,
}

impl PollTimeout {
    /// Period of a timeout that never expires.
    pub const NEVER: u64 = u64::MAX;

    /// A timeout that is expired from the start and stays expired.
    #[inline]
    pub const fn always_expired() -> Self {
        Self {
            start: 0,
            period: 0,
        }
    }

    /// A timeout that never expires.
    #[inline]
    pub const fn never_expires() -> Self {
        Self {
            start: 0,
            period: Self::NEVER,
        }
    }

    /// Arm a period of `period_us` starting at `now`.
    #[inline]
    pub const fn new(now: u64, period_us: u64) -> Self {
        Self {
            start: now,
            period: period_us,
        }
    }

    /// Re-arm with a new period starting at `now`.
    #[inline]
    pub fn reset(&mut self, now: u64, period_us: u64) {
        self.start = now;
        self.period = period_us;
    }

    #[inline]
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Whether the period has elapsed at `now`.
    #[inline]
    pub fn expired(&self, now: u64) -> bool {
        match self.period {
            0 => true,
            Self::NEVER => false,
            period => now.wrapping_sub(self.start) >= period,
        }
    }

    /// Like [`expired`](Self::expired), but an expired check moves the
    /// reference point forward by whole periods so the next check measures
    /// the next interval. Periods missed entirely are skipped, not replayed.
    pub fn expired_retrigger(&mut self, now: u64) -> bool {
        match self.period {
            0 => true,
            Self::NEVER => false,
            period => {
                let elapsed = now.wrapping_sub(self.start);
                if elapsed < period {
                    return false;
                }
                self.start = self.start.wrapping_add(elapsed / period * period);
                true
            }
        }
    }

    /// Microseconds left until expiry at `now`; `0` once expired.
    pub fn remaining(&self, now: u64) -> u64 {
        match self.period {
            0 => 0,
            Self::NEVER => u64::MAX,
            period => period.saturating_sub(now.wrapping_sub(self.start)),
        }
    }
}

impl Default for PollTimeout {
    fn default() -> Self {
        Self::always_expired()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn always_expired_stays_expired() {
        let mut t = PollTimeout::always_expired();
        assert!(t.expired(0));
        assert!(t.expired_retrigger(0));
        assert!(t.expired_retrigger(0));
        assert_eq!(t.remaining(123), 0);
    }

    #[test]
    fn never_expires() {
        let mut t = PollTimeout::never_expires();
        assert!(!t.expired(u64::MAX));
        assert!(!t.expired_retrigger(u64::MAX));
    }

    #[test]
    fn one_shot_expiry() {
        let mut t = PollTimeout::new(100, 50);
        assert!(!t.expired(149));
        assert_eq!(t.remaining(120), 30);
        assert!(t.expired(150));
        assert!(t.expired(1_000));

        t.reset(1_000, 10);
        assert!(!t.expired(1_005));
        assert!(t.expired(1_010));
    }

    #[test]
    fn retrigger_advances_by_whole_periods() {
        let mut t = PollTimeout::new(0, 10);
        assert!(!t.expired_retrigger(9));
        assert!(t.expired_retrigger(10));
        assert!(!t.expired_retrigger(19));
        // Three and a half periods late: fire once, next boundary is 50.
        assert!(t.expired_retrigger(45));
        assert!(!t.expired_retrigger(49));
        assert!(t.expired_retrigger(50));
    }

    #[test]
    fn handles_clock_wrap() {
        let start = u64::MAX - 5;
        let mut t = PollTimeout::new(start, 10);
        assert!(!t.expired(2));
        assert!(t.expired(4));
        assert!(t.expired_retrigger(4));
        assert!(!t.expired_retrigger(13));
        assert!(t.expired_retrigger(14));
    }

    #[test]
    fn closures_are_clocks() {
        let clock = || 42u64;
        assert_eq!(clock.now_micros(), 42);
    }
}
