//! Time types used throughout the stack: microsecond-resolution [`Duration`]/[`Instant`], plus the
//! IV index dwell-timer constants (§3, §4.3).
//!
//! Both types are backed by a 64-bit microsecond counter (roughly 584,942 years before
//! wrapping), not the 32-bit one a link-layer-only timer could get away with: the IV update
//! dwell timers run 96-144 hours (§3), which a 32-bit microsecond counter cannot even represent,
//! let alone measure elapsed time against without aliasing every ~71.58 minutes. A platform
//! [`Timer`] is expected to extend its hardware tick counter's width in software rather than
//! handing back a raw 32-bit peripheral register value.

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A duration with microsecond resolution, stored in 64 bits.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(u64);

impl Duration {
    /// Creates a [`Duration`] from a number of microseconds.
    pub fn from_micros(micros: u64) -> Self {
        Duration(micros)
    }

    /// Creates a [`Duration`] representing the given number of milliseconds.
    pub fn from_millis(millis: u32) -> Self {
        Duration(u64::from(millis) * 1_000)
    }

    /// Creates a [`Duration`] representing a number of seconds.
    pub fn from_secs(secs: u32) -> Self {
        Duration(u64::from(secs) * 1_000_000)
    }

    /// Creates a [`Duration`] representing a number of hours. Used for the IV update dwell
    /// timers, which are specified in hours (§3: minimum 96h, maximum 144h per state).
    pub fn from_hours(hours: u32) -> Self {
        Duration(u64::from(hours) * 3_600_000_000)
    }

    /// Returns the number of whole seconds that fit in `self`.
    pub fn whole_secs(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Returns the number of whole milliseconds that fit in `self`.
    pub fn whole_millis(&self) -> u64 {
        self.0 / 1_000
    }

    /// Returns the number of microseconds represented by `self`.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Returns the fractional part of microseconds in `self`.
    pub fn subsec_micros(&self) -> u64 {
        self.0 % 1_000_000
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000 {
            let (secs, subsec_micros) = (self.whole_secs(), self.subsec_micros());
            if subsec_micros == 0 {
                write!(f, "{}s", secs)
            } else {
                write!(f, "{}.{:06}s", secs, subsec_micros)
            }
        } else if self.0 >= 1000 {
            let (millis, submilli_micros) = (self.whole_millis(), self.0 % 1000);
            if submilli_micros == 0 {
                write!(f, "{}ms", millis)
            } else {
                write!(f, "{}.{:03}ms", millis, submilli_micros)
            }
        } else {
            write!(f, "{}\u{b5}s", self.0)
        }
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// A point in time, relative to an unspecified epoch.
///
/// Has microsecond resolution and may wrap around, though at 64 bits the wrap period is long
/// enough that every timer in this stack, including the multi-day IV update dwell window, can
/// measure elapsed time against it without aliasing. `Instant`s are obtained from an
/// implementation of [`Timer`]; mixing `Instant`s created from different `Timer` instances
/// causes unspecified results. [`Duration`]s are independent of the `Timer` implementation and
/// can be mixed freely.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Instant(u64);

impl Instant {
    /// Creates an `Instant` from raw microseconds since an arbitrary implementation-defined
    /// reference point. Should only be called from a [`Timer`] implementation.
    pub fn from_raw_micros(micros: u64) -> Self {
        Instant(micros)
    }

    /// Returns the raw value from which this `Instant` was created. Should only be called from a
    /// [`Timer`] implementation.
    pub fn raw_micros(&self) -> u64 {
        self.0
    }

    /// Calculates the duration of time that has passed between `earlier` and `self`, saturating
    /// at zero if `earlier` is actually later (can happen across a wraparound).
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.wrapping_sub(earlier.0))
    }

    /// Whether at least `d` has elapsed since `earlier`, as observed at `self`.
    pub fn has_elapsed_since(&self, earlier: Instant, d: Duration) -> bool {
        self.duration_since(earlier) >= d
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.duration_since(rhs)
    }
}

impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0.wrapping_add(d.as_micros()))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

impl Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, d: Duration) -> Self {
        Instant(self.0.wrapping_sub(d.as_micros()))
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, d: Duration) {
        *self = *self - d;
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000 {
            let (secs, subsec_micros) = (self.0 / 1_000_000, self.0 % 1_000_000);
            if subsec_micros == 0 {
                write!(f, "{}s", secs)
            } else {
                write!(f, "{}.{:06}s", secs, subsec_micros)
            }
        } else if self.0 >= 1000 {
            let (millis, submilli_micros) = (self.0 / 1000, self.0 % 1000);
            if submilli_micros == 0 {
                write!(f, "{}ms", millis)
            } else {
                write!(f, "{}.{:03}ms", millis, submilli_micros)
            }
        } else {
            write!(f, "{}\u{b5}s", self.0)
        }
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// Trait for time providers.
///
/// The platform integration must supply an implementation with microsecond accuracy. Can also be
/// implemented by a mock timer for testing.
pub trait Timer {
    /// Obtains the current time as an [`Instant`].
    ///
    /// The [`Instant`]s returned by this function must never move backwards in time, except when
    /// the underlying value wraps around.
    fn now(&self) -> Instant;
}

/// IV index dwell timer bounds (§3, Open Questions: the source conflates minimum and maximum
/// dwell; these follow the Bluetooth Mesh Profile's 96h/144h rule rather than the 48-week figure).
pub mod iv_dwell {
    use super::Duration;

    /// Minimum time a node must remain in a given IV update state before transitioning again.
    pub fn min_dwell() -> Duration {
        Duration::from_hours(96)
    }

    /// Maximum time a node may remain in the `in-progress` state before it must revert to
    /// `normal` even without fresh sequence space.
    pub fn max_dwell() -> Duration {
        Duration::from_hours(144)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_since_wraps() {
        let a = Instant::from_raw_micros(10);
        let b = Instant::from_raw_micros(u64::MAX - 5);
        assert_eq!(b.duration_since(a), Duration::from_micros(u64::MAX - 15));
    }

    #[test]
    fn dwell_bounds() {
        assert!(iv_dwell::min_dwell() < iv_dwell::max_dwell());
        assert_eq!(iv_dwell::min_dwell().whole_secs(), 96 * 3600);
        assert_eq!(iv_dwell::max_dwell().whole_secs(), 144 * 3600);
    }

    #[test]
    fn instant_tracks_elapsed_time_across_the_full_iv_dwell_window() {
        // A 32-bit microsecond counter wraps every ~71.58 minutes and could never observe this
        // elapsed interval correctly; 64 bits must.
        let t0 = Instant::from_raw_micros(0);
        let after_min_dwell = t0 + iv_dwell::min_dwell();
        assert!(after_min_dwell.has_elapsed_since(t0, iv_dwell::min_dwell()));
        assert!(!after_min_dwell.has_elapsed_since(t0, iv_dwell::max_dwell()));
    }
}
