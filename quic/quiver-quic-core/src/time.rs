// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Timestamps and timers
//!
//! The connection never reads a clock; every entry point is handed the
//! current time by the caller, which keeps the whole state machine
//! deterministic under test.

use core::{fmt, num::NonZeroU64, time::Duration};

/// A monotonic point in time, in microseconds since an arbitrary epoch
///
/// The value is offset by one internally so that the niche optimization
/// applies to `Option<Timestamp>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(NonZeroU64);

impl Timestamp {
    /// Creates a timestamp `duration` after the epoch
    #[inline]
    pub fn from_duration_since_epoch(duration: Duration) -> Self {
        let micros = duration.as_micros() as u64;
        Self(NonZeroU64::new(micros + 1).expect("timestamp overflow"))
    }

    /// Creates a timestamp `millis` milliseconds after the epoch
    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Self::from_duration_since_epoch(Duration::from_millis(millis))
    }

    #[inline]
    fn as_micros(self) -> u64 {
        self.0.get() - 1
    }

    /// Returns the duration elapsed since `earlier`, or zero if `earlier`
    /// is in the future
    #[inline]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.as_micros().saturating_sub(earlier.as_micros()))
    }

    #[inline]
    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        let micros = self.as_micros().checked_add(duration.as_micros() as u64)?;
        Some(Self(NonZeroU64::new(micros + 1)?))
    }

    #[inline]
    pub fn checked_sub(self, duration: Duration) -> Option<Self> {
        let micros = self.as_micros().checked_sub(duration.as_micros() as u64)?;
        Some(Self(NonZeroU64::new(micros + 1)?))
    }

    #[inline]
    pub fn has_elapsed(self, now: Self) -> bool {
        self <= now
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}µs", self.as_micros())
    }
}

impl core::ops::Add<Duration> for Timestamp {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn add(self, duration: Duration) -> Self {
        self.checked_add(duration).expect("timestamp overflow")
    }
}

impl core::ops::AddAssign<Duration> for Timestamp {
    #[inline]
    fn add_assign(&mut self, duration: Duration) {
        *self = *self + duration;
    }
}

impl core::ops::Sub for Timestamp {
    type Output = Duration;

    /// Saturates to zero rather than panicking when `rhs` is later;
    /// recovery arithmetic never wants a negative duration.
    #[inline]
    fn sub(self, rhs: Self) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

/// A cancellable one-shot timer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timer {
    expiration: Option<Timestamp>,
}

impl Timer {
    /// Arms the timer to expire at `time`, replacing any previous deadline
    #[inline]
    pub fn set(&mut self, time: Timestamp) {
        self.expiration = Some(time);
    }

    #[inline]
    pub fn cancel(&mut self) {
        self.expiration = None;
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.expiration.is_some()
    }

    #[inline]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.expiration, Some(expiration) if expiration.has_elapsed(now))
    }

    /// Returns `true` exactly once per armed deadline: when the timer has
    /// expired it is also cancelled so the expiration is not re-observed.
    #[inline]
    pub fn poll_expiration(&mut self, now: Timestamp) -> bool {
        if self.is_expired(now) {
            self.expiration = None;
            true
        } else {
            false
        }
    }

    /// The armed deadline, if any
    #[inline]
    pub fn expiration(&self) -> Option<Timestamp> {
        self.expiration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_arithmetic_test() {
        let base = Timestamp::from_millis(10);
        let later = base + Duration::from_millis(5);
        assert_eq!(later.saturating_duration_since(base), Duration::from_millis(5));
        assert_eq!(base.saturating_duration_since(later), Duration::ZERO);
        assert_eq!(later - base, Duration::from_millis(5));
    }

    #[test]
    fn timer_poll_expiration_test() {
        let mut timer = Timer::default();
        let now = Timestamp::from_millis(100);
        assert!(!timer.poll_expiration(now));

        timer.set(now + Duration::from_millis(10));
        assert!(timer.is_armed());
        assert!(!timer.poll_expiration(now));

        let now = now + Duration::from_millis(10);
        assert!(timer.poll_expiration(now));
        // expiration is observed only once
        assert!(!timer.poll_expiration(now));
        assert!(!timer.is_armed());
    }
}
