// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Acknowledgment bookkeeping shared by the ACK generator and the ACK
//! processor

use crate::{
    frame::ack::AckRanges as AckRangesTrait,
    interval_set::IntervalSet,
    varint::VarInt,
};
use core::{ops::RangeInclusive, time::Duration};

/// The default bound on tracked ACK ranges
///
/// When more reordering occurs than fits, the lowest ranges are shed
/// first; those packets will look lost to the peer, which is safe.
pub const DEFAULT_ACK_RANGES_LIMIT: usize = 10;

/// An owned set of acknowledged packet numbers
///
/// Backs both the receive path (which packet numbers we owe ACKs for)
/// and constructed ACK frames in tests and retransmission.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ranges {
    set: IntervalSet<VarInt>,
}

impl Ranges {
    #[inline]
    pub fn new() -> Self {
        Self {
            set: IntervalSet::with_limit(DEFAULT_ACK_RANGES_LIMIT),
        }
    }

    #[inline]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            set: IntervalSet::with_limit(limit),
        }
    }

    #[inline]
    pub fn insert_value(&mut self, value: VarInt) {
        self.set.insert_value(value)
    }

    #[inline]
    pub fn insert(&mut self, range: RangeInclusive<VarInt>) {
        self.set.insert(range)
    }

    #[inline]
    pub fn contains(&self, value: &VarInt) -> bool {
        self.set.contains(value)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.set.clear()
    }

    #[inline]
    pub fn min_value(&self) -> Option<VarInt> {
        self.set.min_value()
    }

    #[inline]
    pub fn max_value(&self) -> Option<VarInt> {
        self.set.max_value()
    }

    #[inline]
    pub fn interval_len(&self) -> usize {
        self.set.interval_len()
    }

    /// Drops every tracked value below `bound`, e.g. once an ACK
    /// carrying them has itself been acknowledged
    #[inline]
    pub fn remove_below(&mut self, bound: VarInt) {
        self.set.remove_below(bound)
    }

    /// Iterates ranges in ascending order
    #[inline]
    pub fn ascending_ranges(
        &self,
    ) -> impl DoubleEndedIterator<Item = RangeInclusive<VarInt>> + '_ {
        self.set.inclusive_ranges()
    }
}

impl AckRangesTrait for Ranges {
    #[inline]
    fn ack_ranges(&self) -> impl Iterator<Item = RangeInclusive<VarInt>> + '_ {
        self.set.inclusive_ranges().rev()
    }

    #[inline]
    fn largest_acknowledged(&self) -> VarInt {
        self.set.max_value().expect("ack ranges may not be empty")
    }

    #[inline]
    fn smallest_acknowledged(&self) -> VarInt {
        self.set.min_value().expect("ack ranges may not be empty")
    }

    #[inline]
    fn excess_range_count(&self) -> usize {
        self.set.interval_len().saturating_sub(1)
    }
}

/// Negotiated ACK behavior for one endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    /// The most we intend to delay an ACK for an ack-eliciting packet
    pub max_ack_delay: Duration,

    /// The exponent scaling the ACK Delay field on the wire
    pub ack_delay_exponent: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
            //# If this value is absent, a default of 25 milliseconds is assumed
            max_ack_delay: Duration::from_millis(25),
            //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
            //# If this value is absent, a default value of 3 is assumed
            ack_delay_exponent: 3,
        }
    }
}

impl Settings {
    /// Scales a local delay into the wire representation
    #[inline]
    pub fn encode_ack_delay(&self, delay: Duration) -> VarInt {
        let micros = delay.as_micros() as u64;
        VarInt::new(micros >> self.ack_delay_exponent).unwrap_or(VarInt::MAX)
    }

    /// Expands a wire ACK Delay field into a duration
    #[inline]
    pub fn decode_ack_delay(&self, value: VarInt) -> Duration {
        let micros = value.as_u64().saturating_shl(self.ack_delay_exponent as u32);
        Duration::from_micros(micros)
    }
}

trait SaturatingShl {
    fn saturating_shl(self, shift: u32) -> Self;
}

impl SaturatingShl for u64 {
    #[inline]
    fn saturating_shl(self, shift: u32) -> Self {
        self.checked_shl(shift)
            .filter(|shifted| shifted >> shift == self)
            .unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(value: u64) -> VarInt {
        VarInt::new(value).unwrap()
    }

    #[test]
    fn ranges_iterate_descending_test() {
        let mut ranges = Ranges::new();
        ranges.insert_value(value(1));
        ranges.insert(value(5)..=value(7));
        ranges.insert_value(value(10));

        let collected: Vec<_> = ranges.ack_ranges().collect();
        assert_eq!(
            collected,
            vec![
                value(10)..=value(10),
                value(5)..=value(7),
                value(1)..=value(1)
            ]
        );
        assert_eq!(ranges.largest_acknowledged(), value(10));
        assert_eq!(ranges.smallest_acknowledged(), value(1));
        assert_eq!(ranges.excess_range_count(), 2);
    }

    #[test]
    fn ack_delay_scaling_round_trip_test() {
        let settings = Settings::default();
        let delay = Duration::from_millis(10);
        let encoded = settings.encode_ack_delay(delay);
        // 10ms = 10_000µs; 10_000 >> 3 = 1250
        assert_eq!(encoded.as_u64(), 1250);
        assert_eq!(settings.decode_ack_delay(encoded), delay);
    }

    #[test]
    fn ack_delay_saturates_test() {
        let settings = Settings {
            ack_delay_exponent: 20,
            ..Default::default()
        };
        let decoded = settings.decode_ack_delay(VarInt::MAX);
        assert_eq!(decoded, Duration::from_micros(u64::MAX));
    }
}
