// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{recovery::RttEstimator, time::Timestamp};
use core::time::Duration;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.7
//# A perfectly paced sender spreads packets exactly evenly over time.
//# For a window-based congestion controller, such as the one in this
//# document, that rate can be computed by averaging the congestion
//# window over the RTT:
//#
//# rate = N * congestion_window / smoothed_rtt

/// How much faster than cwnd/srtt the pacer releases, to avoid
/// underutilizing the window when acks are delayed
const PACING_GAIN_NUMERATOR: u64 = 5;
const PACING_GAIN_DENOMINATOR: u64 = 4;

/// Datagrams released in a burst before interpacket gaps apply
const INITIAL_BURST_DATAGRAMS: u64 = 10;

/// A token-bucket pacer gating datagram release
///
/// Pacing operates on whole datagrams: a packet is always encoded in
/// full, and only the release of the datagram is delayed.
#[derive(Clone, Debug, Default)]
pub struct Pacer {
    /// The next time a datagram may be released, if throttled
    next_release: Option<Timestamp>,
    /// Unused transmission credit, in bytes
    credit: u64,
    /// Datagrams which may still be sent unpaced at startup
    burst_budget: u64,
}

impl Pacer {
    #[inline]
    pub fn new() -> Self {
        Self {
            next_release: None,
            credit: 0,
            burst_budget: INITIAL_BURST_DATAGRAMS,
        }
    }

    /// The earliest time the next datagram may be released, if the pacer
    /// is currently throttling
    #[inline]
    pub fn earliest_departure_time(&self) -> Option<Timestamp> {
        self.next_release
    }

    /// Returns `true` if a datagram may leave now
    #[inline]
    pub fn can_release(&self, now: Timestamp) -> bool {
        match self.next_release {
            Some(release) => release.has_elapsed(now),
            None => true,
        }
    }

    /// Records the release of a datagram of `bytes` and computes the
    /// next allowed departure time from `cwnd / srtt`
    #[inline]
    pub fn on_datagram_sent(
        &mut self,
        now: Timestamp,
        bytes: usize,
        congestion_window: u32,
        rtt: &RttEstimator,
    ) {
        if self.burst_budget > 0 {
            self.burst_budget -= 1;
            self.next_release = None;
            return;
        }

        let bytes = bytes as u64;
        if self.credit >= bytes {
            self.credit -= bytes;
            self.next_release = None;
            return;
        }
        let deficit = bytes - self.credit;
        self.credit = 0;

        // rate = gain * cwnd / srtt; interval = deficit / rate
        let rate_numerator = PACING_GAIN_NUMERATOR * congestion_window as u64;
        if rate_numerator == 0 {
            self.next_release = None;
            return;
        }
        let srtt_micros = rtt.smoothed_rtt().as_micros() as u64;
        let interval_micros =
            deficit * srtt_micros * PACING_GAIN_DENOMINATOR / rate_numerator;

        self.next_release = now.checked_add(Duration::from_micros(interval_micros));
    }

    /// Grants transmission credit, e.g. when the window opens after an ack
    #[inline]
    pub fn on_window_increase(&mut self, bytes: u64) {
        self.credit = self.credit.saturating_add(bytes);
    }

    /// Resets pacing state for a new path
    #[inline]
    pub fn on_path_reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::number::PacketNumberSpace;

    fn rtt_with(millis: u64) -> RttEstimator {
        let mut rtt = RttEstimator::default();
        rtt.update_rtt(
            Duration::ZERO,
            Duration::from_millis(millis),
            Timestamp::from_millis(1),
            false,
            PacketNumberSpace::Initial,
        );
        rtt
    }

    #[test]
    fn initial_burst_is_unpaced_test() {
        let mut pacer = Pacer::new();
        let now = Timestamp::from_millis(10);
        let rtt = rtt_with(100);

        for _ in 0..INITIAL_BURST_DATAGRAMS {
            assert!(pacer.can_release(now));
            pacer.on_datagram_sent(now, 1200, 12_000, &rtt);
        }
        assert!(pacer.can_release(now));

        // the burst budget is exhausted; the next send throttles
        pacer.on_datagram_sent(now, 1200, 12_000, &rtt);
        assert!(!pacer.can_release(now));
        let release = pacer.earliest_departure_time().unwrap();
        assert!(release > now);
    }

    #[test]
    fn release_interval_tracks_rate_test() {
        let mut pacer = Pacer::new();
        pacer.burst_budget = 0;
        let now = Timestamp::from_millis(10);
        let rtt = rtt_with(100);

        // rate = 5/4 * 12000 bytes / 100ms = 150 bytes/ms;
        // a 1200-byte datagram earns an 8ms gap
        pacer.on_datagram_sent(now, 1200, 12_000, &rtt);
        let release = pacer.earliest_departure_time().unwrap();
        assert_eq!(release - now, Duration::from_millis(8));
        assert!(pacer.can_release(release));
    }
}
