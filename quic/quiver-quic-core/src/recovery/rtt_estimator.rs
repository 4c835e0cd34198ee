// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{packet::number::PacketNumberSpace, time::Timestamp};
use core::{
    cmp::{max, min},
    time::Duration,
};

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.2
//# When no previous RTT is available, the initial RTT
//# SHOULD be set to 333 milliseconds.
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(333);

/// The lowest RTT value the estimator tracks
pub const MIN_RTT: Duration = Duration::from_micros(1);

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
//# The RECOMMENDED value of the timer granularity (kGranularity) is 1 millisecond.
pub const K_GRANULARITY: Duration = Duration::from_millis(1);

/// RTT statistics for a path
///
/// All arithmetic is over unsigned `Duration`s with explicit saturation;
/// a sample can never drive any of the estimates negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RttEstimator {
    latest_rtt: Duration,
    min_rtt: Duration,
    smoothed_rtt: Duration,
    rttvar: Duration,
    max_ack_delay: Duration,
    first_rtt_sample: Option<Timestamp>,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RTT)
    }
}

impl RttEstimator {
    #[inline]
    pub fn new(initial_rtt: Duration) -> Self {
        let initial_rtt = initial_rtt.max(MIN_RTT);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# smoothed_rtt = kInitialRtt
        //# rttvar = kInitialRtt / 2
        Self {
            latest_rtt: initial_rtt,
            min_rtt: initial_rtt,
            smoothed_rtt: initial_rtt,
            rttvar: initial_rtt / 2,
            max_ack_delay: Duration::ZERO,
            first_rtt_sample: None,
        }
    }

    /// Resets the estimator for a new path, keeping `max_ack_delay`
    pub fn for_new_path(&self, initial_rtt: Duration) -> Self {
        let mut estimator = Self::new(initial_rtt);
        estimator.max_ack_delay = self.max_ack_delay;
        estimator
    }

    #[inline]
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    #[inline]
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    #[inline]
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    #[inline]
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    #[inline]
    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    #[inline]
    pub fn first_rtt_sample(&self) -> Option<Timestamp> {
        self.first_rtt_sample
    }

    /// Records the peer's `max_ack_delay` transport parameter
    pub fn on_max_ack_delay(&mut self, max_ack_delay: Duration) {
        self.max_ack_delay = max_ack_delay;
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
    //# PTO = smoothed_rtt + max(4*rttvar, kGranularity) + max_ack_delay
    #[inline]
    pub fn pto_period(&self, pto_backoff: u32, space: PacketNumberSpace) -> Duration {
        let mut pto_period = self.smoothed_rtt;

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# The PTO period MUST be at least kGranularity, to avoid the timer
        //# expiring immediately.
        pto_period += max(self.rttvar * 4, K_GRANULARITY);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# When the PTO is armed for Initial or Handshake packet number spaces,
        //# the max_ack_delay in the PTO period computation is set to 0
        if space.is_application_data() {
            pto_period += self.max_ack_delay;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# Even when there are ack-eliciting packets in flight in multiple
        //# packet number spaces, the exponential increase in PTO occurs across
        //# all spaces
        pto_period * pto_backoff
    }

    /// Updates the estimate with a new sample
    #[inline]
    pub fn update_rtt(
        &mut self,
        mut ack_delay: Duration,
        rtt_sample: Duration,
        timestamp: Timestamp,
        is_handshake_confirmed: bool,
        space: PacketNumberSpace,
    ) {
        self.latest_rtt = rtt_sample.max(MIN_RTT);

        if self.first_rtt_sample.is_none() {
            self.first_rtt_sample = Some(timestamp);

            //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
            //# On the first RTT sample after initialization:
            //#
            //# smoothed_rtt = latest_rtt
            //# rttvar = latest_rtt / 2
            self.min_rtt = self.latest_rtt;
            self.smoothed_rtt = self.latest_rtt;
            self.rttvar = self.latest_rtt / 2;
            return;
        }

        self.min_rtt = min(self.min_rtt, self.latest_rtt);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# *  MAY ignore the acknowledgment delay for Initial packets, since
        //#    these acknowledgments are not delayed by the peer
        if space.is_initial() {
            ack_delay = Duration::ZERO;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# *  MUST use the lesser of the acknowledgement delay and the peer's
        //#    max_ack_delay after the handshake is confirmed
        if is_handshake_confirmed {
            ack_delay = min(ack_delay, self.max_ack_delay);
        }

        let mut adjusted_rtt = self.latest_rtt;

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# *  MUST NOT subtract the acknowledgement delay from the RTT sample if
        //#    the resulting value is smaller than the min_rtt.
        if self.min_rtt + ack_delay < self.latest_rtt {
            adjusted_rtt -= ack_delay;
        } else if !is_handshake_confirmed {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
            //# Therefore, prior to handshake
            //# confirmation, an endpoint MAY ignore RTT samples if adjusting the RTT
            //# sample for acknowledgement delay causes the sample to be less than
            //# the min_rtt.
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# smoothed_rtt = 7/8 * smoothed_rtt + 1/8 * adjusted_rtt
        //# rttvar_sample = abs(smoothed_rtt - adjusted_rtt)
        //# rttvar = 3/4 * rttvar + 1/4 * rttvar_sample
        let rttvar_sample = abs_difference(self.smoothed_rtt, adjusted_rtt);
        self.rttvar = weighted_average(self.rttvar, rttvar_sample, 4);
        self.smoothed_rtt = weighted_average(self.smoothed_rtt, adjusted_rtt, 8);
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
    //# The time threshold is:
    //#
    //# max(kTimeThreshold * max(smoothed_rtt, latest_rtt), kGranularity)
    #[inline]
    pub fn loss_time_threshold(&self) -> Duration {
        let base = max(self.smoothed_rtt, self.latest_rtt);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
        //# The RECOMMENDED time threshold (kTimeThreshold), expressed as an
        //# RTT multiplier, is 9/8.
        max(base + base / 8, K_GRANULARITY)
    }
}

#[inline]
fn abs_difference(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// `(weight-1)/weight * current + 1/weight * sample`
#[inline]
fn weighted_average(current: Duration, sample: Duration, weight: u32) -> Duration {
    current - current / weight + sample / weight
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    #[test]
    fn first_sample_initializes_test() {
        let mut estimator = RttEstimator::default();
        estimator.update_rtt(
            Duration::ZERO,
            Duration::from_millis(100),
            now(1),
            false,
            PacketNumberSpace::Initial,
        );

        assert_eq!(estimator.latest_rtt(), Duration::from_millis(100));
        assert_eq!(estimator.smoothed_rtt(), Duration::from_millis(100));
        assert_eq!(estimator.min_rtt(), Duration::from_millis(100));
        assert_eq!(estimator.rttvar(), Duration::from_millis(50));
    }

    #[test]
    fn ewma_weights_test() {
        let mut estimator = RttEstimator::default();
        estimator.update_rtt(
            Duration::ZERO,
            Duration::from_millis(100),
            now(1),
            false,
            PacketNumberSpace::Initial,
        );
        estimator.update_rtt(
            Duration::ZERO,
            Duration::from_millis(200),
            now(2),
            false,
            PacketNumberSpace::Initial,
        );

        // smoothed = 7/8 * 100 + 1/8 * 200 = 112.5ms
        assert_eq!(estimator.smoothed_rtt(), Duration::from_micros(112_500));
        // rttvar = 3/4 * 50 + 1/4 * |100 - 200| = 62.5ms
        assert_eq!(estimator.rttvar(), Duration::from_micros(62_500));
        assert_eq!(estimator.min_rtt(), Duration::from_millis(100));
    }

    #[test]
    fn ack_delay_is_subtracted_test() {
        let mut estimator = RttEstimator::default();
        estimator.on_max_ack_delay(Duration::from_millis(25));
        estimator.update_rtt(
            Duration::ZERO,
            Duration::from_millis(100),
            now(1),
            true,
            PacketNumberSpace::ApplicationData,
        );
        estimator.update_rtt(
            Duration::from_millis(10),
            Duration::from_millis(150),
            now(2),
            true,
            PacketNumberSpace::ApplicationData,
        );

        // adjusted = 150 - 10 = 140; smoothed = 7/8 * 100 + 1/8 * 140
        assert_eq!(estimator.smoothed_rtt(), Duration::from_millis(105));
    }

    #[test]
    fn ack_delay_capped_by_max_ack_delay_test() {
        let mut estimator = RttEstimator::default();
        estimator.on_max_ack_delay(Duration::from_millis(5));
        estimator.update_rtt(
            Duration::ZERO,
            Duration::from_millis(100),
            now(1),
            true,
            PacketNumberSpace::ApplicationData,
        );
        estimator.update_rtt(
            Duration::from_millis(50),
            Duration::from_millis(150),
            now(2),
            true,
            PacketNumberSpace::ApplicationData,
        );

        // the reported 50ms delay is clamped to max_ack_delay = 5ms
        assert_eq!(estimator.smoothed_rtt(), Duration::from_micros(105_625));
    }

    #[test]
    fn pto_period_test() {
        let mut estimator = RttEstimator::default();
        estimator.on_max_ack_delay(Duration::from_millis(25));
        estimator.update_rtt(
            Duration::ZERO,
            Duration::from_millis(100),
            now(1),
            true,
            PacketNumberSpace::ApplicationData,
        );

        // PTO = 100 + max(4 * 50, 1) + 25
        assert_eq!(
            estimator.pto_period(1, PacketNumberSpace::ApplicationData),
            Duration::from_millis(325)
        );
        // Initial space excludes max_ack_delay
        assert_eq!(
            estimator.pto_period(1, PacketNumberSpace::Initial),
            Duration::from_millis(300)
        );
        // backoff doubles the whole period
        assert_eq!(
            estimator.pto_period(2, PacketNumberSpace::ApplicationData),
            Duration::from_millis(650)
        );
    }

    #[test]
    fn loss_time_threshold_test() {
        let mut estimator = RttEstimator::default();
        estimator.update_rtt(
            Duration::ZERO,
            Duration::from_millis(80),
            now(1),
            false,
            PacketNumberSpace::Initial,
        );

        // 9/8 * 80ms
        assert_eq!(estimator.loss_time_threshold(), Duration::from_millis(90));
    }
}
