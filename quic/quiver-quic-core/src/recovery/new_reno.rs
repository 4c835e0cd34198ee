// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    recovery::{congestion_controller::CongestionController, RttEstimator},
    time::Timestamp,
};

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.2
//# Endpoints SHOULD use an initial congestion
//# window of ten times the maximum datagram size (max_datagram_size),
//# while limiting the window to the larger of 14,720 bytes or twice the
//# maximum datagram size.
const INITIAL_WINDOW_PACKETS: u32 = 10;
const INITIAL_WINDOW_CAP: u32 = 14_720;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.2
//# The RECOMMENDED value is 2 * max_datagram_size.
const MINIMUM_WINDOW_PACKETS: u32 = 2;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.1
//# The RECOMMENDED factor is 0.5.
const LOSS_REDUCTION_DIVISOR: u32 = 2;

/// NewReno congestion control (RFC 9002 §7)
///
/// Slow start doubles per RTT; congestion avoidance grows one
/// max_datagram_size per window acknowledged; a loss event halves the
/// window once per recovery period.
#[derive(Clone, Debug)]
pub struct NewReno {
    max_datagram_size: u16,
    congestion_window: u32,
    slow_start_threshold: u32,
    bytes_in_flight: u32,
    /// Packets sent before this time are in the current recovery period
    /// and do not trigger another window reduction
    recovery_start_time: Option<Timestamp>,
    /// Bytes acked since the window last grew, used in congestion
    /// avoidance
    bytes_acked: u32,
}

impl NewReno {
    #[inline]
    pub fn new(max_datagram_size: u16) -> Self {
        Self {
            max_datagram_size,
            congestion_window: initial_window(max_datagram_size),
            slow_start_threshold: u32::MAX,
            bytes_in_flight: 0,
            recovery_start_time: None,
            bytes_acked: 0,
        }
    }

    #[inline]
    fn minimum_window(&self) -> u32 {
        MINIMUM_WINDOW_PACKETS * self.max_datagram_size as u32
    }

    #[inline]
    fn in_recovery(&self, sent_time: Timestamp) -> bool {
        matches!(self.recovery_start_time, Some(start) if sent_time <= start)
    }
}

impl CongestionController for NewReno {
    #[inline]
    fn congestion_window(&self) -> u32 {
        self.congestion_window
    }

    #[inline]
    fn bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight
    }

    #[inline]
    fn on_packet_sent(&mut self, _time_sent: Timestamp, bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_add(bytes as u32);
    }

    #[inline]
    fn on_ack(&mut self, largest_sent_time: Timestamp, bytes: usize, _rtt: &RttEstimator) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes as u32);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
        //# A NewReno sender MUST NOT increase its congestion
        //# window in recovery
        if self.in_recovery(largest_sent_time) {
            return;
        }

        if self.congestion_window < self.slow_start_threshold {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.1
            //# While a sender is in slow start, the congestion window increases by
            //# the number of bytes acknowledged
            self.congestion_window = self.congestion_window.saturating_add(bytes as u32);
            return;
        }

        // congestion avoidance: one max_datagram_size per full window
        self.bytes_acked = self.bytes_acked.saturating_add(bytes as u32);
        if self.bytes_acked >= self.congestion_window {
            self.bytes_acked -= self.congestion_window;
            self.congestion_window = self
                .congestion_window
                .saturating_add(self.max_datagram_size as u32);
        }
    }

    #[inline]
    fn on_loss(&mut self, time_sent: Timestamp, bytes: usize, persistent: bool, now: Timestamp) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes as u32);

        if !self.in_recovery(time_sent) {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
            //# The sender MUST exit congestion avoidance and enter a recovery
            //# period when a packet is lost
            self.recovery_start_time = Some(now);
            self.congestion_window =
                (self.congestion_window / LOSS_REDUCTION_DIVISOR).max(self.minimum_window());
            self.slow_start_threshold = self.congestion_window;
            self.bytes_acked = 0;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.2
        //# When persistent congestion is declared, the sender's congestion
        //# window MUST be reduced to the minimum congestion window
        if persistent {
            self.congestion_window = self.minimum_window();
            self.recovery_start_time = None;
        }
    }

    #[inline]
    fn on_packet_discarded(&mut self, bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes as u32);
    }

    #[inline]
    fn on_mtu_update(&mut self, max_datagram_size: u16) {
        // scale the window with the datagram size, as an increased MTU
        // changes how many bytes one window-packet represents
        let old = self.max_datagram_size as u64;
        let new = max_datagram_size as u64;
        self.congestion_window = ((self.congestion_window as u64 * new) / old) as u32;
        self.max_datagram_size = max_datagram_size;
    }

    #[inline]
    fn on_path_reset(&mut self, max_datagram_size: u16) {
        *self = Self::new(max_datagram_size);
    }

    #[inline]
    fn is_slow_start(&self) -> bool {
        self.congestion_window < self.slow_start_threshold
    }
}

#[inline]
fn initial_window(max_datagram_size: u16) -> u32 {
    (INITIAL_WINDOW_PACKETS * max_datagram_size as u32)
        .min(INITIAL_WINDOW_CAP.max(MINIMUM_WINDOW_PACKETS * max_datagram_size as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timestamp;

    const MTU: u16 = 1200;

    fn now(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    #[test]
    fn initial_window_test() {
        let cc = NewReno::new(MTU);
        assert_eq!(cc.congestion_window(), 12_000);
        assert!(cc.is_slow_start());

        // for large MTUs the cap is twice the datagram size
        let cc = NewReno::new(9000);
        assert_eq!(cc.congestion_window(), 18_000);
    }

    #[test]
    fn slow_start_doubles_test() {
        let mut cc = NewReno::new(MTU);
        let window = cc.congestion_window();
        let rtt = RttEstimator::default();

        cc.on_packet_sent(now(0), window as usize);
        assert!(!cc.can_send(1));

        cc.on_ack(now(0), window as usize, &rtt);
        assert_eq!(cc.congestion_window(), window * 2);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn loss_halves_window_once_per_period_test() {
        let mut cc = NewReno::new(MTU);
        let window = cc.congestion_window();

        cc.on_packet_sent(now(0), 1200);
        cc.on_packet_sent(now(1), 1200);
        cc.on_loss(now(0), 1200, false, now(5));
        assert_eq!(cc.congestion_window(), window / 2);

        // a second loss of a packet sent in the same period does not
        // reduce the window again
        cc.on_loss(now(1), 1200, false, now(6));
        assert_eq!(cc.congestion_window(), window / 2);
        assert!(!cc.is_slow_start());
    }

    #[test]
    fn persistent_congestion_collapses_window_test() {
        let mut cc = NewReno::new(MTU);
        cc.on_packet_sent(now(0), 1200);
        cc.on_loss(now(0), 1200, true, now(5));
        assert_eq!(cc.congestion_window(), 2 * MTU as u32);
    }

    #[test]
    fn congestion_avoidance_grows_linearly_test() {
        let mut cc = NewReno::new(MTU);
        let rtt = RttEstimator::default();

        // force congestion avoidance
        cc.on_packet_sent(now(0), 1200);
        cc.on_loss(now(0), 1200, false, now(1));
        let window = cc.congestion_window();

        // acking a full window grows it by one datagram
        cc.on_packet_sent(now(2), window as usize);
        cc.on_ack(now(2), window as usize, &rtt);
        assert_eq!(cc.congestion_window(), window + MTU as u32);
    }
}
