// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Receive-side ACK state for one packet number space

use quiver_quic_core::{
    ack,
    frame::ack::{Ack, EcnCounts},
    packet::number::PacketNumber,
    time::{Timer, Timestamp},
    varint::VarInt,
};

/// Tracks received packet numbers and decides when to emit an ACK
///
/// Duplicates are detected here, before any frame reaches a handler, so
/// replayed packets can never cause duplicate delivery.
#[derive(Debug)]
pub struct AckTracker {
    received: ack::Ranges,
    largest_received: Option<PacketNumber>,
    largest_received_time: Option<Timestamp>,
    /// Armed when an ack-eliciting packet is waiting for an ACK
    ack_delay_timer: Timer,
    /// Reordering or gaps force an ACK on the next transmission
    ack_immediately: bool,
    /// Received but not-yet-acknowledged ack-eliciting packets
    unacked_eliciting: usize,
    ecn_counts: EcnCounts,
    ecn_enabled: bool,
    settings: ack::Settings,
}

/// How the tracker classified a received packet number
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// First time this packet number is seen
    New,
    /// Already processed; the packet must not be dispatched again
    Duplicate,
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.1
//# an endpoint SHOULD generate and send an ACK frame after receiving at
//# least two ack-eliciting packets.
const ACK_ELICITING_THRESHOLD: usize = 2;

impl AckTracker {
    pub fn new(settings: ack::Settings) -> Self {
        Self {
            received: ack::Ranges::new(),
            largest_received: None,
            largest_received_time: None,
            ack_delay_timer: Timer::default(),
            ack_immediately: false,
            unacked_eliciting: 0,
            ecn_counts: EcnCounts::default(),
            ecn_enabled: false,
            settings,
        }
    }

    #[inline]
    pub fn largest_received(&self) -> Option<PacketNumber> {
        self.largest_received
    }

    /// Records a packet number, classifying duplicates
    pub fn on_packet_received(
        &mut self,
        packet_number: PacketNumber,
        ack_eliciting: bool,
        now: Timestamp,
    ) -> Disposition {
        let value = packet_number.as_varint();
        if self.received.contains(&value) {
            return Disposition::Duplicate;
        }

        let previous_largest = self.largest_received;
        let is_reordered = match previous_largest {
            // lower than the current largest, or leaving a gap above it
            Some(largest) => {
                packet_number < largest
                    || packet_number.as_u64() > largest.as_u64() + 1
            }
            None => packet_number.as_u64() != 0,
        };

        self.received.insert_value(value);
        if previous_largest.map_or(true, |largest| packet_number > largest) {
            self.largest_received = Some(packet_number);
            self.largest_received_time = Some(now);
        }

        if ack_eliciting {
            self.unacked_eliciting += 1;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.1
            //# Similarly, packets marked with the ECN Congestion Experienced
            //# (CE) codepoint in the IP header SHOULD be acknowledged
            //# immediately
            if is_reordered || self.unacked_eliciting >= ACK_ELICITING_THRESHOLD {
                self.ack_immediately = true;
            } else if !self.ack_delay_timer.is_armed() {
                self.ack_delay_timer.set(now + self.settings.max_ack_delay);
            }
        }

        Disposition::New
    }

    /// Records an ECN codepoint observation for this space
    pub fn on_ecn(&mut self, ce: bool) {
        self.ecn_enabled = true;
        if ce {
            self.ecn_counts.ce_count = self.ecn_counts.ce_count.saturating_add(VarInt::from_u8(1));
        } else {
            self.ecn_counts.ect_0_count = self
                .ecn_counts
                .ect_0_count
                .saturating_add(VarInt::from_u8(1));
        }
    }

    /// Whether an ACK should go out now (timer fired or forced)
    pub fn should_ack(&self, now: Timestamp) -> bool {
        if self.received.is_empty() {
            return false;
        }
        self.ack_immediately || self.ack_delay_timer.is_expired(now)
    }

    /// Whether an ACK will be owed eventually
    pub fn has_pending(&self) -> bool {
        self.ack_immediately || self.ack_delay_timer.is_armed()
    }

    pub fn timer_expiration(&self) -> Option<Timestamp> {
        self.ack_delay_timer.expiration()
    }

    /// Builds the ACK frame covering everything received
    ///
    /// Clears the delay state; tracked ranges stay until an ACK carrying
    /// them is itself acknowledged.
    pub fn build_frame(&mut self, now: Timestamp) -> Option<Ack<ack::Ranges>> {
        if self.received.is_empty() {
            return None;
        }

        let ack_delay = self
            .largest_received_time
            .map(|received| now.saturating_duration_since(received))
            .unwrap_or_default();

        let frame = Ack {
            ack_delay: self.settings.encode_ack_delay(ack_delay),
            ranges: self.received.clone(),
            ecn_counts: self.ecn_enabled.then_some(self.ecn_counts),
        };

        self.ack_immediately = false;
        self.unacked_eliciting = 0;
        self.ack_delay_timer.cancel();

        Some(frame)
    }

    /// The peer acknowledged a packet which carried an ACK with
    /// `largest`; ranges below it need not be reported again
    pub fn on_ack_acknowledged(&mut self, largest: VarInt) {
        self.received.remove_below(largest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use quiver_quic_core::{frame::ack::AckRanges, packet::number::PacketNumberSpace};

    fn pn(value: u64) -> PacketNumber {
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::new(value).unwrap())
    }

    fn tracker() -> AckTracker {
        AckTracker::new(ack::Settings::default())
    }

    #[test]
    fn duplicate_detection_test() {
        let mut tracker = tracker();
        let now = Timestamp::from_millis(1);
        assert_eq!(tracker.on_packet_received(pn(0), true, now), Disposition::New);
        assert_eq!(
            tracker.on_packet_received(pn(0), true, now),
            Disposition::Duplicate
        );
    }

    #[test]
    fn in_order_packet_arms_delay_timer_test() {
        let mut tracker = tracker();
        let now = Timestamp::from_millis(1);
        tracker.on_packet_received(pn(0), true, now);

        assert!(!tracker.should_ack(now));
        assert!(tracker.has_pending());

        // the timer fires at max_ack_delay
        let later = now + Duration::from_millis(25);
        assert!(tracker.should_ack(later));
    }

    #[test]
    fn reordered_packet_acks_immediately_test() {
        let mut tracker = tracker();
        let now = Timestamp::from_millis(1);
        // a gap: 0 then 2
        tracker.on_packet_received(pn(0), true, now);
        tracker.on_packet_received(pn(2), true, now);
        assert!(tracker.should_ack(now));
    }

    #[test]
    fn second_eliciting_packet_acks_immediately_test() {
        let mut tracker = tracker();
        let now = Timestamp::from_millis(1);
        tracker.on_packet_received(pn(0), true, now);
        assert!(!tracker.should_ack(now));
        tracker.on_packet_received(pn(1), true, now);
        assert!(tracker.should_ack(now));
    }

    #[test]
    fn non_eliciting_packets_never_force_ack_test() {
        let mut tracker = tracker();
        let now = Timestamp::from_millis(1);
        tracker.on_packet_received(pn(0), false, now);
        assert!(!tracker.should_ack(now + Duration::from_secs(1)));
        assert!(!tracker.has_pending());
    }

    #[test]
    fn ack_coverage_test() {
        let mut tracker = tracker();
        let now = Timestamp::from_millis(1);
        for value in [0u64, 1, 2, 5, 9] {
            tracker.on_packet_received(pn(value), true, now);
        }

        let frame = tracker.build_frame(now + Duration::from_millis(4)).unwrap();
        assert_eq!(frame.largest_acknowledged().as_u64(), 9);
        // every received packet is covered
        let ranges: Vec<_> = frame.ranges.ack_ranges().collect();
        assert_eq!(ranges.len(), 3);
    }

    #[test]
    fn ack_of_ack_prunes_ranges_test() {
        let mut tracker = tracker();
        let now = Timestamp::from_millis(1);
        for value in 0..5u64 {
            tracker.on_packet_received(pn(value), true, now);
        }
        tracker.on_ack_acknowledged(VarInt::new(4).unwrap());

        let frame = tracker.build_frame(now).unwrap();
        assert_eq!(frame.ranges.smallest_acknowledged().as_u64(), 4);
        assert_eq!(frame.largest_acknowledged().as_u64(), 4);
    }
}
