// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Loss detection and congestion state shared across packet number
//! spaces
//!
//! The per-space bookkeeping lives in `SentPackets`; this manager owns
//! the RTT estimator, the congestion controller, the pacer, and the PTO
//! machinery, all of which span spaces.

use crate::{
    sent_packets::{SentPacketInfo, SentPackets},
    space::PacketSpace,
};
use core::time::Duration;
use quiver_quic_core::{
    ack,
    packet::number::PacketNumberSpace,
    recovery::{CongestionController, Pacer, RttEstimator, K_PACKET_THRESHOLD},
    time::{Timer, Timestamp},
    varint::VarInt,
};

/// The result of processing one ACK frame
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub newly_acked: Vec<(u64, SentPacketInfo)>,
    pub lost: Vec<(u64, SentPacketInfo)>,
}

pub struct Manager {
    rtt: RttEstimator,
    congestion: Box<dyn CongestionController>,
    pacer: Pacer,
    /// Exponential PTO backoff; reset on forward progress
    pto_backoff: u32,
    pto_timer: Timer,
    /// Ack-eliciting probes owed after a PTO expiry
    probes_pending: u8,
    handshake_confirmed: bool,
    ack_settings: ack::Settings,
}

impl Manager {
    pub fn new(congestion: Box<dyn CongestionController>, ack_settings: ack::Settings) -> Self {
        Self {
            rtt: RttEstimator::default(),
            congestion,
            pacer: Pacer::new(),
            pto_backoff: 1,
            pto_timer: Timer::default(),
            probes_pending: 0,
            handshake_confirmed: false,
            ack_settings,
        }
    }

    #[inline]
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    #[inline]
    pub fn rtt_mut(&mut self) -> &mut RttEstimator {
        &mut self.rtt
    }

    #[inline]
    pub fn congestion(&self) -> &dyn CongestionController {
        &*self.congestion
    }

    #[inline]
    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    #[inline]
    pub fn probes_pending(&self) -> u8 {
        self.probes_pending
    }

    #[inline]
    pub fn take_probe(&mut self) -> bool {
        if self.probes_pending > 0 {
            self.probes_pending -= 1;
            true
        } else {
            false
        }
    }

    pub fn on_handshake_confirmed(&mut self) {
        self.handshake_confirmed = true;
    }

    /// Whether `bytes` may be sent right now under congestion and pacing
    pub fn can_send(&self, bytes: usize, now: Timestamp) -> bool {
        if self.probes_pending > 0 {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.5
            //# Probe packets MUST NOT be blocked by the congestion
            //# controller.
            return true;
        }
        self.congestion.can_send(bytes) && self.pacer.can_release(now)
    }

    pub fn on_packet_sent(
        &mut self,
        space: &mut PacketSpace,
        packet_number: u64,
        info: SentPacketInfo,
        now: Timestamp,
    ) {
        let size = info.size as usize;
        let in_flight = info.in_flight;
        space.sent.on_packet_sent(packet_number, info);

        if in_flight {
            self.congestion.on_packet_sent(now, size);
        }
    }

    /// Pacing operates on whole datagrams, not individual packets
    pub fn on_datagram_sent(&mut self, now: Timestamp, len: usize) {
        self.pacer
            .on_datagram_sent(now, len, self.congestion.congestion_window(), &self.rtt);
    }

    /// Applies an ACK frame to one space
    pub fn on_ack_received<R>(
        &mut self,
        space: &mut PacketSpace,
        largest_acknowledged: VarInt,
        ack_delay: Duration,
        ranges: R,
        now: Timestamp,
    ) -> AckOutcome
    where
        R: Iterator<Item = core::ops::RangeInclusive<VarInt>>,
    {
        let mut outcome = AckOutcome::default();
        let mut newly_acked_bytes = 0usize;
        let mut largest_is_newly_acked = false;
        let mut largest_send_time = None;

        for range in ranges {
            for pn in space.sent.tracked_in(range.start().as_u64()..=range.end().as_u64()) {
                let info = space.sent.on_packet_acked(pn).expect("tracked packet");
                if info.in_flight {
                    newly_acked_bytes += info.size as usize;
                }
                if pn == largest_acknowledged.as_u64() {
                    largest_is_newly_acked = true;
                    if info.ack_eliciting {
                        largest_send_time = Some(info.send_time);
                    }
                }
                outcome.newly_acked.push((pn, info));
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.1
        //# An endpoint generates an RTT sample on receiving an ACK frame
        //# that meets the following two conditions:
        //#
        //# *  the largest acknowledged packet number is newly acknowledged,
        //#    and
        //#
        //# *  at least one of the newly acknowledged packets was ack-
        //#    eliciting.
        if largest_is_newly_acked {
            if let Some(send_time) = largest_send_time {
                let rtt_sample = now.saturating_duration_since(send_time);
                self.rtt.update_rtt(
                    ack_delay,
                    rtt_sample,
                    now,
                    self.handshake_confirmed,
                    space.space(),
                );
            }
        }

        if !outcome.newly_acked.is_empty() {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
            //# The PTO backoff factor is reset when an acknowledgment is
            //# received
            self.pto_backoff = 1;
            self.probes_pending = 0;

            if newly_acked_bytes > 0 {
                let time = largest_send_time.unwrap_or(now);
                self.congestion.on_ack(time, newly_acked_bytes, &self.rtt);
                self.pacer.on_window_increase(newly_acked_bytes as u64);
            }
        }

        let (lost, next_loss_time) = self.detect_lost(space, now);
        outcome.lost = lost;
        match next_loss_time {
            Some(deadline) => space.loss_timer.set(deadline),
            None => space.loss_timer.cancel(),
        }

        outcome
    }

    /// Runs loss detection for one space, charging the congestion
    /// controller for what it finds
    fn detect_lost(
        &mut self,
        space: &mut PacketSpace,
        now: Timestamp,
    ) -> (Vec<(u64, SentPacketInfo)>, Option<Timestamp>) {
        let threshold = self.rtt.loss_time_threshold();
        let (lost, next_loss_time) = space.sent.detect_lost(now, threshold, K_PACKET_THRESHOLD);

        let persistent = self.is_persistent_congestion(&lost);
        for (_, info) in &lost {
            if info.in_flight {
                self.congestion
                    .on_loss(info.send_time, info.size as usize, persistent, now);
            }
        }

        (lost, next_loss_time)
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.2
    //# A sender establishes persistent congestion after the receipt of an
    //# acknowledgment if two packets that are ack-eliciting are declared
    //# lost, and:
    //# ...
    //# *  the duration between the send times of these two packets exceeds
    //#    the persistent congestion duration (Section 7.6.1)
    fn is_persistent_congestion(&self, lost: &[(u64, SentPacketInfo)]) -> bool {
        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.2
        //# The persistent congestion period SHOULD NOT start until there
        //# is at least one RTT sample.
        if self.rtt.first_rtt_sample().is_none() {
            return false;
        }

        let mut eliciting = lost
            .iter()
            .filter(|(_, info)| info.ack_eliciting)
            .map(|(_, info)| info.send_time);
        let (Some(first), Some(last)) = (eliciting.next(), eliciting.next_back()) else {
            return false;
        };

        // PTO · kPersistentCongestionThreshold, with max_ack_delay
        // included regardless of space
        let duration = last.saturating_duration_since(first);
        duration > self.rtt.pto_period(1, PacketNumberSpace::ApplicationData) * 3
    }

    /// The loss-timer expired for `space`
    pub fn on_loss_timer(
        &mut self,
        space: &mut PacketSpace,
        now: Timestamp,
    ) -> Vec<(u64, SentPacketInfo)> {
        let (lost, next_loss_time) = self.detect_lost(space, now);
        match next_loss_time {
            Some(deadline) => space.loss_timer.set(deadline),
            None => space.loss_timer.cancel(),
        }
        lost
    }

    /// Arms the PTO timer from the earliest eligible space
    pub fn arm_pto(&mut self, spaces: &[&PacketSpace]) {
        let mut deadline: Option<Timestamp> = None;

        for space in spaces {
            if !space.sent.has_ack_eliciting_in_flight() {
                continue;
            }
            let Some(sent) = space.sent.earliest_ack_eliciting_sent() else {
                continue;
            };
            let period = self.rtt.pto_period(self.pto_backoff, space.space());
            let candidate = sent + period;
            deadline = Some(match deadline {
                Some(existing) => existing.min(candidate),
                None => candidate,
            });
        }

        match deadline {
            Some(deadline) => self.pto_timer.set(deadline),
            None => self.pto_timer.cancel(),
        }
    }

    /// Fires the PTO if expired; schedules probe transmissions
    pub fn on_pto_timer(&mut self, now: Timestamp) -> bool {
        if !self.pto_timer.poll_expiration(now) {
            return false;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.4
        //# When a PTO timer expires, a sender MUST send at least one ack-
        //# eliciting packet in the packet number space as a probe.  An
        //# endpoint MAY send up to two full-sized datagrams containing
        //# ack-eliciting packets
        self.probes_pending = 2;

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2
        //# A sender computes its PTO timer every time an ack-eliciting
        //# packet is sent... When a PTO timer expires, the PTO backoff MUST
        //# be increased, resulting in the PTO period being set to twice its
        //# current value.
        self.pto_backoff = self.pto_backoff.saturating_mul(2);
        true
    }

    pub fn pto_expiration(&self) -> Option<Timestamp> {
        self.pto_timer.expiration()
    }

    #[inline]
    pub fn pto_backoff(&self) -> u32 {
        self.pto_backoff
    }

    /// Full PTO period for close/drain timers (3·PTO)
    pub fn close_period(&self) -> Duration {
        self.rtt.pto_period(self.pto_backoff, PacketNumberSpace::ApplicationData) * 3
    }

    /// The packets of a discarded space leave the congestion window
    /// without being acked or lost
    pub fn on_space_discarded(&mut self, sent: &mut SentPackets) {
        for (_, info) in sent.drain() {
            if info.in_flight {
                self.congestion.on_packet_discarded(info.size as usize);
            }
        }
    }

    pub fn on_mtu_update(&mut self, mtu: u16) {
        self.congestion.on_mtu_update(mtu);
    }

    /// Migration resets congestion state for the new path
    pub fn on_path_reset(&mut self, mtu: u16) {
        self.congestion.on_path_reset(mtu);
        self.pacer.on_path_reset();
        self.rtt = self.rtt.for_new_path(
            quiver_quic_core::recovery::rtt_estimator::DEFAULT_INITIAL_RTT,
        );
        self.pto_backoff = 1;
    }

    #[inline]
    pub fn ack_settings(&self) -> ack::Settings {
        self.ack_settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_quic_core::recovery::NewReno;
    use smallvec::SmallVec;

    fn manager() -> Manager {
        Manager::new(Box::new(NewReno::new(1200)), ack::Settings::default())
    }

    fn space() -> PacketSpace {
        PacketSpace::new(PacketNumberSpace::ApplicationData, ack::Settings::default())
    }

    fn info(now: Timestamp) -> SentPacketInfo {
        SentPacketInfo {
            send_time: now,
            size: 1200,
            ack_eliciting: true,
            in_flight: true,
            content: SmallVec::new(),
        }
    }

    fn now(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn varint(value: u64) -> VarInt {
        VarInt::new(value).unwrap()
    }

    #[test]
    fn rtt_sample_from_largest_acked_test() {
        let mut manager = manager();
        let mut space = space();

        manager.on_packet_sent(&mut space, 0, info(now(0)), now(0));
        let outcome = manager.on_ack_received(
            &mut space,
            varint(0),
            Duration::ZERO,
            [varint(0)..=varint(0)].into_iter(),
            now(50),
        );

        assert_eq!(outcome.newly_acked.len(), 1);
        assert!(outcome.lost.is_empty());
        assert_eq!(manager.rtt().latest_rtt(), Duration::from_millis(50));
    }

    #[test]
    fn packet_threshold_loss_via_ack_test() {
        let mut manager = manager();
        let mut space = space();

        for pn in 0..5u64 {
            manager.on_packet_sent(&mut space, pn, info(now(pn)), now(pn));
        }

        let outcome = manager.on_ack_received(
            &mut space,
            varint(4),
            Duration::ZERO,
            [varint(4)..=varint(4)].into_iter(),
            now(100),
        );

        let lost: Vec<u64> = outcome.lost.iter().map(|(pn, _)| *pn).collect();
        assert_eq!(lost, vec![0, 1]);
        // the reorder window keeps 2 and 3; the loss timer is armed
        assert!(space.loss_timer.is_armed());
    }

    #[test]
    fn pto_backoff_doubles_test() {
        let mut manager = manager();
        let mut space = space();
        manager.on_packet_sent(&mut space, 0, info(now(0)), now(0));
        manager.arm_pto(&[&space]);

        let deadline = manager.pto_expiration().unwrap();
        assert!(manager.on_pto_timer(deadline));
        assert_eq!(manager.pto_backoff(), 2);
        assert_eq!(manager.probes_pending(), 2);
        assert!(manager.take_probe());
        assert!(manager.take_probe());
        assert!(!manager.take_probe());

        // an ack resets the backoff
        let _ = manager.on_ack_received(
            &mut space,
            varint(0),
            Duration::ZERO,
            [varint(0)..=varint(0)].into_iter(),
            now(400),
        );
        assert_eq!(manager.pto_backoff(), 1);
    }
}
