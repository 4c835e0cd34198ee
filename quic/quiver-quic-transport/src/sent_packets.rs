// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-space record of in-flight packets

use crate::PendingFrame;
use quiver_quic_core::{stream::StreamId, time::Timestamp, varint::VarInt};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// What a sent packet carried, for ack fan-out and loss requeueing
#[derive(Clone, Debug)]
pub enum SentContent {
    /// Stream data: on ack, advance the stream; on loss, mark the range
    /// for retransmission
    Stream {
        id: StreamId,
        offset: u64,
        len: u64,
        is_fin: bool,
    },
    /// CRYPTO data at this packet's level
    Crypto { offset: u64, len: u64 },
    /// An ACK frame acknowledging up to `largest`; on ack-of-ack the
    /// tracker prunes its ranges
    Ack { largest: VarInt },
    /// A RESET_STREAM; terminal ack transitions ResetSent → ResetRecvd
    ResetStream { id: StreamId },
    /// A control frame retransmitted verbatim when lost
    Frame(PendingFrame),
    /// A PATH_CHALLENGE probe (never retransmitted by the loss path;
    /// the path manager has its own retry schedule)
    PathChallenge,
    /// An MTU probe of the recorded size
    MtuProbe { size: u16 },
}

#[derive(Debug)]
pub struct SentPacketInfo {
    pub send_time: Timestamp,
    pub size: u16,
    pub ack_eliciting: bool,
    /// Counted against the congestion window
    pub in_flight: bool,
    pub content: SmallVec<[SentContent; 3]>,
}

/// Ordered map of unacknowledged sent packets in one space
#[derive(Debug, Default)]
pub struct SentPackets {
    packets: BTreeMap<u64, SentPacketInfo>,
    /// Largest packet number acknowledged by the peer in this space
    largest_acked: Option<u64>,
    bytes_in_flight: usize,
}

impl SentPackets {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn largest_acked(&self) -> Option<u64> {
        self.largest_acked
    }

    #[inline]
    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    /// Whether any ack-eliciting packet is outstanding
    pub fn has_ack_eliciting_in_flight(&self) -> bool {
        self.packets.values().any(|info| info.ack_eliciting)
    }

    /// The send time of the oldest outstanding ack-eliciting packet
    pub fn earliest_ack_eliciting_sent(&self) -> Option<Timestamp> {
        self.packets
            .values()
            .filter(|info| info.ack_eliciting)
            .map(|info| info.send_time)
            .min()
    }

    pub fn on_packet_sent(&mut self, packet_number: u64, info: SentPacketInfo) {
        if info.in_flight {
            self.bytes_in_flight += info.size as usize;
        }
        let prior = self.packets.insert(packet_number, info);
        debug_assert!(prior.is_none(), "packet number reused");
    }

    /// The tracked packet numbers within an acknowledged range
    ///
    /// ACK ranges can name arbitrarily many packet numbers; walking only
    /// what we actually track keeps processing proportional to our own
    /// state.
    pub fn tracked_in(&self, range: core::ops::RangeInclusive<u64>) -> Vec<u64> {
        self.packets.range(range).map(|(pn, _)| *pn).collect()
    }

    /// Removes a newly acknowledged packet, if it is still tracked
    pub fn on_packet_acked(&mut self, packet_number: u64) -> Option<SentPacketInfo> {
        let info = self.packets.remove(&packet_number)?;
        if info.in_flight {
            self.bytes_in_flight -= info.size as usize;
        }
        if self.largest_acked.map_or(true, |largest| packet_number > largest) {
            self.largest_acked = Some(packet_number);
        }
        Some(info)
    }

    /// Detects lost packets by packet threshold and time threshold
    ///
    /// A packet is lost once `kPacketThreshold` newer packets were
    /// acknowledged, or its age exceeds the time threshold. Returns the
    /// removed packets; the caller requeues their content.
    pub fn detect_lost(
        &mut self,
        now: Timestamp,
        loss_time_threshold: core::time::Duration,
        packet_threshold: u64,
    ) -> (Vec<(u64, SentPacketInfo)>, Option<Timestamp>) {
        let Some(largest_acked) = self.largest_acked else {
            return (Vec::new(), None);
        };

        let mut lost = Vec::new();
        let mut next_loss_time: Option<Timestamp> = None;

        let candidates: Vec<u64> = self
            .packets
            .range(..=largest_acked)
            .map(|(pn, _)| *pn)
            .collect();

        for packet_number in candidates {
            let info = &self.packets[&packet_number];

            let by_packet_threshold =
                largest_acked.saturating_sub(packet_number) >= packet_threshold;
            let lost_deadline = info.send_time + loss_time_threshold;
            let by_time_threshold = lost_deadline.has_elapsed(now);

            if by_packet_threshold || by_time_threshold {
                let info = self.packets.remove(&packet_number).expect("tracked packet");
                if info.in_flight {
                    self.bytes_in_flight -= info.size as usize;
                }
                lost.push((packet_number, info));
            } else {
                // still in the reorder window; revisit when its time
                // threshold passes
                next_loss_time = Some(match next_loss_time {
                    Some(existing) => existing.min(lost_deadline),
                    None => lost_deadline,
                });
            }
        }

        (lost, next_loss_time)
    }

    /// Drains every tracked packet, e.g. when the space's keys are
    /// discarded
    pub fn drain(&mut self) -> Vec<(u64, SentPacketInfo)> {
        self.bytes_in_flight = 0;
        core::mem::take(&mut self.packets).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    fn info(send_time: Timestamp, size: u16) -> SentPacketInfo {
        SentPacketInfo {
            send_time,
            size,
            ack_eliciting: true,
            in_flight: true,
            content: SmallVec::new(),
        }
    }

    #[test]
    fn bytes_in_flight_accounting_test() {
        let mut sent = SentPackets::new();
        let now = Timestamp::from_millis(1);
        sent.on_packet_sent(0, info(now, 1200));
        sent.on_packet_sent(1, info(now, 800));
        assert_eq!(sent.bytes_in_flight(), 2000);

        sent.on_packet_acked(0).unwrap();
        assert_eq!(sent.bytes_in_flight(), 800);
        assert!(sent.on_packet_acked(0).is_none());
    }

    #[test]
    fn packet_threshold_loss_test() {
        let mut sent = SentPackets::new();
        let now = Timestamp::from_millis(1);
        for pn in 0..5u64 {
            sent.on_packet_sent(pn, info(now, 100));
        }
        // acking 4 puts 0 and 1 past the packet threshold of 3
        sent.on_packet_acked(4).unwrap();

        let (lost, _) = sent.detect_lost(now, Duration::from_secs(10), 3);
        let lost_pns: Vec<u64> = lost.iter().map(|(pn, _)| *pn).collect();
        assert_eq!(lost_pns, vec![0, 1]);
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn time_threshold_loss_test() {
        let mut sent = SentPackets::new();
        let start = Timestamp::from_millis(1);
        sent.on_packet_sent(0, info(start, 100));
        sent.on_packet_sent(1, info(start + Duration::from_millis(50), 100));
        sent.on_packet_acked(1).unwrap();

        // packet 0 is within the reorder window at +50ms
        let (lost, next) = sent.detect_lost(
            start + Duration::from_millis(50),
            Duration::from_millis(90),
            3,
        );
        assert!(lost.is_empty());
        assert_eq!(next, Some(start + Duration::from_millis(90)));

        // and lost once 9/8 rtt has elapsed
        let (lost, next) = sent.detect_lost(
            start + Duration::from_millis(91),
            Duration::from_millis(90),
            3,
        );
        assert_eq!(lost.len(), 1);
        assert!(next.is_none());
    }

    #[test]
    fn packets_above_largest_acked_are_not_lost_test() {
        let mut sent = SentPackets::new();
        let now = Timestamp::from_millis(1);
        for pn in 0..10u64 {
            sent.on_packet_sent(pn, info(now, 100));
        }
        sent.on_packet_acked(2).unwrap();

        let (lost, _) = sent.detect_lost(now + Duration::from_secs(1), Duration::from_millis(1), 3);
        // only packets below the largest acked are candidates
        assert!(lost.iter().all(|(pn, _)| *pn < 2));
    }
}
