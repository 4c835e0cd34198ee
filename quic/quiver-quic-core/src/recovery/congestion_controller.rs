// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{recovery::RttEstimator, time::Timestamp};

/// A pluggable congestion controller
///
/// The send manager drives the controller with sent/acked/lost events;
/// the controller answers one question: how many more bytes may be put
/// in flight right now. Implementations with internal pacing or
/// bandwidth models (e.g. BBR) hook the same events.
pub trait CongestionController: 'static + Send {
    /// The current congestion window in bytes
    fn congestion_window(&self) -> u32;

    /// Bytes currently considered in flight
    fn bytes_in_flight(&self) -> u32;

    /// Whether `bytes` more may be sent within the window
    #[inline]
    fn can_send(&self, bytes: usize) -> bool {
        let available = self
            .congestion_window()
            .saturating_sub(self.bytes_in_flight());
        bytes <= available as usize
    }

    /// An in-flight packet of `bytes` was transmitted
    fn on_packet_sent(&mut self, time_sent: Timestamp, bytes: usize);

    /// `bytes` of in-flight data were newly acknowledged
    fn on_ack(&mut self, largest_sent_time: Timestamp, bytes: usize, rtt: &RttEstimator);

    /// `bytes` of in-flight data were declared lost; `persistent` is set
    /// when the loss period establishes persistent congestion. `now` is
    /// when the loss was detected, which bounds the recovery period.
    fn on_loss(&mut self, time_sent: Timestamp, bytes: usize, persistent: bool, now: Timestamp);

    /// A previously in-flight packet was discarded without being counted
    /// as acked or lost (e.g. its packet number space was dropped)
    fn on_packet_discarded(&mut self, bytes: usize);

    /// The path MTU changed; the controller may rescale its window
    fn on_mtu_update(&mut self, max_datagram_size: u16);

    /// The path changed and the controller must restart from its initial
    /// state
    fn on_path_reset(&mut self, max_datagram_size: u16);

    /// True while the controller is in slow start
    fn is_slow_start(&self) -> bool;
}
