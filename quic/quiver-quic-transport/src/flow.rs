// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection-level flow control, split into the two independent halves
//! the protocol actually has: what the peer lets us send, and what we
//! let the peer send.

use quiver_quic_core::{transport, varint::VarInt};

/// Enforces the peer's `max_data` on everything we send
#[derive(Debug)]
pub struct SendFlowController {
    peer_max_data: VarInt,
    bytes_sent: VarInt,
    /// The limit value for which a DATA_BLOCKED was already emitted, so
    /// each exhausted window is reported once
    blocked_reported_at: Option<VarInt>,
}

impl SendFlowController {
    pub fn new(peer_max_data: VarInt) -> Self {
        Self {
            peer_max_data,
            bytes_sent: VarInt::ZERO,
            blocked_reported_at: None,
        }
    }

    /// Bytes still available under the peer's advertisement
    #[inline]
    pub fn available(&self) -> u64 {
        self.peer_max_data.as_u64() - self.bytes_sent.as_u64()
    }

    #[inline]
    pub fn bytes_sent(&self) -> VarInt {
        self.bytes_sent
    }

    /// Consumes window for stream bytes about to be sent
    pub fn on_data_sent(&mut self, len: u64) {
        debug_assert!(len <= self.available(), "flow control window overrun");
        self.bytes_sent = self
            .bytes_sent
            .saturating_add(VarInt::new(len).unwrap_or(VarInt::MAX));
    }

    /// The peer raised its limit
    pub fn on_max_data(&mut self, maximum_data: VarInt) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.9
        //# A receiver MUST ignore any MAX_DATA frame that does not
        //# increase the connection's flow control window.
        if maximum_data > self.peer_max_data {
            self.peer_max_data = maximum_data;
        }
    }

    /// Returns the limit to report in a DATA_BLOCKED frame, at most once
    /// per exhausted window
    pub fn report_blocked(&mut self) -> Option<VarInt> {
        if self.available() > 0 {
            return None;
        }
        if self.blocked_reported_at == Some(self.peer_max_data) {
            return None;
        }
        self.blocked_reported_at = Some(self.peer_max_data);
        Some(self.peer_max_data)
    }
}

/// Enforces our advertised `max_data` on everything the peer sends
#[derive(Debug)]
pub struct RecvFlowController {
    advertised: VarInt,
    /// Sum of the highest received offsets across all streams
    bytes_received: VarInt,
    /// Window granted above the high-water mark on each update
    window: u64,
    /// A MAX_DATA with this value is waiting to be transmitted
    pending_update: Option<VarInt>,
}

impl RecvFlowController {
    pub fn new(initial_max_data: VarInt, window: u64) -> Self {
        Self {
            advertised: initial_max_data,
            bytes_received: VarInt::ZERO,
            window,
            pending_update: None,
        }
    }

    #[inline]
    pub fn advertised(&self) -> VarInt {
        self.advertised
    }

    /// Accounts for newly received stream data (growth of a stream's
    /// highest offset)
    pub fn on_data_received(&mut self, len: u64) -> Result<(), transport::Error> {
        let total = self
            .bytes_received
            .checked_add(VarInt::new(len).map_err(|_| {
                transport::Error::FLOW_CONTROL_ERROR.with_reason("offset out of range")
            })?)
            .ok_or_else(|| {
                transport::Error::FLOW_CONTROL_ERROR.with_reason("offset out of range")
            })?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A receiver MUST close the connection with an error of type
        //# FLOW_CONTROL_ERROR if the sender violates the advertised
        //# connection or stream data limits
        if total > self.advertised {
            return Err(transport::Error::FLOW_CONTROL_ERROR
                .with_reason("connection data limit exceeded"));
        }

        self.bytes_received = total;

        // re-advertise once half the window is consumed
        let remaining = self.advertised.as_u64() - self.bytes_received.as_u64();
        if remaining < self.window / 2 {
            let next = self
                .bytes_received
                .saturating_add(VarInt::new(self.window).unwrap_or(VarInt::MAX));
            if next > self.advertised {
                self.pending_update = Some(next);
            }
        }

        Ok(())
    }

    /// Takes the pending MAX_DATA value, marking it advertised
    pub fn take_update(&mut self) -> Option<VarInt> {
        let next = self.pending_update.take()?;
        self.advertised = next;
        Some(next)
    }

    #[inline]
    pub fn has_update(&self) -> bool {
        self.pending_update.is_some()
    }
}

/// Stream-count control for one direction, both halves
#[derive(Debug)]
pub struct StreamCountController {
    /// How many streams the peer lets us open
    peer_limit: VarInt,
    /// Locally opened streams
    opened: u64,
    blocked_reported_at: Option<VarInt>,

    /// How many streams we let the peer open
    advertised: VarInt,
    /// Streams the peer has opened
    peer_opened: u64,
    /// Streams the peer opened which have since been closed
    peer_closed: u64,
    window: u64,
    pending_update: Option<VarInt>,
}

impl StreamCountController {
    pub fn new(peer_limit: VarInt, local_limit: VarInt) -> Self {
        Self {
            peer_limit,
            opened: 0,
            blocked_reported_at: None,
            advertised: local_limit,
            peer_opened: 0,
            peer_closed: 0,
            window: local_limit.as_u64(),
            pending_update: None,
        }
    }

    /// Whether one more local stream may be opened
    pub fn can_open(&self) -> bool {
        self.opened < self.peer_limit.as_u64()
    }

    pub fn on_local_open(&mut self) {
        debug_assert!(self.can_open());
        self.opened += 1;
    }

    pub fn on_max_streams(&mut self, maximum_streams: VarInt) {
        if maximum_streams > self.peer_limit {
            self.peer_limit = maximum_streams;
        }
    }

    pub fn report_blocked(&mut self) -> Option<VarInt> {
        if self.can_open() {
            return None;
        }
        if self.blocked_reported_at == Some(self.peer_limit) {
            return None;
        }
        self.blocked_reported_at = Some(self.peer_limit);
        Some(self.peer_limit)
    }

    /// Validates a peer-opened stream count (ordinal + 1)
    pub fn on_remote_open(&mut self, count: u64) -> Result<(), transport::Error> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
        //# An endpoint that receives a frame with a stream ID exceeding
        //# the limit it has sent MUST treat this as a connection error of
        //# type STREAM_LIMIT_ERROR
        if count > self.advertised.as_u64() {
            return Err(transport::Error::STREAM_LIMIT_ERROR
                .with_reason("peer exceeded stream count limit"));
        }
        self.peer_opened = self.peer_opened.max(count);
        Ok(())
    }

    /// A peer-opened stream finished; replenish the window once half is
    /// used up
    pub fn on_remote_close(&mut self) {
        self.peer_closed += 1;
        let remaining = self.advertised.as_u64() - self.peer_opened;
        if remaining < self.window / 2 {
            let next = VarInt::new(self.peer_closed + self.window).unwrap_or(VarInt::MAX);
            if next > self.advertised {
                self.pending_update = Some(next);
            }
        }
    }

    pub fn take_update(&mut self) -> Option<VarInt> {
        let next = self.pending_update.take()?;
        self.advertised = next;
        Some(next)
    }

    #[inline]
    pub fn has_update(&self) -> bool {
        self.pending_update.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint(value: u64) -> VarInt {
        VarInt::new(value).unwrap()
    }

    #[test]
    fn send_window_enforcement_test() {
        let mut flow = SendFlowController::new(varint(100));
        assert_eq!(flow.available(), 100);

        flow.on_data_sent(60);
        assert_eq!(flow.available(), 40);
        assert!(flow.report_blocked().is_none());

        flow.on_data_sent(40);
        assert_eq!(flow.available(), 0);
        assert_eq!(flow.report_blocked(), Some(varint(100)));
        // only reported once per limit
        assert!(flow.report_blocked().is_none());

        flow.on_max_data(varint(200));
        assert_eq!(flow.available(), 100);
        // a stale MAX_DATA is ignored
        flow.on_max_data(varint(150));
        assert_eq!(flow.available(), 100);
    }

    #[test]
    fn recv_violation_test() {
        let mut flow = RecvFlowController::new(varint(100), 100);
        assert!(flow.on_data_received(100).is_ok());
        assert!(flow.on_data_received(1).is_err());
    }

    #[test]
    fn recv_window_update_test() {
        let mut flow = RecvFlowController::new(varint(100), 100);
        assert!(!flow.has_update());

        // crossing half the window queues an update
        flow.on_data_received(60).unwrap();
        assert!(flow.has_update());
        let next = flow.take_update().unwrap();
        assert_eq!(next, varint(160));
        assert_eq!(flow.advertised(), varint(160));
    }

    #[test]
    fn stream_count_test() {
        let mut counts = StreamCountController::new(varint(2), varint(2));
        assert!(counts.can_open());
        counts.on_local_open();
        counts.on_local_open();
        assert!(!counts.can_open());
        assert_eq!(counts.report_blocked(), Some(varint(2)));

        counts.on_max_streams(varint(3));
        assert!(counts.can_open());

        // peer side
        assert!(counts.on_remote_open(1).is_ok());
        assert!(counts.on_remote_open(2).is_ok());
        assert!(counts.on_remote_open(3).is_err());

        counts.on_remote_close();
        assert!(counts.has_update());
        assert_eq!(counts.take_update(), Some(varint(3)));
    }
}
