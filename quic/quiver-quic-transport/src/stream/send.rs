// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The sending half of a stream

use bytes::{Bytes, BytesMut};
use quiver_quic_core::{
    application,
    interval_set::IntervalSet,
    stream::{state, StreamId},
    transport,
    varint::VarInt,
};
use std::collections::VecDeque;

/// Buffered stream data between the lowest unacked offset and the
/// highest buffered offset
///
/// Chunks are kept as written; ranges handed to STREAM frames are
/// sliced out without copying when they fall inside one chunk.
#[derive(Debug, Default)]
struct SendBuffer {
    chunks: VecDeque<Bytes>,
    /// Stream offset of the first byte of `chunks[0]`
    start_offset: u64,
    /// Offset one past the last buffered byte
    end_offset: u64,
}

impl SendBuffer {
    fn push(&mut self, data: Bytes) {
        self.end_offset += data.len() as u64;
        self.chunks.push_back(data);
    }

    /// Copies out `[offset, offset+len)`, which must be buffered
    fn range(&self, offset: u64, len: usize) -> Bytes {
        debug_assert!(offset >= self.start_offset);
        debug_assert!(offset + len as u64 <= self.end_offset);

        let mut skip = (offset - self.start_offset) as usize;
        let mut chunks = self.chunks.iter();

        // find the chunk containing the start
        let mut chunk = loop {
            let chunk = chunks.next().expect("offset within buffer");
            if skip < chunk.len() {
                break chunk.slice(skip..);
            }
            skip -= chunk.len();
        };

        if chunk.len() >= len {
            return chunk.slice(..len);
        }

        // the range spans chunks; assemble a copy
        let mut out = BytesMut::with_capacity(len);
        let mut remaining = len;
        loop {
            let take = chunk.len().min(remaining);
            out.extend_from_slice(&chunk[..take]);
            remaining -= take;
            if remaining == 0 {
                return out.freeze();
            }
            chunk = chunks.next().expect("range within buffer").clone();
        }
    }

    /// Releases every byte below `offset`
    fn advance(&mut self, offset: u64) {
        while let Some(front) = self.chunks.front_mut() {
            let front_end = self.start_offset + front.len() as u64;
            if front_end <= offset {
                self.start_offset = front_end;
                self.chunks.pop_front();
            } else if offset > self.start_offset {
                let cut = (offset - self.start_offset) as usize;
                *front = front.slice(cut..);
                self.start_offset = offset;
                break;
            } else {
                break;
            }
        }
    }
}

/// A STREAM frame's worth of data picked by `try_send`
#[derive(Debug, PartialEq, Eq)]
pub struct StreamTransmission {
    pub offset: u64,
    pub data: Bytes,
    pub is_fin: bool,
    /// Retransmitted bytes were charged to the connection flow-control
    /// window when first sent
    pub is_retransmission: bool,
}

#[derive(Debug)]
pub struct SendStream {
    id: StreamId,
    state: state::Sender,
    buffer: SendBuffer,
    /// Next offset that has never been transmitted
    next_offset: u64,
    /// Absolute ranges acknowledged so far
    acked: IntervalSet<u64>,
    /// Absolute ranges declared lost, awaiting retransmission
    retransmit: IntervalSet<u64>,
    /// The peer's advertised per-stream limit
    max_stream_data: VarInt,
    blocked_reported_at: Option<VarInt>,
    /// Set once the application called `close`
    fin: bool,
    fin_acked: bool,
    /// Reset requested with this code; emitted as RESET_STREAM
    reset: Option<application::Error>,
    reset_needs_transmit: bool,
}

impl SendStream {
    pub fn new(id: StreamId, max_stream_data: VarInt) -> Self {
        Self {
            id,
            state: state::Sender::default(),
            buffer: SendBuffer::default(),
            next_offset: 0,
            acked: IntervalSet::new(),
            retransmit: IntervalSet::new(),
            max_stream_data,
            blocked_reported_at: None,
            fin: false,
            fin_acked: false,
            reset: None,
            reset_needs_transmit: false,
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> state::Sender {
        self.state
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The stream's final size, once fixed by `close` or `reset`
    #[inline]
    pub fn final_size(&self) -> Option<u64> {
        if self.fin {
            Some(self.buffer.end_offset)
        } else if self.reset.is_some() {
            Some(self.next_offset)
        } else {
            None
        }
    }

    /// Appends application data, bounded by the peer's stream window
    ///
    /// Returns how many bytes were accepted; zero means the window is
    /// exhausted and a STREAM_DATA_BLOCKED will be emitted.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, transport::Error> {
        if self.fin || self.reset.is_some() || self.state.is_terminal() {
            return Err(transport::Error::INTERNAL_ERROR.with_reason("send on finished stream"));
        }

        let window = self
            .max_stream_data
            .as_u64()
            .saturating_sub(self.buffer.end_offset);
        let accepted = (window as usize).min(data.len());
        if accepted > 0 {
            self.buffer
                .push(Bytes::copy_from_slice(&data[..accepted]));
        }
        Ok(accepted)
    }

    /// Marks the end of the stream; the next emitted frame carries FIN
    pub fn close(&mut self) {
        if self.reset.is_none() && !self.state.is_terminal() {
            self.fin = true;
        }
    }

    /// Abruptly terminates sending with an application error
    pub fn reset(&mut self, error: application::Error) -> bool {
        if self.state.is_terminal() || self.state.is_reset() {
            return false;
        }
        // final size freezes at what was transmitted
        let _ = self.state.on_queue_reset();
        self.reset = Some(error);
        self.reset_needs_transmit = true;
        self.retransmit.clear();
        true
    }

    /// The RESET_STREAM frame to emit, if one is queued
    pub fn take_reset_transmission(&mut self) -> Option<(VarInt, u64)> {
        if !self.reset_needs_transmit {
            return None;
        }
        self.reset_needs_transmit = false;
        let _ = self.state.on_send_reset();
        let error = self.reset.expect("reset code set");
        Some((error.as_varint(), self.next_offset))
    }

    pub fn on_reset_acked(&mut self) {
        let _ = self.state.on_recv_reset_ack();
    }

    /// Whether the stream has anything to put on the wire
    pub fn has_transmission_interest(&self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if self.reset_needs_transmit {
            return true;
        }
        if self.reset.is_some() {
            return false;
        }
        if !self.retransmit.is_empty() {
            return true;
        }
        let has_new_data = self.sendable_new_bytes() > 0;
        let fin_unsent =
            self.fin && !matches!(self.state, state::Sender::DataSent | state::Sender::DataRecvd);
        has_new_data || fin_unsent
    }

    /// New bytes which may be sent under the stream window
    fn sendable_new_bytes(&self) -> u64 {
        let limit = self.max_stream_data.as_u64().min(self.buffer.end_offset);
        limit.saturating_sub(self.next_offset)
    }

    /// Picks the next STREAM transmission: lost ranges first, then new
    /// data, bounded by `max_len` and the connection window
    pub fn try_send(
        &mut self,
        max_len: usize,
        connection_window: u64,
    ) -> Option<StreamTransmission> {
        if max_len == 0 || self.state.is_terminal() || self.reset.is_some() {
            return None;
        }

        // retransmissions do not consume connection flow control; the
        // bytes were already counted when first sent
        while let Some(range) = self.retransmit.pop_min() {
            // ranges below the released prefix were acked in the meantime
            let start = range.start.max(self.buffer.start_offset);
            if start > range.end {
                continue;
            }
            let available = (range.end - start + 1) as usize;
            let len = available.min(max_len);
            // put back whatever does not fit
            if len < available {
                self.retransmit.insert(start + len as u64..=range.end);
            }

            let data = self.buffer.range(start, len);
            let end = start + len as u64;
            let is_fin = self.fin && end == self.buffer.end_offset;
            if is_fin {
                let _ = self.state.on_send_fin();
            }
            return Some(StreamTransmission {
                offset: start,
                data,
                is_fin,
                is_retransmission: true,
            });
        }

        let sendable = self
            .sendable_new_bytes()
            .min(connection_window)
            .min(max_len as u64) as usize;

        let offset = self.next_offset;
        if sendable == 0 {
            // a bare FIN still needs a frame
            if self.fin
                && offset == self.buffer.end_offset
                && !matches!(self.state, state::Sender::DataSent)
            {
                let _ = self.state.on_send_fin();
                return Some(StreamTransmission {
                    offset,
                    data: Bytes::new(),
                    is_fin: true,
                    is_retransmission: false,
                });
            }
            return None;
        }

        let data = self.buffer.range(offset, sendable);
        self.next_offset += sendable as u64;
        let is_fin = self.fin && self.next_offset == self.buffer.end_offset;
        if is_fin {
            let _ = self.state.on_send_fin();
        } else {
            let _ = self.state.on_send_stream();
        }

        Some(StreamTransmission {
            offset,
            data,
            is_fin,
            is_retransmission: false,
        })
    }

    /// Acknowledges `[offset, offset+len)`; `fin_acked` marks the FIN
    /// carried by the acked frame
    pub fn on_data_acked(&mut self, offset: u64, len: u64, fin: bool) {
        if len > 0 {
            self.acked.insert(offset..=offset + len - 1);
        }
        if fin {
            self.fin_acked = true;
        }

        // release the contiguous acked prefix
        if let Some(min) = self.acked.min_value() {
            if min <= self.buffer.start_offset {
                let release_to = self
                    .acked
                    .inclusive_ranges()
                    .next()
                    .map(|range| range.end() + 1)
                    .unwrap_or(self.buffer.start_offset);
                self.buffer.advance(release_to.min(self.next_offset));
            }
        }

        if self.all_data_acked() && self.fin_acked {
            let _ = self.state.on_recv_all_acks();
        }
    }

    fn all_data_acked(&self) -> bool {
        if !self.fin || self.next_offset < self.buffer.end_offset {
            return false;
        }
        let end = self.buffer.end_offset;
        if end == 0 {
            return true;
        }
        // a single interval covering everything means no holes
        let mut ranges = self.acked.inclusive_ranges();
        match ranges.next() {
            Some(range) => *range.start() == 0 && *range.end() + 1 >= end && ranges.next().is_none(),
            None => false,
        }
    }

    /// The range `[offset, offset+len)` was declared lost
    ///
    /// Out-of-order acks may have superseded parts of the range; stale
    /// low ends are skipped at retransmission time instead.
    pub fn on_data_lost(&mut self, offset: u64, len: u64, fin: bool) {
        if self.state.is_terminal() || self.reset.is_some() {
            return;
        }
        if len > 0 {
            self.retransmit.insert(offset..=offset + len - 1);
        } else if fin && !self.fin_acked {
            // a bare FIN frame was lost; force a new FIN transmission
            if matches!(self.state, state::Sender::DataSent) {
                self.state = state::Sender::Send;
            }
        }
    }

    /// A packet carrying our RESET_STREAM was lost
    pub fn on_reset_lost(&mut self) {
        if self.reset.is_some() && !self.state.is_terminal() {
            self.reset_needs_transmit = true;
        }
    }

    pub fn on_max_stream_data(&mut self, maximum: VarInt) {
        if maximum > self.max_stream_data {
            self.max_stream_data = maximum;
        }
    }

    /// The limit to report in STREAM_DATA_BLOCKED, once per limit
    pub fn report_blocked(&mut self) -> Option<VarInt> {
        if self.reset.is_some() || self.fin || self.state.is_terminal() {
            return None;
        }
        if self.buffer.end_offset < self.max_stream_data.as_u64() {
            return None;
        }
        if self.blocked_reported_at == Some(self.max_stream_data) {
            return None;
        }
        self.blocked_reported_at = Some(self.max_stream_data);
        Some(self.max_stream_data)
    }

    /// A STOP_SENDING frame from the peer requests a reset
    pub fn on_stop_sending(&mut self, error: application::Error) -> bool {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-3.5
        //# An endpoint that receives a STOP_SENDING frame MUST send a
        //# RESET_STREAM frame if the stream is in the "Ready" or "Send"
        //# state.
        self.reset(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_quic_core::{endpoint, stream::StreamType};

    fn stream(limit: u64) -> SendStream {
        let id = quiver_quic_core::stream::id::StreamId::nth(
            endpoint::Type::Client,
            StreamType::Bidirectional,
            0,
        )
        .unwrap();
        SendStream::new(id, VarInt::new(limit).unwrap())
    }

    #[test]
    fn send_respects_stream_window_test() {
        let mut stream = stream(10);
        assert_eq!(stream.send(b"hello world").unwrap(), 10);
        // window exhausted
        assert_eq!(stream.send(b"more").unwrap(), 0);
        assert_eq!(stream.report_blocked(), Some(VarInt::new(10).unwrap()));
        assert!(stream.report_blocked().is_none());

        stream.on_max_stream_data(VarInt::new(20).unwrap());
        assert_eq!(stream.send(b"more").unwrap(), 4);
    }

    #[test]
    fn try_send_round_trip_test() {
        let mut stream = stream(100);
        stream.send(b"hello").unwrap();
        stream.close();

        let tx = stream.try_send(1000, 1000).unwrap();
        assert_eq!(tx.offset, 0);
        assert_eq!(&tx.data[..], b"hello");
        assert!(tx.is_fin);
        assert_eq!(stream.state(), state::Sender::DataSent);

        stream.on_data_acked(0, 5, true);
        assert_eq!(stream.state(), state::Sender::DataRecvd);
        assert!(stream.is_terminal());
    }

    #[test]
    fn try_send_respects_budget_test() {
        let mut stream = stream(100);
        stream.send(b"hello world").unwrap();

        let tx = stream.try_send(5, 1000).unwrap();
        assert_eq!(&tx.data[..], b"hello");
        assert!(!tx.is_fin);

        let tx = stream.try_send(1000, 1000).unwrap();
        assert_eq!(tx.offset, 5);
        assert_eq!(&tx.data[..], b" world");
    }

    #[test]
    fn connection_window_bounds_new_data_test() {
        let mut stream = stream(100);
        stream.send(b"hello").unwrap();
        assert!(stream.try_send(1000, 0).is_none());
        let tx = stream.try_send(1000, 3).unwrap();
        assert_eq!(&tx.data[..], b"hel");
    }

    #[test]
    fn lost_data_is_retransmitted_first_test() {
        let mut stream = stream(100);
        stream.send(b"abcdefgh").unwrap();

        let first = stream.try_send(4, 100).unwrap();
        assert_eq!(first.offset, 0);
        let _second = stream.try_send(4, 100).unwrap();

        stream.on_data_lost(0, 4, false);
        assert!(stream.has_transmission_interest());

        let retx = stream.try_send(100, 0).unwrap();
        assert_eq!(retx.offset, 0);
        assert_eq!(&retx.data[..], b"abcd");
    }

    #[test]
    fn reset_emits_final_size_test() {
        let mut stream = stream(100);
        stream.send(b"hello").unwrap();
        let _ = stream.try_send(3, 100).unwrap();

        assert!(stream.reset(application::Error::new(VarInt::new(9).unwrap())));
        let (code, final_size) = stream.take_reset_transmission().unwrap();
        assert_eq!(code, VarInt::new(9).unwrap());
        assert_eq!(final_size, 3);
        assert_eq!(stream.state(), state::Sender::ResetSent);

        stream.on_reset_acked();
        assert!(stream.is_terminal());
    }

    #[test]
    fn acked_offset_is_monotone_test() {
        let mut stream = stream(100);
        stream.send(b"abcdefgh").unwrap();
        stream.try_send(8, 100).unwrap();

        // out of order acks
        stream.on_data_acked(4, 4, false);
        assert_eq!(stream.buffer.start_offset, 0);
        stream.on_data_acked(0, 4, false);
        assert_eq!(stream.buffer.start_offset, 8);
    }
}
