// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The receiving half of a stream

use crate::event::{ReadCallback, StreamReadEvent};
use bytes::{Bytes, BytesMut};
use quiver_quic_core::{
    application,
    stream::{state, StreamId},
    transport,
    varint::VarInt,
};
use std::collections::BTreeMap;

/// The observable result of handling one inbound frame
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecvOutcome {
    /// Growth of the stream's highest received offset, which the
    /// connection-level controller accounts against `max_data`
    pub window_growth: u64,
    /// The stream reached a terminal receive state
    pub terminal: bool,
}

pub struct RecvStream {
    id: StreamId,
    state: state::Receiver,
    /// Out-of-order segments above `delivered`, keyed by offset
    ///
    /// Segments never overlap: inserts are trimmed against what is
    /// already buffered and delivered.
    segments: BTreeMap<u64, Bytes>,
    /// Everything below this offset has been handed to the application
    delivered: u64,
    highest_received: u64,
    final_size: Option<u64>,
    /// Our advertised per-stream limit
    advertised: VarInt,
    window: u64,
    pending_update: Option<VarInt>,
    /// STOP_SENDING queued for transmission with this code
    stop_sending: Option<application::Error>,
    stop_sending_needs_transmit: bool,
    callback: Option<ReadCallback>,
}

impl std::fmt::Debug for RecvStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvStream")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("segments", &self.segments)
            .field("delivered", &self.delivered)
            .field("highest_received", &self.highest_received)
            .field("final_size", &self.final_size)
            .field("advertised", &self.advertised)
            .field("window", &self.window)
            .field("pending_update", &self.pending_update)
            .field("stop_sending", &self.stop_sending)
            .field("stop_sending_needs_transmit", &self.stop_sending_needs_transmit)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl RecvStream {
    pub fn new(id: StreamId, initial_limit: VarInt) -> Self {
        Self {
            id,
            state: state::Receiver::default(),
            segments: BTreeMap::new(),
            delivered: 0,
            highest_received: 0,
            final_size: None,
            advertised: initial_limit,
            window: initial_limit.as_u64(),
            pending_update: None,
            stop_sending: None,
            stop_sending_needs_transmit: false,
            callback: None,
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> state::Receiver {
        self.state
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    #[inline]
    pub fn delivered_offset(&self) -> u64 {
        self.delivered
    }

    /// Installs the read callback and flushes anything already
    /// reassembled; returns `true` if that completed the stream
    pub fn set_read_callback(&mut self, callback: ReadCallback) -> bool {
        self.callback = Some(callback);
        let mut outcome = RecvOutcome::default();
        self.deliver(&mut outcome);
        outcome.terminal
    }

    /// Handles a STREAM frame for this stream
    pub fn on_stream_frame(
        &mut self,
        offset: u64,
        data: Bytes,
        is_fin: bool,
    ) -> Result<RecvOutcome, transport::Error> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| {
                transport::Error::FRAME_ENCODING_ERROR.with_reason("stream offset overflow")
            })?;

        self.validate_final_size(end, is_fin)?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A receiver MUST close the connection with an error of type
        //# FLOW_CONTROL_ERROR if the sender violates the advertised
        //# connection or stream data limits
        if end > self.advertised.as_u64() {
            return Err(
                transport::Error::FLOW_CONTROL_ERROR.with_reason("stream data limit exceeded")
            );
        }

        let mut outcome = RecvOutcome::default();
        if end > self.highest_received {
            outcome.window_growth = end - self.highest_received;
            self.highest_received = end;
        }

        if is_fin {
            self.final_size = Some(end);
            let _ = self.state.on_receive_fin();
        }

        // discarded modes: after reset, or the app asked us to stop
        if self.state.is_reset() || self.stop_sending.is_some() {
            return Ok(outcome);
        }

        self.insert_segment(offset, data);
        self.deliver(&mut outcome);

        Ok(outcome)
    }

    /// Handles RESET_STREAM
    pub fn on_reset(
        &mut self,
        final_size: u64,
        error: application::Error,
    ) -> Result<RecvOutcome, transport::Error> {
        self.validate_final_size(final_size, true)?;

        let mut outcome = RecvOutcome::default();
        if final_size > self.highest_received {
            outcome.window_growth = final_size - self.highest_received;
            self.highest_received = final_size;
        }

        self.final_size = Some(final_size);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-3.2
        //# An implementation MAY interrupt delivery of stream data, discard
        //# any data that was not consumed, and signal the receipt of the
        //# RESET_STREAM.
        if self.state.on_reset().is_ok() {
            self.segments.clear();
            if let Some(callback) = &mut self.callback {
                callback(StreamReadEvent::Reset(error));
            }
            let _ = self.state.on_app_read_reset();
            outcome.terminal = true;
        }

        Ok(outcome)
    }

    /// The application no longer wants this stream's data
    pub fn stop_sending(&mut self, error: application::Error) {
        if self.state.is_terminal() || self.state.is_reset() {
            return;
        }
        if self.stop_sending.is_none() {
            self.stop_sending = Some(error);
            self.stop_sending_needs_transmit = true;
            self.segments.clear();
        }
    }

    /// The STOP_SENDING frame to emit, if one is queued
    pub fn take_stop_sending_transmission(&mut self) -> Option<VarInt> {
        if !self.stop_sending_needs_transmit {
            return None;
        }
        self.stop_sending_needs_transmit = false;
        Some(self.stop_sending.expect("stop sending code").as_varint())
    }

    pub fn on_stop_sending_lost(&mut self) {
        if self.stop_sending.is_some() && !self.state.is_terminal() {
            self.stop_sending_needs_transmit = true;
        }
    }

    /// The MAX_STREAM_DATA value to advertise, if an update is due
    pub fn take_update(&mut self) -> Option<VarInt> {
        let next = self.pending_update.take()?;
        self.advertised = next;
        Some(next)
    }

    #[inline]
    pub fn has_update(&self) -> bool {
        self.pending_update.is_some()
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-4.5
    //# Once a final size for a stream is known, it cannot change.  If a
    //# RESET_STREAM or STREAM frame is received indicating a change in the
    //# final size for the stream, an endpoint SHOULD respond with an error
    //# of type FINAL_SIZE_ERROR
    fn validate_final_size(&self, end: u64, is_fin: bool) -> Result<(), transport::Error> {
        match self.final_size {
            Some(final_size) => {
                let conflicting = if is_fin { end != final_size } else { end > final_size };
                if conflicting {
                    return Err(
                        transport::Error::FINAL_SIZE_ERROR.with_reason("final size changed")
                    );
                }
            }
            None => {
                if is_fin && end < self.highest_received {
                    return Err(transport::Error::FINAL_SIZE_ERROR
                        .with_reason("final size below received data"));
                }
            }
        }
        Ok(())
    }

    /// Inserts a segment, trimming against delivered data and existing
    /// segments
    fn insert_segment(&mut self, mut offset: u64, mut data: Bytes) {
        // trim the already-delivered prefix
        if offset < self.delivered {
            let skip = (self.delivered - offset).min(data.len() as u64) as usize;
            data = data.slice(skip..);
            offset += skip as u64;
        }
        if data.is_empty() {
            return;
        }

        // trim against the previous segment
        if let Some((prev_offset, prev_data)) = self.segments.range(..=offset).next_back() {
            let prev_end = prev_offset + prev_data.len() as u64;
            if prev_end > offset {
                let skip = (prev_end - offset).min(data.len() as u64) as usize;
                data = data.slice(skip..);
                offset += skip as u64;
            }
        }
        if data.is_empty() {
            return;
        }

        // weave the remainder around existing segments so nothing new
        // is dropped and nothing is stored twice
        while !data.is_empty() {
            let following = self
                .segments
                .range(offset..)
                .next()
                .map(|(next_offset, next_data)| (*next_offset, next_data.len() as u64));

            match following {
                Some((next_offset, next_len)) if next_offset < offset + data.len() as u64 => {
                    if next_offset > offset {
                        let piece = data.slice(..(next_offset - offset) as usize);
                        self.segments.insert(offset, piece);
                    }
                    let covered_to = next_offset + next_len;
                    let skip = covered_to.saturating_sub(offset).min(data.len() as u64) as usize;
                    data = data.slice(skip..);
                    offset = covered_to;
                }
                _ => {
                    self.segments.insert(offset, data);
                    break;
                }
            }
        }
    }

    /// Hands the newly contiguous prefix to the application in one event
    ///
    /// Without a callback installed, data stays buffered; nothing is
    /// ever dropped on the floor.
    fn deliver(&mut self, outcome: &mut RecvOutcome) {
        if self.callback.is_none() {
            return;
        }

        let mut run: Option<BytesMut> = None;
        let mut single: Option<Bytes> = None;

        while let Some(entry) = self.segments.first_entry() {
            if *entry.key() != self.delivered {
                break;
            }
            let data = entry.remove();
            self.delivered += data.len() as u64;
            match (&mut run, single.take()) {
                (None, None) => single = Some(data),
                (None, Some(first)) => {
                    let mut joined = BytesMut::with_capacity(first.len() + data.len());
                    joined.extend_from_slice(&first);
                    joined.extend_from_slice(&data);
                    run = Some(joined);
                }
                (Some(joined), _) => joined.extend_from_slice(&data),
            }
        }

        let data = match (run, single) {
            (Some(joined), _) => joined.freeze(),
            (None, Some(single)) => single,
            (None, None) => Bytes::new(),
        };

        let all_received = self.final_size == Some(self.delivered);
        if all_received {
            let _ = self.state.on_receive_all_data();
        }

        if data.is_empty() && !all_received {
            return;
        }

        let offset = self.delivered - data.len() as u64;
        if let Some(callback) = &mut self.callback {
            callback(StreamReadEvent::Data {
                offset,
                data,
                is_fin: all_received,
            });
        }

        if all_received {
            let _ = self.state.on_app_read_all_data();
            outcome.terminal = true;
            return;
        }

        // consuming data opens stream window
        let remaining = self.advertised.as_u64() - self.delivered;
        if remaining < self.window / 2 {
            let next = VarInt::new(self.delivered + self.window).unwrap_or(VarInt::MAX);
            if next > self.advertised {
                self.pending_update = Some(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_quic_core::{endpoint, stream::StreamType};
    use std::sync::{Arc, Mutex};

    fn stream(limit: u64) -> RecvStream {
        let id = quiver_quic_core::stream::id::StreamId::nth(
            endpoint::Type::Client,
            StreamType::Bidirectional,
            0,
        )
        .unwrap();
        RecvStream::new(id, VarInt::new(limit).unwrap())
    }

    fn capture(stream: &mut RecvStream) -> Arc<Mutex<Vec<StreamReadEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        stream.set_read_callback(Box::new(move |event| {
            sink.lock().unwrap().push(event);
        }));
        events
    }

    #[test]
    fn out_of_order_delivery_test() {
        let mut stream = stream(1000);
        let events = capture(&mut stream);

        // B then C then A; exactly one delivery with all 23 bytes
        stream
            .on_stream_frame(10, Bytes::from_static(b"BBBBBBBBBB"), false)
            .unwrap();
        stream
            .on_stream_frame(20, Bytes::from_static(b"CCC"), false)
            .unwrap();
        assert!(events.lock().unwrap().is_empty());

        stream
            .on_stream_frame(0, Bytes::from_static(b"AAAAAAAAAA"), false)
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamReadEvent::Data {
                offset,
                data,
                is_fin,
            } => {
                assert_eq!(*offset, 0);
                assert_eq!(&data[..], b"AAAAAAAAAABBBBBBBBBBCCC");
                assert!(!is_fin);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn duplicate_data_is_not_redelivered_test() {
        let mut stream = stream(1000);
        let events = capture(&mut stream);

        stream
            .on_stream_frame(0, Bytes::from_static(b"hello"), false)
            .unwrap();
        // identical retransmission
        let outcome = stream
            .on_stream_frame(0, Bytes::from_static(b"hello"), false)
            .unwrap();
        assert_eq!(outcome.window_growth, 0);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn stream_flow_violation_test() {
        let mut stream = stream(100);
        let err = stream
            .on_stream_frame(0, Bytes::from(vec![0u8; 200]), false)
            .unwrap_err();
        assert_eq!(err.code, transport::error::Code::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn final_size_mismatch_test() {
        let mut stream = stream(1000);
        stream
            .on_stream_frame(0, Bytes::from(vec![1u8; 50]), true)
            .unwrap();

        let err = stream
            .on_stream_frame(0, Bytes::from(vec![1u8; 100]), true)
            .unwrap_err();
        assert_eq!(err.code, transport::error::Code::FINAL_SIZE_ERROR);
    }

    #[test]
    fn reset_final_size_mismatch_test() {
        let mut stream = stream(1000);
        stream
            .on_stream_frame(0, Bytes::from(vec![1u8; 50]), true)
            .unwrap();
        let err = stream
            .on_reset(60, application::Error::default())
            .unwrap_err();
        assert_eq!(err.code, transport::error::Code::FINAL_SIZE_ERROR);
    }

    #[test]
    fn fin_delivery_test() {
        let mut stream = stream(1000);
        let events = capture(&mut stream);

        stream
            .on_stream_frame(0, Bytes::from_static(b"done"), true)
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamReadEvent::Data { is_fin: true, .. }
        ));
        assert!(stream.is_terminal());
    }

    #[test]
    fn reset_reported_once_test() {
        let mut stream = stream(1000);
        let events = capture(&mut stream);

        let code = application::Error::new(VarInt::new(7).unwrap());
        let outcome = stream.on_reset(10, code).unwrap();
        assert!(outcome.terminal);

        // duplicate reset is ignored
        let outcome = stream.on_reset(10, code).unwrap();
        assert!(!outcome.terminal);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], StreamReadEvent::Reset(code));
    }

    #[test]
    fn window_update_after_delivery_test() {
        let mut stream = stream(100);
        capture(&mut stream);

        stream
            .on_stream_frame(0, Bytes::from(vec![0u8; 60]), false)
            .unwrap();
        assert!(stream.has_update());
        let next = stream.take_update().unwrap();
        assert_eq!(next.as_u64(), 160);
    }
}
