// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Application streams and their manager

pub mod crypto;
pub mod recv;
pub mod send;

pub use crypto::CryptoStream;
pub use recv::RecvStream;
pub use send::SendStream;

use crate::{
    event::{ConnectionEventSink, ReadCallback},
    flow::StreamCountController,
    PendingFrame,
};
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use quiver_quic_core::{
    application, endpoint,
    frame::{self, MaxStreamData, ResetStream, StopSending, StreamDataBlocked, StreamsBlocked},
    stream::{id::StreamIdGenerator, StreamId, StreamType},
    transport,
    varint::VarInt,
};
use std::collections::VecDeque;

/// Per-stream initial windows, resolved from both endpoints' transport
/// parameters
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamLimits {
    /// Recv window for streams we initiate (bidi)
    pub local_bidi_recv: VarInt,
    /// Recv window for streams the peer initiates (bidi)
    pub remote_bidi_recv: VarInt,
    /// Recv window for peer-initiated uni streams
    pub uni_recv: VarInt,
    /// Send window on streams we initiate (bidi), from the peer
    pub local_bidi_send: VarInt,
    /// Send window on streams the peer initiates (bidi), from the peer
    pub remote_bidi_send: VarInt,
    /// Send window on our uni streams, from the peer
    pub uni_send: VarInt,
}

#[derive(Debug, Default)]
struct StreamEntry {
    send: Option<SendStream>,
    recv: Option<RecvStream>,
}

impl StreamEntry {
    fn is_terminal(&self) -> bool {
        self.send.as_ref().map_or(true, SendStream::is_terminal)
            && self.recv.as_ref().map_or(true, RecvStream::is_terminal)
    }
}

/// Owns every application stream and the send-ready queue
///
/// Streams hold no reference back to the connection; readiness is
/// expressed by membership in the active set and drained round-robin.
pub struct StreamManager {
    local_endpoint: endpoint::Type,
    streams: HashMap<StreamId, StreamEntry>,
    /// FIFO of streams with data to send; the set prevents duplicates
    active_queue: VecDeque<StreamId>,
    active_members: HashSet<StreamId>,
    bidi_ids: StreamIdGenerator,
    uni_ids: StreamIdGenerator,
    bidi_counts: StreamCountController,
    uni_counts: StreamCountController,
    /// Highest remote ordinal seen per stream type, for late-frame
    /// tolerance after streams close
    remote_bidi_opened: u64,
    remote_uni_opened: u64,
    limits: StreamLimits,
}

impl StreamManager {
    pub fn new(
        local_endpoint: endpoint::Type,
        limits: StreamLimits,
        bidi_counts: StreamCountController,
        uni_counts: StreamCountController,
    ) -> Self {
        Self {
            local_endpoint,
            streams: HashMap::new(),
            active_queue: VecDeque::new(),
            active_members: HashSet::new(),
            bidi_ids: StreamIdGenerator::new(local_endpoint, StreamType::Bidirectional),
            uni_ids: StreamIdGenerator::new(local_endpoint, StreamType::Unidirectional),
            bidi_counts,
            uni_counts,
            remote_bidi_opened: 0,
            remote_uni_opened: 0,
            limits,
        }
    }

    /// Applies the peer's transport parameters to send windows and
    /// stream-count limits
    pub fn on_peer_limits(
        &mut self,
        local_bidi_send: VarInt,
        remote_bidi_send: VarInt,
        uni_send: VarInt,
        max_streams_bidi: VarInt,
        max_streams_uni: VarInt,
    ) {
        self.limits.local_bidi_send = local_bidi_send;
        self.limits.remote_bidi_send = remote_bidi_send;
        self.limits.uni_send = uni_send;
        self.bidi_counts.on_max_streams(max_streams_bidi);
        self.uni_counts.on_max_streams(max_streams_uni);

        // streams opened before the parameters arrived (0-RTT) pick up
        // the new windows
        for entry in self.streams.values_mut() {
            if let Some(send) = &mut entry.send {
                let limit = match (send.id().stream_type(), send.id().initiator()) {
                    (StreamType::Bidirectional, initiator) if initiator == self.local_endpoint => {
                        local_bidi_send
                    }
                    (StreamType::Bidirectional, _) => remote_bidi_send,
                    (StreamType::Unidirectional, _) => uni_send,
                };
                send.on_max_stream_data(limit);
            }
        }
    }

    /// Opens a locally-initiated stream
    pub fn open(&mut self, stream_type: StreamType) -> Result<StreamId, transport::Error> {
        let counts = match stream_type {
            StreamType::Bidirectional => &mut self.bidi_counts,
            StreamType::Unidirectional => &mut self.uni_counts,
        };
        if !counts.can_open() {
            return Err(
                transport::Error::STREAM_LIMIT_ERROR.with_reason("peer stream limit reached")
            );
        }

        let ids = match stream_type {
            StreamType::Bidirectional => &mut self.bidi_ids,
            StreamType::Unidirectional => &mut self.uni_ids,
        };
        let id = ids
            .next_id()
            .ok_or_else(|| transport::Error::INTERNAL_ERROR.with_reason("stream ids exhausted"))?;
        counts.on_local_open();

        let send_limit = match stream_type {
            StreamType::Bidirectional => self.limits.local_bidi_send,
            StreamType::Unidirectional => self.limits.uni_send,
        };
        let mut entry = StreamEntry {
            send: Some(SendStream::new(id, send_limit)),
            recv: None,
        };
        if stream_type.is_bidirectional() {
            entry.recv = Some(RecvStream::new(id, self.limits.local_bidi_recv));
        }
        self.streams.insert(id, entry);
        Ok(id)
    }

    /// Looks up a stream for an inbound frame, creating peer-initiated
    /// streams on first reference
    ///
    /// Returns `None` for frames on streams that already finished; such
    /// frames are late retransmissions and are ignored.
    fn entry_for_frame(
        &mut self,
        id: StreamId,
        needs_recv_half: bool,
        events: &mut dyn ConnectionEventSink,
    ) -> Result<Option<&mut StreamEntry>, transport::Error> {
        let local = id.initiator() == self.local_endpoint;

        if needs_recv_half && !id.is_receivable(self.local_endpoint) {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
            //# An endpoint that receives a frame for a send-only stream
            //# MUST terminate the connection with error STREAM_STATE_ERROR.
            return Err(
                transport::Error::STREAM_STATE_ERROR.with_reason("frame on send-only stream")
            );
        }

        if self.streams.contains_key(&id) {
            return Ok(self.streams.get_mut(&id));
        }

        if local {
            // we never created it, or it already finished
            let created = match id.stream_type() {
                StreamType::Bidirectional => self.bidi_ids.opened(),
                StreamType::Unidirectional => self.uni_ids.opened(),
            };
            if id.ordinal() < created {
                return Ok(None);
            }
            return Err(
                transport::Error::STREAM_STATE_ERROR.with_reason("frame on unopened local stream")
            );
        }

        // peer-initiated stream: first reference creates it, along with
        // every lower-numbered stream of its type it implicitly opens
        let count = id.ordinal() + 1;
        let already_opened = match id.stream_type() {
            StreamType::Bidirectional => self.remote_bidi_opened,
            StreamType::Unidirectional => self.remote_uni_opened,
        };

        if count <= already_opened {
            // a lower-numbered stream that no longer exists
            return Ok(None);
        }

        match id.stream_type() {
            StreamType::Bidirectional => {
                self.bidi_counts.on_remote_open(count)?;
                self.remote_bidi_opened = count;
            }
            StreamType::Unidirectional => {
                self.uni_counts.on_remote_open(count)?;
                self.remote_uni_opened = count;
            }
        }

        let peer = self.local_endpoint.peer_type();
        let (recv_limit, send_limit) = match id.stream_type() {
            StreamType::Bidirectional => {
                (self.limits.remote_bidi_recv, Some(self.limits.remote_bidi_send))
            }
            StreamType::Unidirectional => (self.limits.uni_recv, None),
        };

        for ordinal in already_opened..count {
            let opened_id = StreamId::nth(peer, id.stream_type(), ordinal)
                .expect("ordinal below validated count");
            let entry = StreamEntry {
                recv: Some(RecvStream::new(opened_id, recv_limit)),
                send: send_limit.map(|limit| SendStream::new(opened_id, limit)),
            };
            self.streams.insert(opened_id, entry);
            events.on_stream_opened(opened_id);
        }

        Ok(self.streams.get_mut(&id))
    }

    /// Dispatches a STREAM frame; returns connection-window growth
    pub fn on_stream_frame(
        &mut self,
        id: StreamId,
        offset: u64,
        data: Bytes,
        is_fin: bool,
        events: &mut dyn ConnectionEventSink,
    ) -> Result<u64, transport::Error> {
        let Some(entry) = self.entry_for_frame(id, true, events)? else {
            return Ok(0);
        };
        let recv = entry.recv.as_mut().expect("receivable stream");
        let outcome = recv.on_stream_frame(offset, data, is_fin)?;
        self.cleanup(id);
        Ok(outcome.window_growth)
    }

    pub fn on_reset_stream(
        &mut self,
        frame: &ResetStream,
        events: &mut dyn ConnectionEventSink,
    ) -> Result<u64, transport::Error> {
        let id = StreamId::from_varint(frame.stream_id);
        let Some(entry) = self.entry_for_frame(id, true, events)? else {
            return Ok(0);
        };
        let recv = entry.recv.as_mut().expect("receivable stream");
        let error = application::Error::new(frame.application_error_code);
        let outcome = recv.on_reset(frame.final_size.as_u64(), error)?;
        if outcome.terminal {
            events.on_stream_reset(id, error);
        }
        self.cleanup(id);
        Ok(outcome.window_growth)
    }

    pub fn on_stop_sending(
        &mut self,
        frame: &StopSending,
        events: &mut dyn ConnectionEventSink,
    ) -> Result<(), transport::Error> {
        let id = StreamId::from_varint(frame.stream_id);

        if !id.is_sendable(self.local_endpoint) {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.5
            //# An endpoint that receives a STOP_SENDING frame for a
            //# receive-only stream MUST terminate the connection with error
            //# STREAM_STATE_ERROR.
            return Err(
                transport::Error::STREAM_STATE_ERROR.with_reason("stop sending on recv-only stream")
            );
        }

        let Some(entry) = self.entry_for_frame(id, false, events)? else {
            return Ok(());
        };
        if let Some(send) = entry.send.as_mut() {
            if send.on_stop_sending(application::Error::new(frame.application_error_code)) {
                self.notify_active(id);
            }
        }
        Ok(())
    }

    pub fn on_max_stream_data(
        &mut self,
        frame: &MaxStreamData,
        events: &mut dyn ConnectionEventSink,
    ) -> Result<(), transport::Error> {
        let id = StreamId::from_varint(frame.stream_id);
        if !id.is_sendable(self.local_endpoint) {
            return Err(transport::Error::STREAM_STATE_ERROR
                .with_reason("max stream data on recv-only stream"));
        }
        let Some(entry) = self.entry_for_frame(id, false, events)? else {
            return Ok(());
        };
        if let Some(send) = entry.send.as_mut() {
            send.on_max_stream_data(frame.maximum_stream_data);
            if send.has_transmission_interest() {
                self.notify_active(id);
            }
        }
        Ok(())
    }

    pub fn on_max_streams(&mut self, frame: &frame::MaxStreams) {
        match frame.stream_type {
            StreamType::Bidirectional => self.bidi_counts.on_max_streams(frame.maximum_streams),
            StreamType::Unidirectional => self.uni_counts.on_max_streams(frame.maximum_streams),
        }
    }

    // application surface

    pub fn send(&mut self, id: StreamId, data: &[u8]) -> Result<usize, transport::Error> {
        let send = self.send_half(id)?;
        let written = send.send(data)?;
        if send.has_transmission_interest() {
            self.notify_active(id);
        }
        Ok(written)
    }

    pub fn close_stream(&mut self, id: StreamId) -> Result<(), transport::Error> {
        let send = self.send_half(id)?;
        send.close();
        if send.has_transmission_interest() {
            self.notify_active(id);
        }
        Ok(())
    }

    pub fn reset_stream(
        &mut self,
        id: StreamId,
        error: application::Error,
    ) -> Result<(), transport::Error> {
        let send = self.send_half(id)?;
        if send.reset(error) {
            self.notify_active(id);
        }
        Ok(())
    }

    pub fn stop_sending(
        &mut self,
        id: StreamId,
        error: application::Error,
    ) -> Result<(), transport::Error> {
        let entry = self
            .streams
            .get_mut(&id)
            .ok_or_else(|| transport::Error::INTERNAL_ERROR.with_reason("unknown stream"))?;
        let recv = entry
            .recv
            .as_mut()
            .ok_or_else(|| transport::Error::INTERNAL_ERROR.with_reason("send-only stream"))?;
        recv.stop_sending(error);
        self.notify_active(id);
        Ok(())
    }

    pub fn set_read_callback(
        &mut self,
        id: StreamId,
        callback: ReadCallback,
    ) -> Result<(), transport::Error> {
        let entry = self
            .streams
            .get_mut(&id)
            .ok_or_else(|| transport::Error::INTERNAL_ERROR.with_reason("unknown stream"))?;
        let recv = entry
            .recv
            .as_mut()
            .ok_or_else(|| transport::Error::INTERNAL_ERROR.with_reason("send-only stream"))?;
        if recv.set_read_callback(callback) {
            self.cleanup(id);
        }
        Ok(())
    }

    fn send_half(&mut self, id: StreamId) -> Result<&mut SendStream, transport::Error> {
        self.streams
            .get_mut(&id)
            .and_then(|entry| entry.send.as_mut())
            .ok_or_else(|| transport::Error::INTERNAL_ERROR.with_reason("unknown send stream"))
    }

    // transmission support

    /// Adds a stream to the send-ready queue (idempotent)
    pub fn notify_active(&mut self, id: StreamId) {
        if self.active_members.insert(id) {
            self.active_queue.push_back(id);
        }
    }

    /// Pops the next send-ready stream
    pub fn pop_active(&mut self) -> Option<StreamId> {
        let id = self.active_queue.pop_front()?;
        self.active_members.remove(&id);
        Some(id)
    }

    pub fn has_active(&self) -> bool {
        !self.active_queue.is_empty()
    }

    /// Streams currently in the send-ready queue
    pub fn active_len(&self) -> usize {
        self.active_queue.len()
    }

    /// Asks a stream for its next transmission; re-queues it while it
    /// stays interested
    pub fn try_send(
        &mut self,
        id: StreamId,
        max_len: usize,
        connection_window: u64,
    ) -> Option<send::StreamTransmission> {
        let entry = self.streams.get_mut(&id)?;
        let send = entry.send.as_mut()?;
        let transmission = send.try_send(max_len, connection_window);
        if send.has_transmission_interest() {
            self.notify_active(id);
        }
        transmission
    }

    /// Drains queued stream control frames into the pending queue
    pub fn collect_control_frames(&mut self, pending: &mut VecDeque<PendingFrame>) {
        let mut terminal = Vec::new();

        for (id, entry) in self.streams.iter_mut() {
            if let Some(send) = entry.send.as_mut() {
                if let Some((code, final_size)) = send.take_reset_transmission() {
                    pending.push_back(
                        ResetStream {
                            stream_id: id.as_varint(),
                            application_error_code: code,
                            final_size: VarInt::new(final_size).unwrap_or(VarInt::MAX),
                        }
                        .into(),
                    );
                }
                if let Some(limit) = send.report_blocked() {
                    pending.push_back(
                        StreamDataBlocked {
                            stream_id: id.as_varint(),
                            stream_data_limit: limit,
                        }
                        .into(),
                    );
                }
            }
            if let Some(recv) = entry.recv.as_mut() {
                if let Some(code) = recv.take_stop_sending_transmission() {
                    pending.push_back(
                        StopSending {
                            stream_id: id.as_varint(),
                            application_error_code: code,
                        }
                        .into(),
                    );
                }
                if let Some(maximum) = recv.take_update() {
                    pending.push_back(
                        MaxStreamData {
                            stream_id: id.as_varint(),
                            maximum_stream_data: maximum,
                        }
                        .into(),
                    );
                }
            }
            if entry.is_terminal() {
                terminal.push(*id);
            }
        }

        for id in terminal {
            self.cleanup(id);
        }

        for (counts, stream_type) in [
            (&mut self.bidi_counts, StreamType::Bidirectional),
            (&mut self.uni_counts, StreamType::Unidirectional),
        ] {
            if let Some(maximum) = counts.take_update() {
                pending.push_back(
                    frame::MaxStreams {
                        stream_type,
                        maximum_streams: maximum,
                    }
                    .into(),
                );
            }
            if let Some(limit) = counts.report_blocked() {
                pending.push_back(
                    StreamsBlocked {
                        stream_type,
                        stream_limit: limit,
                    }
                    .into(),
                );
            }
        }
    }

    // recovery fan-out

    pub fn on_stream_data_acked(&mut self, id: StreamId, offset: u64, len: u64, fin: bool) {
        if let Some(send) = self.streams.get_mut(&id).and_then(|e| e.send.as_mut()) {
            send.on_data_acked(offset, len, fin);
            self.cleanup(id);
        }
    }

    pub fn on_stream_data_lost(&mut self, id: StreamId, offset: u64, len: u64, fin: bool) {
        if let Some(send) = self.streams.get_mut(&id).and_then(|e| e.send.as_mut()) {
            send.on_data_lost(offset, len, fin);
            if send.has_transmission_interest() {
                self.notify_active(id);
            }
        }
    }

    pub fn on_reset_acked(&mut self, id: StreamId) {
        if let Some(send) = self.streams.get_mut(&id).and_then(|e| e.send.as_mut()) {
            send.on_reset_acked();
            self.cleanup(id);
        }
    }

    pub fn on_reset_lost(&mut self, id: StreamId) {
        if let Some(send) = self.streams.get_mut(&id).and_then(|e| e.send.as_mut()) {
            send.on_reset_lost();
            self.notify_active(id);
        }
    }

    /// Removes a stream once both halves reached a terminal state
    fn cleanup(&mut self, id: StreamId) {
        let Some(entry) = self.streams.get(&id) else {
            return;
        };
        if !entry.is_terminal() {
            return;
        }
        self.streams.remove(&id);
        self.active_members.remove(&id);

        if id.initiator() != self.local_endpoint {
            match id.stream_type() {
                StreamType::Bidirectional => self.bidi_counts.on_remote_close(),
                StreamType::Unidirectional => self.uni_counts.on_remote_close(),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests;
