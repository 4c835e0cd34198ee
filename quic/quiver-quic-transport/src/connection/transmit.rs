// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The outbound path: frame selection, packet assembly, coalescing

use super::{Connection, Outcome, State};
use crate::{
    scheduler::{self, SendContext},
    sent_packets::{SentContent, SentPacketInfo},
    PendingFrame,
};
use quiver_codec::{Encoder, EncoderBuffer, EncoderValue};
use quiver_quic_core::{
    crypto::EncryptionLevel,
    frame,
    packet::{
        encoding::{encode_packet, Header},
        number::PacketNumberSpace,
        version_negotiation, VERSION,
    },
    time::Timestamp,
    varint::VarInt,
};
use smallvec::SmallVec;
use tracing::trace;

//= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
//# a server MUST expand the payload of all UDP datagrams carrying ack-
//# eliciting Initial packets to at least the smallest allowed maximum
//# datagram size of 1200 bytes
const INITIAL_DATAGRAM_FLOOR: usize = 1200;

/// Rough ceiling for per-frame overhead when budgeting payload space
const STREAM_FRAME_OVERHEAD: usize = 1 + 8 + 8 + 4;
const CRYPTO_FRAME_OVERHEAD: usize = 1 + 8 + 4;

/// The smallest packet worth starting: long header plus sample padding
const MIN_USEFUL_PACKET: usize = 64;

impl Connection {
    /// Produces at most one datagram's worth of packets
    pub fn generate_outbound(&mut self, now: Timestamp, buffer: &mut [u8]) -> Outcome {
        match self.state {
            State::Closed | State::Draining => return Outcome::AllSendDone,
            State::Closing => return self.transmit_close(now, buffer),
            State::Connecting | State::Connected => {}
        }

        // a server's answer to an unsupported version needs no state
        if let Some((dcid, scid)) = self.pending_version_negotiation.take() {
            let len = {
                let mut encoder = EncoderBuffer::new(&mut *buffer);
                version_negotiation::encode(&mut encoder, &dcid, &scid, &[VERSION]);
                encoder.len()
            };
            return Outcome::Sent {
                len,
                destination: self.path.peer_address(),
            };
        }

        self.collect_pending_frames();

        if !self.recovery.pacer().can_release(now) {
            if let Some(release) = self.recovery.pacer().earliest_departure_time() {
                return Outcome::NextPeriod(release);
            }
        }

        let amplification_budget = self.path.amplification_budget();
        let datagram_budget = (self.path.mtu().current() as usize)
            .min(buffer.len())
            .min(amplification_budget.min(usize::MAX as u64) as usize);
        if datagram_budget < MIN_USEFUL_PACKET {
            return Outcome::AllSendDone;
        }

        let destination = self.path.transmission_address();

        // a dedicated, padded probe datagram raises the MTU ceiling
        if let Some(len) = self.transmit_mtu_probe(now, &mut buffer[..datagram_budget]) {
            self.finish_datagram(now, len, true);
            return Outcome::Sent {
                len,
                destination,
            };
        }

        let mut datagram_len = 0;
        let mut sent_ack_eliciting = false;

        // coalesce packets while levels keep producing
        loop {
            let remaining = datagram_budget - datagram_len;
            if remaining < MIN_USEFUL_PACKET {
                break;
            }
            match self.transmit_packet(now, &mut buffer[datagram_len..datagram_budget]) {
                Some(sealed) => {
                    datagram_len += sealed.len;
                    sent_ack_eliciting |= sealed.ack_eliciting;
                    if sealed.is_short_header {
                        // nothing can follow a packet without a length
                        break;
                    }
                }
                None => break,
            }
        }

        if datagram_len == 0 {
            return Outcome::AllSendDone;
        }

        self.finish_datagram(now, datagram_len, sent_ack_eliciting);
        Outcome::Sent {
            len: datagram_len,
            destination,
        }
    }

    fn finish_datagram(&mut self, now: Timestamp, len: usize, ack_eliciting: bool) {
        self.path.on_bytes_sent(len);
        self.recovery.on_datagram_sent(now, len);
        if ack_eliciting {
            self.reset_idle_timer(now);
        }
        self.rearm_pto();
    }

    /// Moves queued component output into the pending-frame FIFO
    fn collect_pending_frames(&mut self) {
        if let Some(maximum_data) = self.recv_flow.take_update() {
            self.pending
                .push_back(frame::MaxData { maximum_data }.into());
        }
        // only a stream that actually wants to send can be blocked
        if self.streams.has_active() {
            if let Some(data_limit) = self.send_flow.report_blocked() {
                self.pending
                    .push_back(frame::DataBlocked { data_limit }.into());
            }
        }
        self.streams.collect_control_frames(&mut self.pending);
        self.cids.collect_control_frames(&mut self.pending);
    }

    fn scheduler_inputs(&self, now: Timestamp) -> scheduler::Inputs {
        scheduler::Inputs {
            current_level: self.current_encryption_level(),
            initial_keys_available: self.keys.has_sealer(EncryptionLevel::Initial),
            handshake_keys_available: self.keys.has_sealer(EncryptionLevel::Handshake),
            early_data_keys_available: self.keys.has_sealer(EncryptionLevel::EarlyData),
            application_keys_available: self.keys.has_sealer(EncryptionLevel::Application),
            initial_ack_pending: self
                .initial_space
                .as_ref()
                .map_or(false, |space| space.ack_tracker.should_ack(now)),
            handshake_ack_pending: self
                .handshake_space
                .as_ref()
                .map_or(false, |space| space.ack_tracker.should_ack(now)),
            application_ack_pending: self.application_space.ack_tracker.should_ack(now),
            path_probe_pending: self.path.is_probing() || self.path.has_pending_response(),
            early_data_queued: self.streams.has_active(),
            initial_packet_sent: self.initial_packet_sent,
        }
    }

    /// Whether a packet at `level` would carry anything at all
    fn level_has_interest(&self, context: SendContext, congestion_ok: bool) -> bool {
        let level = context.level;
        if context.has_pending_ack {
            return true;
        }
        if context.is_path_probe {
            return true;
        }

        let crypto_interest = match level.packet_number_space() {
            PacketNumberSpace::Initial => self
                .initial_space
                .as_ref()
                .map_or(false, |space| space.crypto_stream.has_transmission_interest()),
            PacketNumberSpace::Handshake => self
                .handshake_space
                .as_ref()
                .map_or(false, |space| space.crypto_stream.has_transmission_interest()),
            PacketNumberSpace::ApplicationData => self
                .application_space
                .crypto_stream
                .has_transmission_interest(),
        };
        if !level.is_early_data() && crypto_interest && congestion_ok {
            return true;
        }

        if level == EncryptionLevel::Application {
            if self.path.has_pending_response() {
                return true;
            }
            if !self.pending.is_empty() {
                return true;
            }
        }

        if matches!(
            level,
            EncryptionLevel::EarlyData | EncryptionLevel::Application
        ) && self.streams.has_active()
            && congestion_ok
        {
            return true;
        }

        if self.recovery.probes_pending() > 0 {
            return true;
        }

        false
    }

    /// Assembles and seals one packet at the scheduler's chosen level
    fn transmit_packet(&mut self, now: Timestamp, buffer: &mut [u8]) -> Option<SealedResult> {
        let context = scheduler::next_send_context(self.scheduler_inputs(now));
        let level = context.level;

        if !self.keys.has_sealer(level) {
            return None;
        }

        let congestion_ok =
            self.recovery.probes_pending() > 0 || self.recovery.congestion().can_send(1);
        if !self.level_has_interest(context, congestion_ok) {
            return None;
        }

        let dcid = self.cids.current_remote();
        let scid = self.cids.current_local();
        let token = self.initial_token.clone();

        let header = match level {
            EncryptionLevel::Initial => Header::Initial {
                version: VERSION,
                dcid: dcid.as_bytes(),
                scid: scid.as_bytes(),
                token: token.as_ref(),
            },
            EncryptionLevel::EarlyData => Header::ZeroRtt {
                version: VERSION,
                dcid: dcid.as_bytes(),
                scid: scid.as_bytes(),
            },
            EncryptionLevel::Handshake => Header::Handshake {
                version: VERSION,
                dcid: dcid.as_bytes(),
                scid: scid.as_bytes(),
            },
            EncryptionLevel::Application => Header::Short {
                dcid: dcid.as_bytes(),
                spin: false,
                key_phase: false,
            },
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
        //# Datagrams containing Initial packets MAY exceed 1200 bytes if
        //# the sender believes that the network path and peer both support
        //# the size that it chooses.
        let min_packet_len = level
            .is_initial()
            .then(|| INITIAL_DATAGRAM_FLOOR.min(buffer.len()));

        let this = &mut *self;
        let space = match level.packet_number_space() {
            PacketNumberSpace::Initial => this.initial_space.as_mut()?,
            PacketNumberSpace::Handshake => this.handshake_space.as_mut()?,
            PacketNumberSpace::ApplicationData => &mut this.application_space,
        };

        let packet_number = space.generator.next().ok()?;
        let largest_acked = space.largest_acked();

        let mut content: SmallVec<[SentContent; 3]> = SmallVec::new();
        let mut ack_eliciting = false;

        let path = &mut this.path;
        let pending = &mut this.pending;
        let streams = &mut this.streams;
        let send_flow = &mut this.send_flow;
        let recovery = &mut this.recovery;
        let sealer = this.keys.sealer_mut(level)?;

        let sealed = encode_packet(
            buffer,
            header,
            packet_number,
            largest_acked,
            min_packet_len,
            sealer,
            |encoder| {
                // 1. this space's ACK, ahead of everything else
                if context.has_pending_ack || space.ack_tracker.should_ack(now) {
                    if let Some(ack_frame) = space.ack_tracker.build_frame(now) {
                        if ack_frame.encoding_size() <= encoder.remaining_capacity() {
                            content.push(SentContent::Ack {
                                largest: ack_frame.largest_acknowledged(),
                            });
                            encoder.encode(&ack_frame);
                        }
                    }
                }

                // 2. path validation frames (1-RTT only)
                if level == EncryptionLevel::Application {
                    if let Some(challenge) = path.take_challenge_transmission() {
                        if challenge.encoding_size() <= encoder.remaining_capacity() {
                            content.push(SentContent::PathChallenge);
                            ack_eliciting = true;
                            encoder.encode(&challenge);
                        }
                    }
                    if let Some(response) = path.take_response_transmission() {
                        if response.encoding_size() <= encoder.remaining_capacity() {
                            ack_eliciting = true;
                            encoder.encode(&response);
                        }
                    }
                }

                //= https://www.rfc-editor.org/rfc/rfc9000#section-8.1
                //# Prior to validating the client address, servers MUST NOT
                //# send more than three times as many bytes as the number of
                //# bytes they have received.
                //
                // while probing, everything except validation traffic and
                // ACKs stays off the candidate path
                if !context.is_path_probe {
                    // 3. connection control frames ride at 1-RTT
                    if level == EncryptionLevel::Application {
                        while let Some(next) = pending.front() {
                            if next.encoding_size() > encoder.remaining_capacity() {
                                break;
                            }
                            let frame = pending.pop_front().expect("peeked entry");
                            ack_eliciting |= frame.is_ack_eliciting();
                            encoder.encode(&frame);
                            content.push(match &frame {
                                PendingFrame::ResetStream(reset) => SentContent::ResetStream {
                                    id: reset.stream_id.into(),
                                },
                                _ => SentContent::Frame(frame),
                            });
                        }
                    }

                    // 4. handshake data for this space
                    if !level.is_early_data() && congestion_ok {
                        loop {
                            let budget = encoder
                                .remaining_capacity()
                                .saturating_sub(CRYPTO_FRAME_OVERHEAD);
                            let Some(transmission) = space.crypto_stream.try_send(budget) else {
                                break;
                            };
                            content.push(SentContent::Crypto {
                                offset: transmission.offset,
                                len: transmission.data.len() as u64,
                            });
                            ack_eliciting = true;
                            encoder.encode(&frame::Crypto {
                                offset: VarInt::new(transmission.offset)
                                    .unwrap_or(VarInt::MAX),
                                data: transmission.data,
                            });
                        }
                    }

                    // 5. application streams, round robin
                    if matches!(
                        level,
                        EncryptionLevel::EarlyData | EncryptionLevel::Application
                    ) && congestion_ok
                    {
                        let mut rounds = streams.active_len();
                        while rounds > 0 {
                            rounds -= 1;
                            let budget = encoder
                                .remaining_capacity()
                                .saturating_sub(STREAM_FRAME_OVERHEAD);
                            if budget == 0 {
                                break;
                            }
                            let Some(id) = streams.pop_active() else {
                                break;
                            };
                            let window = send_flow.available();
                            let Some(transmission) = streams.try_send(id, budget, window) else {
                                continue;
                            };
                            if !transmission.is_retransmission {
                                send_flow.on_data_sent(transmission.data.len() as u64);
                            }
                            content.push(SentContent::Stream {
                                id,
                                offset: transmission.offset,
                                len: transmission.data.len() as u64,
                                is_fin: transmission.is_fin,
                            });
                            ack_eliciting = true;
                            encoder.encode(&frame::Stream {
                                stream_id: id.as_varint(),
                                offset: VarInt::new(transmission.offset)
                                    .unwrap_or(VarInt::MAX),
                                is_last_frame: false,
                                is_fin: transmission.is_fin,
                                data: transmission.data,
                            });
                        }
                    }
                }

                // 6. a PTO probe must make the packet ack-eliciting
                if !ack_eliciting && recovery.take_probe() {
                    ack_eliciting = true;
                    encoder.encode(&frame::Ping);
                }
            },
        );

        let sealed = match sealed {
            Ok(sealed) => sealed,
            Err(error) => {
                trace!(?error, "packet assembly produced nothing");
                return None;
            }
        };

        let info = SentPacketInfo {
            send_time: now,
            size: sealed.len as u16,
            ack_eliciting,
            // ACK-only packets stay outside the congestion window
            in_flight: ack_eliciting,
            content,
        };
        this.recovery
            .on_packet_sent(space, packet_number.as_u64(), info, now);

        if level.is_initial() {
            this.initial_packet_sent = true;
        }

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.1
        //# Thus, a client MUST discard Initial keys when it first sends a
        //# Handshake packet
        if level == EncryptionLevel::Handshake && this.local.is_client() {
            this.discard_initial_space();
        }

        Some(SealedResult {
            len: sealed.len,
            ack_eliciting,
            is_short_header: matches!(level, EncryptionLevel::Application),
        })
    }

    /// Emits one padded MTU probe datagram when one is due
    fn transmit_mtu_probe(&mut self, now: Timestamp, buffer: &mut [u8]) -> Option<usize> {
        if !self.handshake_confirmed
            || !self.keys.has_sealer(EncryptionLevel::Application)
            || self.path.is_probing()
        {
            return None;
        }
        if !self.recovery.congestion().can_send(buffer.len()) {
            return None;
        }

        self.path.mtu_mut().request_probe();
        let probe_size = {
            let mtu = self.path.mtu_mut();
            let Some(size) = mtu.take_probe() else {
                return None;
            };
            if size as usize > buffer.len() {
                mtu.on_probe_lost(size);
                return None;
            }
            size
        };

        let this = &mut *self;
        let space = &mut this.application_space;
        let packet_number = space.generator.next().ok()?;
        let largest_acked = space.largest_acked();
        let dcid = this.cids.current_remote();
        let sealer = this.keys.sealer_mut(EncryptionLevel::Application)?;

        let sealed = encode_packet(
            &mut buffer[..probe_size as usize],
            Header::Short {
                dcid: dcid.as_bytes(),
                spin: false,
                key_phase: false,
            },
            packet_number,
            largest_acked,
            Some(probe_size as usize),
            sealer,
            |encoder| encoder.encode(&frame::Ping),
        )
        .ok()?;

        let mut content: SmallVec<[SentContent; 3]> = SmallVec::new();
        content.push(SentContent::MtuProbe { size: probe_size });
        let info = SentPacketInfo {
            send_time: now,
            size: sealed.len as u16,
            ack_eliciting: true,
            in_flight: true,
            content,
        };
        this.recovery
            .on_packet_sent(&mut this.application_space, packet_number.as_u64(), info, now);

        Some(sealed.len)
    }

    /// Sends (or resends) the CONNECTION_CLOSE while closing
    fn transmit_close(&mut self, now: Timestamp, buffer: &mut [u8]) -> Outcome {
        if !self.close_frame_needs_transmit {
            return Outcome::AllSendDone;
        }

        let level = [
            EncryptionLevel::Application,
            EncryptionLevel::Handshake,
            EncryptionLevel::Initial,
        ]
        .into_iter()
        .find(|level| self.keys.has_sealer(*level));
        let Some(level) = level else {
            return Outcome::AllSendDone;
        };

        let close_frame = match self.close_frame.clone() {
            Some(frame) => frame,
            None => return Outcome::AllSendDone,
        };

        let dcid = self.cids.current_remote();
        let scid = self.cids.current_local();
        let header = match level {
            EncryptionLevel::Initial => Header::Initial {
                version: VERSION,
                dcid: dcid.as_bytes(),
                scid: scid.as_bytes(),
                token: &[],
            },
            EncryptionLevel::Handshake => Header::Handshake {
                version: VERSION,
                dcid: dcid.as_bytes(),
                scid: scid.as_bytes(),
            },
            _ => Header::Short {
                dcid: dcid.as_bytes(),
                spin: false,
                key_phase: false,
            },
        };

        let this = &mut *self;
        let space = match level.packet_number_space() {
            PacketNumberSpace::Initial => match this.initial_space.as_mut() {
                Some(space) => space,
                None => return Outcome::AllSendDone,
            },
            PacketNumberSpace::Handshake => match this.handshake_space.as_mut() {
                Some(space) => space,
                None => return Outcome::AllSendDone,
            },
            PacketNumberSpace::ApplicationData => &mut this.application_space,
        };

        let Ok(packet_number) = space.generator.next() else {
            return Outcome::AllSendDone;
        };
        let largest_acked = space.largest_acked();
        let Some(sealer) = this.keys.sealer_mut(level) else {
            return Outcome::AllSendDone;
        };

        let budget = (this.path.mtu().current() as usize).min(buffer.len());
        let sealed = encode_packet(
            &mut buffer[..budget],
            header,
            packet_number,
            largest_acked,
            None,
            sealer,
            |encoder| encoder.encode(&close_frame),
        );

        match sealed {
            Ok(sealed) => {
                this.close_frame_needs_transmit = false;
                this.path.on_bytes_sent(sealed.len);
                Outcome::Sent {
                    len: sealed.len,
                    destination: this.path.peer_address(),
                }
            }
            Err(_) => Outcome::AllSendDone,
        }
    }
}

/// The per-packet result handed back to the datagram loop
pub(super) struct SealedResult {
    pub len: usize,
    pub ack_eliciting: bool,
    pub is_short_header: bool,
}
