// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The connection: one state machine owning every subsystem
//!
//! All entry points are synchronous step functions. Between calls the
//! connection holds no locks, spawns nothing, and waits on nothing; the
//! embedding endpoint decides when to call back in based on the
//! returned outcomes and `next_timer_expiration`.

mod tls_bridge;
mod transmit;

use crate::{
    ack_tracker::Disposition,
    cid::CidCoordinator,
    event::{ConnectionEventSink, ReadCallback},
    flow::{RecvFlowController, SendFlowController, StreamCountController},
    path::{AddressObservation, PathManager},
    recovery,
    sent_packets::SentContent,
    session::{Session, SessionCache, TransportParametersSummary},
    space::{KeySet, PacketSpace},
    stream::{StreamLimits, StreamManager},
    PendingFrame,
};
use bytes::Bytes;
use quiver_quic_core::{
    ack, application,
    connection::{self as core_connection, ConnectionId, Limits},
    crypto::{initial::InitialKeyProvider, tls::HandshakeEngine, EncryptionLevel},
    endpoint,
    frame::{self, ConnectionClose, FrameRef},
    packet::{number::PacketNumberSpace, CleartextPacket, ProtectedPacket, VERSION},
    random,
    stream::{StreamId, StreamType},
    time::{Timer, Timestamp},
    transport::{self, parameters::TransportParameters},
    varint::VarInt,
};
use quiver_codec::EncoderValue;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tls_bridge::TlsBridge;
use tracing::{debug, trace};

/// What `generate_outbound` produced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// One datagram was written; send it to `destination` and poll again
    Sent {
        len: usize,
        destination: SocketAddr,
    },
    /// Nothing may leave before this time (pacing); poll again then
    NextPeriod(Timestamp),
    /// Nothing to send until new input arrives
    AllSendDone,
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-10.2
//# An endpoint that is closing is not required to process any received
//# frame.
#[derive(Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Closing,
    Draining,
    Closed,
}

/// Everything a connection needs injected at construction
pub struct Config {
    pub endpoint_type: endpoint::Type,
    pub limits: Limits,
    pub tls: Box<dyn HandshakeEngine>,
    pub initial_keys: Box<dyn InitialKeyProvider>,
    pub congestion: Box<dyn quiver_quic_core::recovery::CongestionController>,
    pub random: Box<dyn random::Generator>,
    pub events: Box<dyn ConnectionEventSink>,
    pub peer_address: SocketAddr,
    /// Keys the listener's CID routing hash
    pub cid_hash_key: (u64, u64),
    /// Shared 0-RTT session store; a client writes one entry per
    /// completed handshake
    pub session_cache: Option<Arc<Mutex<SessionCache>>>,
    /// A previously cached session to resume with (client): seeds the
    /// early-data limits and the Initial token
    pub session: Option<Session>,
}

pub struct Connection {
    local: endpoint::Type,
    state: State,
    local_params: TransportParameters,
    peer_params: Option<TransportParameters>,
    /// Scaling for ACK Delay fields in the peer's ACK frames
    peer_ack_settings: ack::Settings,

    keys: KeySet,
    initial_space: Option<PacketSpace>,
    handshake_space: Option<PacketSpace>,
    application_space: PacketSpace,

    tls: Box<dyn HandshakeEngine>,
    initial_keys: Box<dyn InitialKeyProvider>,

    streams: StreamManager,
    send_flow: SendFlowController,
    recv_flow: RecvFlowController,
    recovery: recovery::Manager,
    path: PathManager,
    cids: CidCoordinator,
    pending: VecDeque<PendingFrame>,
    events: Box<dyn ConnectionEventSink>,
    random: Box<dyn random::Generator>,

    idle_timer: Timer,
    idle_timeout: Option<core::time::Duration>,
    close_timer: Timer,
    /// Throttles CONNECTION_CLOSE retransmission to one per PTO
    close_resend_after: Option<Timestamp>,
    close_frame: Option<PendingFrame>,
    close_frame_needs_transmit: bool,
    close_notified: bool,
    error: Option<core_connection::Error>,

    /// Client: the DCID of the very first Initial, which keyed the
    /// Initial secrets
    original_dcid: ConnectionId,
    /// Client: token to echo in Initial packets (Retry / NEW_TOKEN)
    initial_token: Bytes,
    initial_packet_sent: bool,
    /// Client: the server's SCID replaced the provisional remote CID
    peer_cid_updated: bool,
    handshake_complete: bool,
    handshake_confirmed: bool,
    retry_received: bool,

    /// A server answer to an unknown version, (dcid, scid) to echo
    pending_version_negotiation: Option<(Vec<u8>, Vec<u8>)>,
    /// Datagrams that arrived before their keys; replayed on key install
    undecryptable: Vec<(Timestamp, SocketAddr, Vec<u8>)>,

    session_cache: Option<Arc<Mutex<SessionCache>>>,
    /// Remembered server limits when resuming; the fresh parameters must
    /// honor them
    resumed_limits: Option<TransportParametersSummary>,
    /// The most recent NEW_TOKEN, cached as the next session's ticket
    latest_token: Option<Bytes>,
    /// The cache is written at most once per completed handshake
    session_stored: bool,
}

const UNDECRYPTABLE_BUFFER_LIMIT: usize = 8;

/// Borrows the space for a level without freezing the rest of the
/// connection, so sibling fields stay usable alongside it
macro_rules! space_for_level {
    ($self:ident, $level:expr) => {
        match $level.packet_number_space() {
            PacketNumberSpace::Initial => $self.initial_space.as_mut(),
            PacketNumberSpace::Handshake => $self.handshake_space.as_mut(),
            PacketNumberSpace::ApplicationData => Some(&mut $self.application_space),
        }
    };
}

impl Connection {
    /// Builds a client connection and produces the first TLS flight
    pub fn new_client(mut config: Config, now: Timestamp) -> Result<Self, core_connection::Error> {
        let mut dcid_bytes = [0u8; 8];
        config.random.fill(&mut dcid_bytes);
        let original_dcid = ConnectionId::try_from_bytes(&dcid_bytes).expect("length in range");

        let mut scid_bytes = [0u8; 8];
        config.random.fill(&mut scid_bytes);
        let scid = ConnectionId::try_from_bytes(&scid_bytes).expect("length in range");

        let mut connection = Self::new(config, original_dcid, original_dcid, scid, None, now)?;

        let mut bridge = TlsBridge::default();
        let result = connection.tls.start(&mut bridge);
        connection.apply_tls_outputs(bridge, now)?;
        if let Err(error) = result {
            connection.immediate_close(error, now);
        }

        Ok(connection)
    }

    /// Builds a server connection from the first Initial's header
    pub fn new_server(
        mut config: Config,
        client_dcid: &[u8],
        client_scid: &[u8],
        now: Timestamp,
    ) -> Result<Self, core_connection::Error> {
        let original_dcid = ConnectionId::try_from_bytes(client_dcid).map_err(|_| {
            core_connection::Error::Internal {
                reason: "client destination connection id exceeds 20 bytes",
            }
        })?;
        let peer_scid = ConnectionId::try_from_bytes(client_scid).map_err(|_| {
            core_connection::Error::Internal {
                reason: "client source connection id exceeds 20 bytes",
            }
        })?;

        let mut scid_bytes = [0u8; 8];
        config.random.fill(&mut scid_bytes);
        let scid = ConnectionId::try_from_bytes(&scid_bytes).expect("length in range");

        Self::new(
            config,
            original_dcid,
            peer_scid,
            scid,
            Some(original_dcid),
            now,
        )
    }

    fn new(
        config: Config,
        initial_dcid: ConnectionId,
        peer_cid: ConnectionId,
        local_cid: ConnectionId,
        original_destination: Option<ConnectionId>,
        now: Timestamp,
    ) -> Result<Self, core_connection::Error> {
        let Config {
            endpoint_type,
            limits,
            mut tls,
            initial_keys,
            congestion,
            mut random,
            mut events,
            peer_address,
            cid_hash_key,
            session_cache,
            session,
        } = config;

        let mut local_params = limits.to_transport_parameters();
        local_params.initial_source_connection_id = Some(local_cid);
        local_params.original_destination_connection_id = original_destination;
        tls.set_transport_parameters(&local_params.encode_to_vec());

        let ack_settings = ack::Settings {
            max_ack_delay: limits.max_ack_delay,
            ack_delay_exponent: limits.ack_delay_exponent,
        };

        let mut keys = KeySet::new();
        keys.install_sealer(
            EncryptionLevel::Initial,
            initial_keys.sealer(initial_dcid.as_bytes(), endpoint_type),
        );
        keys.install_opener(
            EncryptionLevel::Initial,
            initial_keys.opener(initial_dcid.as_bytes(), endpoint_type),
        );

        let stream_limits = StreamLimits {
            local_bidi_recv: limits.initial_max_stream_data_bidi_local,
            remote_bidi_recv: limits.initial_max_stream_data_bidi_remote,
            uni_recv: limits.initial_max_stream_data_uni,
            // send limits stay zero until the peer's parameters arrive
            local_bidi_send: VarInt::ZERO,
            remote_bidi_send: VarInt::ZERO,
            uni_send: VarInt::ZERO,
        };
        let mut streams = StreamManager::new(
            endpoint_type,
            stream_limits,
            StreamCountController::new(VarInt::ZERO, limits.initial_max_streams_bidi),
            StreamCountController::new(VarInt::ZERO, limits.initial_max_streams_uni),
        );
        let mut send_flow = SendFlowController::new(VarInt::ZERO);

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.6.1
        //# A client that attempts to send 0-RTT data MUST remember all
        //# other transport parameters used by the server that it is able
        //# to process.
        let mut initial_token = Bytes::new();
        let mut resumed_limits = None;
        if let Some(session) = session.filter(|_| endpoint_type.is_client()) {
            let summary = session.transport_params_summary;
            let early_data_limit =
                VarInt::new(session.early_data_limit).unwrap_or(VarInt::MAX);

            // early data runs under the remembered limits, capped by how
            // much the server will accept before the handshake finishes
            send_flow.on_max_data(summary.initial_max_data.min(early_data_limit));
            streams.on_peer_limits(
                summary.initial_max_stream_data_bidi_remote,
                summary.initial_max_stream_data_bidi_local,
                summary.initial_max_stream_data_uni,
                summary.initial_max_streams_bidi,
                summary.initial_max_streams_uni,
            );

            initial_token = session.ticket;
            resumed_limits = Some(summary);
        }

        let mut path = PathManager::new(
            peer_address,
            // a client validated the server address by choosing it
            endpoint_type.is_client(),
            limits.max_udp_payload_size,
        );
        path.set_migration_disabled(!limits.migration_support);

        let mut cids = CidCoordinator::new(local_cid, peer_cid, cid_hash_key);
        cids.replenish_local(&mut *random, &mut *events);

        let idle_timeout = (limits.max_idle_timeout > core::time::Duration::ZERO)
            .then_some(limits.max_idle_timeout);
        let mut idle_timer = Timer::default();
        if let Some(timeout) = idle_timeout {
            idle_timer.set(now + timeout);
        }

        Ok(Self {
            local: endpoint_type,
            state: State::Connecting,
            local_params,
            peer_params: None,
            peer_ack_settings: ack::Settings::default(),
            keys,
            initial_space: Some(PacketSpace::new(PacketNumberSpace::Initial, ack_settings)),
            handshake_space: Some(PacketSpace::new(PacketNumberSpace::Handshake, ack_settings)),
            application_space: PacketSpace::new(PacketNumberSpace::ApplicationData, ack_settings),
            tls,
            initial_keys,
            streams,
            send_flow,
            recv_flow: RecvFlowController::new(
                limits.initial_max_data,
                limits.initial_max_data.as_u64(),
            ),
            recovery: recovery::Manager::new(congestion, ack_settings),
            path,
            cids,
            pending: VecDeque::new(),
            events,
            random,
            idle_timer,
            idle_timeout,
            close_timer: Timer::default(),
            close_resend_after: None,
            close_frame: None,
            close_frame_needs_transmit: false,
            close_notified: false,
            error: None,
            original_dcid: initial_dcid,
            initial_token,
            initial_packet_sent: false,
            peer_cid_updated: false,
            handshake_complete: false,
            handshake_confirmed: false,
            retry_received: false,
            pending_version_negotiation: None,
            undecryptable: Vec::new(),
            session_cache,
            resumed_limits,
            latest_token: None,
            session_stored: false,
        })
    }

    // ===== routing support =====

    pub fn peer_address(&self) -> SocketAddr {
        self.path.peer_address()
    }

    /// Hashes for every live local connection ID
    pub fn connection_id_hashes(&self) -> Vec<u64> {
        self.cids.local_hashes().collect()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    pub fn is_handshake_confirmed(&self) -> bool {
        self.handshake_confirmed
    }

    /// The terminal error, once the connection has one
    pub fn error(&self) -> Option<core_connection::Error> {
        self.error
    }

    /// The peer's transport parameters, once the handshake delivered them
    pub fn peer_parameters(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }

    // ===== application surface =====

    pub fn make_stream(&mut self, stream_type: StreamType) -> Result<StreamId, transport::Error> {
        self.ensure_open()?;
        self.streams.open(stream_type)
    }

    pub fn stream_send(&mut self, id: StreamId, data: &[u8]) -> Result<usize, transport::Error> {
        self.ensure_open()?;
        self.streams.send(id, data)
    }

    pub fn stream_close(&mut self, id: StreamId) -> Result<(), transport::Error> {
        self.ensure_open()?;
        self.streams.close_stream(id)
    }

    pub fn reset_stream(
        &mut self,
        id: StreamId,
        error: application::Error,
    ) -> Result<(), transport::Error> {
        self.ensure_open()?;
        self.streams.reset_stream(id, error)
    }

    pub fn stop_sending(
        &mut self,
        id: StreamId,
        error: application::Error,
    ) -> Result<(), transport::Error> {
        self.ensure_open()?;
        self.streams.stop_sending(id, error)
    }

    pub fn set_read_callback(
        &mut self,
        id: StreamId,
        callback: ReadCallback,
    ) -> Result<(), transport::Error> {
        self.streams.set_read_callback(id, callback)
    }

    /// Application-initiated close
    pub fn close(&mut self, error: application::Error, now: Timestamp) {
        if !matches!(self.state, State::Connecting | State::Connected) {
            return;
        }
        let close_frame: PendingFrame = ConnectionClose {
            error_code: error.as_varint(),
            frame_type: None,
            reason: None,
        }
        .into();
        self.enter_closing(
            core_connection::Error::Application {
                error,
                initiator: core_connection::error::Initiator::Local,
            },
            close_frame,
            now,
        );
    }

    fn ensure_open(&self) -> Result<(), transport::Error> {
        if matches!(self.state, State::Connecting | State::Connected) {
            Ok(())
        } else {
            Err(transport::Error::NO_ERROR.with_reason("connection is closed"))
        }
    }

    // ===== close lifecycle =====

    /// A local protocol error: queue CONNECTION_CLOSE and stop traffic
    fn immediate_close(&mut self, error: transport::Error, now: Timestamp) {
        let close_frame: PendingFrame = ConnectionClose {
            error_code: error.code.as_varint(),
            frame_type: Some(error.frame_type.unwrap_or(VarInt::ZERO)),
            reason: None,
        }
        .into();
        self.enter_closing(error.into(), close_frame, now);
    }

    fn enter_closing(
        &mut self,
        error: core_connection::Error,
        close_frame: PendingFrame,
        now: Timestamp,
    ) {
        debug!(?error, "closing connection");
        self.error = Some(error);
        self.state = State::Closing;
        self.close_frame = Some(close_frame);
        self.close_frame_needs_transmit = true;
        self.close_resend_after = None;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2
        //# The closing and draining connection states exist to ensure that
        //# connections close cleanly and that delayed or reordered packets
        //# are properly discarded.  These states SHOULD persist for at
        //# least three times the current PTO interval
        self.close_timer.set(now + self.recovery.close_period());
        self.idle_timer.cancel();
        self.notify_closed(error);
    }

    fn enter_draining(&mut self, error: core_connection::Error, now: Timestamp) {
        debug!(?error, "draining connection");
        self.error = Some(error);
        self.state = State::Draining;
        self.close_timer.set(now + self.recovery.close_period());
        self.idle_timer.cancel();
        self.notify_closed(error);
    }

    fn notify_closed(&mut self, error: core_connection::Error) {
        if !self.close_notified {
            self.close_notified = true;
            self.events.on_connection_closed(error);
        }
    }

    fn become_closed(&mut self) {
        self.state = State::Closed;
        self.close_timer.cancel();
        self.idle_timer.cancel();
        self.pending.clear();
        self.undecryptable.clear();
    }

    // ===== timers =====

    /// Drives every internal timer
    pub fn on_timer(&mut self, now: Timestamp) {
        if matches!(self.state, State::Closed) {
            return;
        }

        if self.close_timer.poll_expiration(now) {
            self.become_closed();
            return;
        }
        if matches!(self.state, State::Closing | State::Draining) {
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
        //# If a max_idle_timeout is specified by either endpoint... the
        //# connection is silently closed and its state is discarded when it
        //# remains idle
        if self.idle_timer.poll_expiration(now) {
            self.error = Some(core_connection::Error::IdleTimeout);
            self.notify_closed(core_connection::Error::IdleTimeout);
            self.become_closed();
            return;
        }

        // per-space loss detection
        for space in [
            self.initial_space.as_mut(),
            self.handshake_space.as_mut(),
            Some(&mut self.application_space),
        ]
        .into_iter()
        .flatten()
        {
            if space.loss_timer.is_expired(now) {
                let lost = self.recovery.on_loss_timer(space, now);
                for (_, info) in lost {
                    requeue_lost(
                        space,
                        &mut self.streams,
                        &mut self.pending,
                        &mut self.path,
                        info.content,
                    );
                }
            }
        }

        if self.recovery.on_pto_timer(now) {
            trace!("pto expired");
        }

        // path probe retries; abandonment restores normal amplification
        // accounting automatically because the challenge is dropped
        self.path.on_timer(now, &mut *self.random);
    }

    /// The earliest deadline any timer is armed for
    pub fn next_timer_expiration(&self) -> Option<Timestamp> {
        let mut earliest: Option<Timestamp> = None;
        let mut consider = |candidate: Option<Timestamp>| {
            if let Some(candidate) = candidate {
                earliest = Some(match earliest {
                    Some(existing) => existing.min(candidate),
                    None => candidate,
                });
            }
        };

        consider(self.close_timer.expiration());
        consider(self.idle_timer.expiration());
        consider(self.recovery.pto_expiration());
        consider(self.path.timer_expiration());
        for space in self.spaces() {
            consider(space.loss_timer.expiration());
            consider(space.ack_tracker.timer_expiration());
        }
        earliest
    }

    fn spaces(&self) -> impl Iterator<Item = &PacketSpace> {
        [
            self.initial_space.as_ref(),
            self.handshake_space.as_ref(),
            Some(&self.application_space),
        ]
        .into_iter()
        .flatten()
    }

    // ===== inbound =====

    /// Feeds one received datagram into the connection
    pub fn on_datagram(&mut self, now: Timestamp, source: SocketAddr, datagram: &mut [u8]) {
        if matches!(self.state, State::Closed | State::Draining) {
            return;
        }

        let observation =
            self.path
                .on_datagram_received(source, datagram.len(), &mut *self.random, now);
        if observation == AddressObservation::Candidate && self.path.is_probing() {
            trace!(?source, "datagram from candidate address");
        }

        let mut buffer = quiver_codec::DecoderBufferMut::new(datagram);
        while !buffer.is_empty() {
            let (packet, remaining) =
                match ProtectedPacket::decode(buffer, self.cids.local_cid_len()) {
                    Ok(decoded) => decoded,
                    Err(_) => {
                        // an unparseable packet poisons the rest of the
                        // datagram; drop what is left
                        return;
                    }
                };
            buffer = remaining;
            self.on_packet(now, source, packet);
            if matches!(self.state, State::Closed | State::Draining) {
                return;
            }
        }
    }

    fn on_packet(&mut self, now: Timestamp, source: SocketAddr, packet: ProtectedPacket) {
        // version handling comes before any crypto
        match &packet {
            ProtectedPacket::VersionNegotiation(_) => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-6.2
                //# A client that supports only this version of QUIC MUST
                //# abandon the current connection attempt if it receives a
                //# Version Negotiation packet
                if self.local.is_client() && !self.initial_packet_sent {
                    return;
                }
                if self.local.is_client() && matches!(self.state, State::Connecting) {
                    self.error = Some(core_connection::Error::NoValidPath);
                    self.notify_closed(core_connection::Error::NoValidPath);
                    self.become_closed();
                }
                return;
            }
            ProtectedPacket::Initial(initial) if initial.version() != VERSION => {
                if self.local.is_server() {
                    self.pending_version_negotiation = Some((
                        initial.source_connection_id().to_vec(),
                        initial.destination_connection_id().to_vec(),
                    ));
                }
                return;
            }
            ProtectedPacket::Retry(retry) => {
                self.on_retry_packet(retry.source_connection_id().to_vec(), {
                    retry.retry_token().map(Bytes::copy_from_slice)
                });
                return;
            }
            _ => {}
        }

        let Some(level) = packet.encryption_level() else {
            return;
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.2
        //# Upon first receiving an Initial or Retry packet from the server, the
        //# client uses the Source Connection ID supplied by the server as the
        //# Destination Connection ID for subsequent packets
        if self.local.is_client() && !self.peer_cid_updated {
            if let ProtectedPacket::Initial(initial) = &packet {
                if let Ok(scid) = ConnectionId::try_from_bytes(initial.source_connection_id()) {
                    self.cids.update_initial_remote(scid);
                    self.peer_cid_updated = true;
                }
            }
        }

        // while closing, any inbound packet may trigger one
        // CONNECTION_CLOSE retransmission per PTO, nothing more
        if matches!(self.state, State::Closing) {
            if self
                .close_resend_after
                .map_or(true, |after| after.has_elapsed(now))
            {
                self.close_frame_needs_transmit = true;
                self.close_resend_after = Some(now + self.recovery.close_period() / 3);
            }
            return;
        }

        let Some(space) = self.space_for_level_mut(level) else {
            return;
        };
        let largest = space.ack_tracker.largest_received();

        let Some(opener) = self.keys.opener(level) else {
            // keep the packet until its keys arrive
            if self.undecryptable.len() < UNDECRYPTABLE_BUFFER_LIMIT {
                let copy = match &packet {
                    ProtectedPacket::Handshake(handshake) => Some(handshake.as_bytes().to_vec()),
                    ProtectedPacket::ZeroRtt(zero_rtt) => Some(zero_rtt.as_bytes().to_vec()),
                    _ => None,
                };
                if let Some(copy) = copy {
                    self.undecryptable.push((now, source, copy));
                }
            }
            return;
        };

        let cleartext = match packet.open(opener, largest) {
            Ok(cleartext) => cleartext,
            Err(error) => {
                //= https://www.rfc-editor.org/rfc/rfc9001#section-9.3
                //# an endpoint that discards packets that fail authentication
                //# does so without signaling that fact to its peer
                trace!(?error, "dropping undecryptable packet");
                return;
            }
        };

        self.on_cleartext_packet(now, cleartext);
    }

    fn on_cleartext_packet(&mut self, now: Timestamp, packet: CleartextPacket) {
        let level = packet.encryption_level;

        // classify before dispatch so duplicates produce no effects
        let mut ack_eliciting = false;
        {
            let mut payload = packet.payload;
            while !payload.is_empty() {
                match payload.decode::<FrameRef>() {
                    Ok((frame, remaining)) => {
                        ack_eliciting |= frame.is_ack_eliciting();
                        payload = remaining;
                    }
                    Err(_) => {
                        self.immediate_close(
                            transport::Error::FRAME_ENCODING_ERROR
                                .with_reason("malformed frame"),
                            now,
                        );
                        return;
                    }
                }
            }
        }

        let Some(space) = self.space_for_level_mut(level) else {
            return;
        };
        if space
            .ack_tracker
            .on_packet_received(packet.packet_number, ack_eliciting, now)
            == Disposition::Duplicate
        {
            trace!(pn = packet.packet_number.as_u64(), "duplicate packet");
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.1
        //# a server MUST discard Initial keys when it first successfully
        //# processes a Handshake packet
        if level == EncryptionLevel::Handshake && self.local.is_server() {
            self.discard_initial_space();
        }

        if ack_eliciting {
            self.reset_idle_timer(now);
        }

        // left-to-right dispatch, halting on the first handler error
        let mut payload = packet.payload;
        while !payload.is_empty() {
            let (frame, remaining) = match payload.decode::<FrameRef>() {
                Ok(decoded) => decoded,
                Err(_) => return,
            };
            payload = remaining;

            let tag = frame.tag();
            if let Err(error) = self.on_frame(now, level, frame) {
                self.immediate_close(error.with_frame_type(tag), now);
                return;
            }
            if !matches!(self.state, State::Connecting | State::Connected) {
                return;
            }
        }
    }

    fn space_for_level_mut(&mut self, level: EncryptionLevel) -> Option<&mut PacketSpace> {
        match level.packet_number_space() {
            PacketNumberSpace::Initial => self.initial_space.as_mut(),
            PacketNumberSpace::Handshake => self.handshake_space.as_mut(),
            PacketNumberSpace::ApplicationData => Some(&mut self.application_space),
        }
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
    //# The payload of a packet that contains frames MUST contain at least
    //# one frame, and MAY contain multiple frames and multiple frame
    //# types.
    fn on_frame(
        &mut self,
        now: Timestamp,
        level: EncryptionLevel,
        frame: FrameRef,
    ) -> Result<(), transport::Error> {
        frame_allowed_at(level, &frame)?;

        match frame {
            frame::Frame::Padding(_) | frame::Frame::Ping(_) => Ok(()),

            frame::Frame::Ack(ack_frame) => self.on_ack_frame(now, level, ack_frame),

            frame::Frame::Crypto(crypto) => {
                let offset = crypto.offset.as_u64();
                let data = Bytes::copy_from_slice(crypto.data.as_less_safe_slice());
                let space = self
                    .space_for_level_mut(level)
                    .ok_or_else(|| transport::Error::INTERNAL_ERROR.with_reason("space gone"))?;
                if let Some(handshake_data) = space.crypto_stream.on_crypto_frame(offset, data)? {
                    let mut bridge = TlsBridge::default();
                    let result = self.tls.on_crypto_data(level, &handshake_data, &mut bridge);
                    self.apply_tls_outputs(bridge, now)?;
                    result?;
                }
                Ok(())
            }

            frame::Frame::Stream(stream) => {
                let id = StreamId::from_varint(stream.stream_id);
                let data = Bytes::copy_from_slice(stream.data.as_less_safe_slice());
                let growth = self.streams.on_stream_frame(
                    id,
                    stream.offset.as_u64(),
                    data,
                    stream.is_fin,
                    &mut *self.events,
                )?;
                if growth > 0 {
                    self.recv_flow.on_data_received(growth)?;
                }
                Ok(())
            }

            frame::Frame::ResetStream(reset) => {
                let growth = self.streams.on_reset_stream(&reset, &mut *self.events)?;
                if growth > 0 {
                    self.recv_flow.on_data_received(growth)?;
                }
                Ok(())
            }

            frame::Frame::StopSending(stop) => {
                self.streams.on_stop_sending(&stop, &mut *self.events)
            }

            frame::Frame::MaxData(max_data) => {
                self.send_flow.on_max_data(max_data.maximum_data);
                Ok(())
            }

            frame::Frame::MaxStreamData(frame) => {
                self.streams.on_max_stream_data(&frame, &mut *self.events)
            }

            frame::Frame::MaxStreams(frame) => {
                self.streams.on_max_streams(&frame);
                Ok(())
            }

            frame::Frame::DataBlocked(frame) => {
                debug!(limit = %frame.data_limit, "peer is connection-flow blocked");
                Ok(())
            }

            frame::Frame::StreamDataBlocked(frame) => {
                debug!(
                    stream = %frame.stream_id,
                    limit = %frame.stream_data_limit,
                    "peer is stream-flow blocked"
                );
                Ok(())
            }

            frame::Frame::StreamsBlocked(frame) => {
                debug!(limit = %frame.stream_limit, "peer is stream-count blocked");
                Ok(())
            }

            frame::Frame::NewConnectionId(frame) => self.cids.on_new_connection_id(&frame),

            frame::Frame::RetireConnectionId(frame) => self.cids.on_retire_connection_id(
                &frame,
                self.cids.current_remote().as_bytes(),
                &mut *self.random,
                &mut *self.events,
            ),

            frame::Frame::PathChallenge(challenge) => {
                self.path.on_path_challenge(&challenge);
                Ok(())
            }

            frame::Frame::PathResponse(response) => {
                if self.path.on_path_response(&response) {
                    // the candidate is now the active path
                    self.cids.rotate_remote();
                    self.recovery.on_path_reset(self.path.mtu().current());
                    self.cids
                        .replenish_local(&mut *self.random, &mut *self.events);
                }
                Ok(())
            }

            frame::Frame::ConnectionClose(close) => {
                let initiator = core_connection::error::Initiator::Remote;
                let error = if close.is_application_close() {
                    core_connection::Error::Application {
                        error: application::Error::new(close.error_code),
                        initiator,
                    }
                } else if close.error_code == transport::error::Code::NO_ERROR.as_varint() {
                    core_connection::Error::Closed { initiator }
                } else {
                    core_connection::Error::Transport {
                        error: transport::Error {
                            code: transport::error::Code::new(close.error_code),
                            frame_type: close.frame_type,
                            reason: "",
                        },
                        initiator,
                    }
                };
                self.enter_draining(error, now);
                Ok(())
            }

            frame::Frame::HandshakeDone(_) => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.20
                //# A server MUST treat receipt of a HANDSHAKE_DONE frame as a
                //# connection error of type PROTOCOL_VIOLATION.
                if self.local.is_server() {
                    return Err(transport::Error::PROTOCOL_VIOLATION
                        .with_reason("handshake done from client"));
                }
                self.confirm_handshake(now);
                Ok(())
            }

            frame::Frame::NewToken(token) => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
                //# A server MUST treat receipt of a NEW_TOKEN frame as a
                //# connection error of type PROTOCOL_VIOLATION.
                if self.local.is_server() {
                    return Err(
                        transport::Error::PROTOCOL_VIOLATION.with_reason("new token from client")
                    );
                }
                let ticket = Bytes::copy_from_slice(token.token.as_less_safe_slice());
                self.latest_token = Some(ticket.clone());
                if self.session_stored {
                    if let Some(cache) = &self.session_cache {
                        cache
                            .lock()
                            .expect("session cache poisoned")
                            .update_ticket(&self.path.peer_address(), ticket.clone());
                    }
                }
                self.events.on_new_token(ticket);
                Ok(())
            }
        }
    }

    fn on_ack_frame(
        &mut self,
        now: Timestamp,
        level: EncryptionLevel,
        ack_frame: frame::Ack<frame::AckRangesDecoder>,
    ) -> Result<(), transport::Error> {
        use quiver_quic_core::frame::ack::AckRanges as _;

        let ack_delay = self.peer_ack_settings.decode_ack_delay(ack_frame.ack_delay);
        let largest = ack_frame.largest_acknowledged();

        let Some(space) = space_for_level!(self, level) else {
            return Ok(());
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.1
        //# An endpoint SHOULD treat receipt of an acknowledgment for a
        //# packet it did not send as a connection error of type
        //# PROTOCOL_VIOLATION
        if largest.as_u64() >= space.generator.peek().as_u64() {
            return Err(
                transport::Error::PROTOCOL_VIOLATION.with_reason("ack of unsent packet")
            );
        }

        let outcome = {
            let ranges = ack_frame.ranges.ack_ranges();
            self.recovery
                .on_ack_received(space, largest, ack_delay, ranges, now)
        };

        for (_, info) in outcome.newly_acked {
            self.on_content_acked(info.content);
        }
        for (_, info) in outcome.lost {
            let Some(space) = space_for_level!(self, level) else {
                break;
            };
            requeue_lost(
                space,
                &mut self.streams,
                &mut self.pending,
                &mut self.path,
                info.content,
            );
        }

        // progress resets the idle clock
        self.reset_idle_timer(now);
        self.rearm_pto();
        Ok(())
    }

    fn on_content_acked(&mut self, content: smallvec::SmallVec<[SentContent; 3]>) {
        for item in content {
            match item {
                SentContent::Stream {
                    id,
                    offset,
                    len,
                    is_fin,
                } => self.streams.on_stream_data_acked(id, offset, len, is_fin),
                SentContent::Crypto { offset, len } => {
                    // crypto acks arrive on the space they were sent in;
                    // each space owns its own offsets
                    for space in [
                        self.initial_space.as_mut(),
                        self.handshake_space.as_mut(),
                        Some(&mut self.application_space),
                    ]
                    .into_iter()
                    .flatten()
                    {
                        space.crypto_stream.on_data_acked(offset, len);
                    }
                }
                SentContent::Ack { largest } => {
                    for space in [
                        self.initial_space.as_mut(),
                        self.handshake_space.as_mut(),
                        Some(&mut self.application_space),
                    ]
                    .into_iter()
                    .flatten()
                    {
                        space.ack_tracker.on_ack_acknowledged(largest);
                    }
                }
                SentContent::ResetStream { id } => self.streams.on_reset_acked(id),
                SentContent::Frame(_) | SentContent::PathChallenge => {}
                SentContent::MtuProbe { size } => {
                    self.path.mtu_mut().on_probe_acked(size);
                    let mtu = self.path.mtu().current();
                    self.recovery.on_mtu_update(mtu);
                }
            }
        }
    }

    // ===== TLS plumbing =====

    fn apply_tls_outputs(
        &mut self,
        bridge: TlsBridge,
        now: Timestamp,
    ) -> Result<(), transport::Error> {
        for (level, keys) in bridge.write_keys {
            self.keys.install_sealer(level, keys);
        }

        let had_read_keys = !bridge.read_keys.is_empty();
        for (level, keys) in bridge.read_keys {
            self.keys.install_opener(level, keys);
        }

        for (level, data) in bridge.handshake_data {
            if let Some(space) = self.space_for_level_mut(level) {
                space.crypto_stream.write(&data);
            }
        }

        if let Some(raw) = bridge.peer_transport_parameters {
            self.on_peer_transport_parameters(&raw)?;
        }

        if let Some((_, alert)) = bridge.alert {
            let error = transport::Error::crypto_error(alert);
            self.immediate_close(error, now);
            return Ok(());
        }

        if bridge.handshake_complete && !self.handshake_complete {
            self.handshake_complete = true;
            self.state = State::Connected;

            if self.local.is_server() {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-7.3
                //# the TLS handshake is considered confirmed at the server
                //# when the handshake completes
                self.pending.push_back(frame::HandshakeDone.into());
                self.confirm_handshake(now);
            }
        }

        if had_read_keys {
            self.replay_undecryptable(now);
        }

        Ok(())
    }

    fn on_peer_transport_parameters(&mut self, raw: &[u8]) -> Result<(), transport::Error> {
        let buffer = quiver_codec::DecoderBuffer::new(raw);
        let (params, _) = buffer.decode::<TransportParameters>().map_err(|_| {
            transport::Error::TRANSPORT_PARAMETER_ERROR.with_reason("malformed parameters")
        })?;
        params.validate(self.local.peer_type())?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.3
        //# An endpoint MUST treat the absence of the
        //# initial_source_connection_id transport parameter from either
        //# endpoint... as a connection error of type
        //# TRANSPORT_PARAMETER_ERROR.
        let claimed_scid = params.initial_source_connection_id.ok_or_else(|| {
            transport::Error::TRANSPORT_PARAMETER_ERROR
                .with_reason("missing initial_source_connection_id")
        })?;
        if claimed_scid != self.cids.current_remote() {
            return Err(transport::Error::TRANSPORT_PARAMETER_ERROR
                .with_reason("initial_source_connection_id mismatch"));
        }

        if self.local.is_client() {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-7.3
            //# An endpoint MUST treat the following as a connection error of
            //# type TRANSPORT_PARAMETER_ERROR or PROTOCOL_VIOLATION:
            //# *  absence of the retry_source_connection_id transport
            //#    parameter from the server after receiving a Retry packet
            let retry_scid_ok = match (self.retry_received, params.retry_source_connection_id) {
                (true, Some(_)) | (false, None) => true,
                _ => false,
            };
            if !retry_scid_ok {
                return Err(transport::Error::TRANSPORT_PARAMETER_ERROR
                    .with_reason("retry_source_connection_id mismatch"));
            }

            let claimed_odcid = params.original_destination_connection_id.ok_or_else(|| {
                transport::Error::TRANSPORT_PARAMETER_ERROR
                    .with_reason("missing original_destination_connection_id")
            })?;
            if claimed_odcid != self.original_dcid {
                return Err(transport::Error::TRANSPORT_PARAMETER_ERROR
                    .with_reason("original_destination_connection_id mismatch"));
            }
        }

        // the merge step: every interested component hears about the
        // limits it negotiates
        self.send_flow.on_max_data(params.initial_max_data);
        self.streams.on_peer_limits(
            params.initial_max_stream_data_bidi_remote,
            params.initial_max_stream_data_bidi_local,
            params.initial_max_stream_data_uni,
            params.initial_max_streams_bidi,
            params.initial_max_streams_uni,
        );
        self.recovery.rtt_mut().on_max_ack_delay(params.max_ack_delay());
        self.peer_ack_settings = ack::Settings {
            max_ack_delay: params.max_ack_delay(),
            ack_delay_exponent: params.ack_delay_exponent,
        };
        self.cids.on_peer_cid_limit(params.active_connection_id_limit);

        let merged =
            transport::parameters::merged_limits(&self.local_params, &params);
        self.idle_timeout = merged.idle_timeout;

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.6.2
        //# A server MUST NOT reduce any limits or alter any values that might
        //# be violated by the client with its 0-RTT data.
        if let Some(remembered) = self.resumed_limits.take() {
            if !remembered.is_honored_by(&params) {
                return Err(transport::Error::PROTOCOL_VIOLATION
                    .with_reason("server reduced remembered 0-RTT limits"));
            }
        }

        self.peer_params = Some(params);
        Ok(())
    }

    /// Re-feeds datagrams that arrived before their keys
    fn replay_undecryptable(&mut self, _now: Timestamp) {
        let buffered = core::mem::take(&mut self.undecryptable);
        for (when, source, mut datagram) in buffered {
            self.on_datagram(when, source, &mut datagram);
        }
    }

    fn on_retry_packet(&mut self, retry_scid: Vec<u8>, token: Option<Bytes>) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5.2
        //# A client MUST accept and process at most one Retry packet for
        //# each connection attempt.
        if self.local.is_server() || self.retry_received || !self.initial_packet_sent {
            return;
        }
        let Some(token) = token else {
            return;
        };
        let Ok(new_dcid) = ConnectionId::try_from_bytes(&retry_scid) else {
            return;
        };

        self.retry_received = true;
        self.initial_token = token;

        // all Initial traffic restarts against the new connection ID
        self.cids.update_initial_remote(new_dcid);
        self.keys.install_sealer(
            EncryptionLevel::Initial,
            self.initial_keys.sealer(new_dcid.as_bytes(), self.local),
        );
        self.keys.install_opener(
            EncryptionLevel::Initial,
            self.initial_keys.opener(new_dcid.as_bytes(), self.local),
        );

        if let Some(space) = self.initial_space.as_mut() {
            // what was sent is gone; retransmit the ClientHello
            for (_, info) in space.sent.drain() {
                for item in info.content {
                    if let SentContent::Crypto { offset, len } = item {
                        space.crypto_stream.on_data_lost(offset, len);
                    }
                }
            }
        }
    }

    fn confirm_handshake(&mut self, now: Timestamp) {
        if self.handshake_confirmed {
            return;
        }
        self.handshake_confirmed = true;
        self.state = State::Connected;
        self.recovery.on_handshake_confirmed();
        self.path.on_validated();
        self.store_session();
        self.events.on_handshake_confirmed();

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.2
        //# An endpoint MUST discard its Handshake keys when the TLS
        //# handshake is confirmed
        self.discard_handshake_space();
        self.discard_initial_space();
        self.rearm_pto();
        let _ = now;
    }

    /// Writes the completed handshake into the session cache, once
    fn store_session(&mut self) {
        if self.session_stored || !self.local.is_client() {
            return;
        }
        let Some(cache) = &self.session_cache else {
            return;
        };
        let Some(params) = &self.peer_params else {
            return;
        };

        let session = Session {
            ticket: self.latest_token.clone().unwrap_or_default(),
            transport_params_summary: TransportParametersSummary::of(params),
            early_data_limit: params.initial_max_data.as_u64(),
        };
        cache
            .lock()
            .expect("session cache poisoned")
            .insert(self.path.peer_address(), session);
        self.session_stored = true;
    }

    fn discard_initial_space(&mut self) {
        if let Some(mut space) = self.initial_space.take() {
            self.recovery.on_space_discarded(&mut space.sent);
            self.keys.discard(EncryptionLevel::Initial);
        }
    }

    fn discard_handshake_space(&mut self) {
        if let Some(mut space) = self.handshake_space.take() {
            self.recovery.on_space_discarded(&mut space.sent);
            self.keys.discard(EncryptionLevel::Handshake);
        }
    }

    /// The level ordinary traffic is sent at right now
    ///
    /// Tracks handshake progress rather than bare key availability: a
    /// level stays current while it still has handshake data to move,
    /// and 0-RTT keys never become current.
    fn current_encryption_level(&self) -> EncryptionLevel {
        if let Some(space) = &self.initial_space {
            let handshake_ready = self.keys.has_sealer(EncryptionLevel::Handshake);
            if space.crypto_stream.has_transmission_interest() || !handshake_ready {
                return EncryptionLevel::Initial;
            }
        }
        if let Some(space) = &self.handshake_space {
            if space.crypto_stream.has_transmission_interest() || !self.handshake_complete {
                return EncryptionLevel::Handshake;
            }
        }
        EncryptionLevel::Application
    }

    fn reset_idle_timer(&mut self, now: Timestamp) {
        if let Some(timeout) = self.idle_timeout {
            self.idle_timer.set(now + timeout);
        }
    }

    fn rearm_pto(&mut self) {
        let spaces: Vec<&PacketSpace> = [
            self.initial_space.as_ref(),
            self.handshake_space.as_ref(),
            Some(&self.application_space),
        ]
        .into_iter()
        .flatten()
        .collect();
        self.recovery.arm_pto(&spaces);
    }
}

/// Restores a lost packet's content to the transmission queues
fn requeue_lost(
    space: &mut PacketSpace,
    streams: &mut StreamManager,
    pending: &mut VecDeque<PendingFrame>,
    path: &mut PathManager,
    content: smallvec::SmallVec<[SentContent; 3]>,
) {
    for item in content {
        match item {
            SentContent::Stream {
                id,
                offset,
                len,
                is_fin,
            } => streams.on_stream_data_lost(id, offset, len, is_fin),
            SentContent::Crypto { offset, len } => {
                space.crypto_stream.on_data_lost(offset, len);
            }
            SentContent::ResetStream { id } => streams.on_reset_lost(id),
            SentContent::Frame(frame) => pending.push_back(frame),
            SentContent::Ack { .. } => {
                // a lost ACK needs no action; newer ACKs supersede it
            }
            SentContent::PathChallenge => {
                // the path manager retries on its own schedule
            }
            SentContent::MtuProbe { size } => path.mtu_mut().on_probe_lost(size),
        }
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
//# Table 3 lists... the types of packets that each frame type could
//# appear in
fn frame_allowed_at(level: EncryptionLevel, frame: &FrameRef) -> Result<(), transport::Error> {
    use frame::Frame::*;

    let allowed = match level {
        EncryptionLevel::Initial | EncryptionLevel::Handshake => matches!(
            frame,
            Padding(_) | Ping(_) | Ack(_) | Crypto(_) | ConnectionClose(_)
        ),
        //= https://www.rfc-editor.org/rfc/rfc9000#section-12.5
        //# Note that it is not possible to send the following frames in
        //# 0-RTT packets for various reasons: ACK, CRYPTO,
        //# HANDSHAKE_DONE, NEW_TOKEN, PATH_RESPONSE, and
        //# RETIRE_CONNECTION_ID.
        EncryptionLevel::EarlyData => !matches!(
            frame,
            Ack(_) | Crypto(_) | HandshakeDone(_) | NewToken(_) | PathResponse(_)
                | RetireConnectionId(_)
        ),
        EncryptionLevel::Application => true,
    };

    if allowed {
        Ok(())
    } else {
        Err(transport::Error::PROTOCOL_VIOLATION.with_reason("frame not allowed at this level"))
    }
}

#[cfg(test)]
mod tests;
