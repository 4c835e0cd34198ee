// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests driving a client and a server connection against
//! each other with the scripted handshake engine and null crypto

use super::*;
use crate::{
    event::StreamReadEvent,
    session::{Session, SessionCache, TransportParametersSummary},
    testing::{SharedSink, TestEngine},
};
use core::time::Duration;
use quiver_quic_core::{
    crypto::testing as crypto_testing, random::testing as random_testing,
    recovery::NewReno,
};
use std::sync::{Arc, Mutex};

const CLIENT_ADDR: &str = "192.0.2.10:4000";
const SERVER_ADDR: &str = "192.0.2.20:443";

fn config(role: endpoint::Type, seed: u8, peer: SocketAddr, sink: SharedSink) -> Config {
    Config {
        endpoint_type: role,
        limits: Limits::default(),
        tls: Box::new(TestEngine::new(role)),
        initial_keys: Box::new(crypto_testing::InitialKeyProvider),
        congestion: Box::new(NewReno::new(1200)),
        random: Box::new(random_testing::Generator::with_seed(seed)),
        events: Box::new(sink),
        peer_address: peer,
        cid_hash_key: (11, 13),
        session_cache: None,
        session: None,
    }
}

struct Pair {
    client: Connection,
    server: Connection,
    client_sink: SharedSink,
    server_sink: SharedSink,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    now: Timestamp,
}

impl Pair {
    /// Builds both endpoints and completes the handshake
    fn handshaken() -> Self {
        Self::handshaken_with(None)
    }

    fn handshaken_with(client_session_cache: Option<Arc<Mutex<SessionCache>>>) -> Self {
        let mut pair = Self::start(client_session_cache);
        pair.pump();
        assert!(pair.client.is_handshake_confirmed(), "client not confirmed");
        assert!(pair.server.is_handshake_confirmed(), "server not confirmed");
        pair
    }

    fn start(client_session_cache: Option<Arc<Mutex<SessionCache>>>) -> Self {
        let client_addr: SocketAddr = CLIENT_ADDR.parse().unwrap();
        let server_addr: SocketAddr = SERVER_ADDR.parse().unwrap();
        let now = Timestamp::from_millis(1_000);

        let client_sink = SharedSink::default();
        let mut client_config = config(
            endpoint::Type::Client,
            0,
            server_addr,
            client_sink.clone(),
        );
        client_config.session_cache = client_session_cache;
        let mut client = Connection::new_client(client_config, now).unwrap();

        // the client's first datagram carries the header fields which
        // key the server connection
        let mut buffer = [0u8; 1500];
        let first = match client.generate_outbound(now, &mut buffer) {
            Outcome::Sent { len, .. } => buffer[..len].to_vec(),
            other => panic!("client produced {other:?} instead of the first flight"),
        };

        let (dcid, scid) = {
            let mut copy = first.clone();
            let decoder = quiver_codec::DecoderBufferMut::new(&mut copy);
            let (packet, _) = ProtectedPacket::decode(decoder, 8).unwrap();
            match &packet {
                ProtectedPacket::Initial(initial) => (
                    initial.destination_connection_id().to_vec(),
                    initial.source_connection_id().to_vec(),
                ),
                other => panic!("expected an initial packet, got {other:?}"),
            }
        };

        let server_sink = SharedSink::default();
        let mut server = Connection::new_server(
            config(
                endpoint::Type::Server,
                100,
                client_addr,
                server_sink.clone(),
            ),
            &dcid,
            &scid,
            now,
        )
        .unwrap();

        let mut first = first;
        server.on_datagram(now, client_addr, &mut first);

        Self {
            client,
            server,
            client_sink,
            server_sink,
            client_addr,
            server_addr,
            now,
        }
    }

    /// Shuttles datagrams both ways until both sides go quiet
    fn pump(&mut self) {
        for _ in 0..64 {
            let mut progressed = false;
            progressed |= self.flush_client();
            progressed |= self.flush_server();
            if !progressed {
                return;
            }
        }
        panic!("pump did not converge");
    }

    fn flush_client(&mut self) -> bool {
        let mut progressed = false;
        loop {
            let mut buffer = [0u8; 1500];
            match self.client.generate_outbound(self.now, &mut buffer) {
                Outcome::Sent { len, .. } => {
                    progressed = true;
                    self.server
                        .on_datagram(self.now, self.client_addr, &mut buffer[..len]);
                }
                Outcome::NextPeriod(release) => {
                    self.now = release;
                }
                Outcome::AllSendDone => return progressed,
            }
        }
    }

    fn flush_server(&mut self) -> bool {
        let mut progressed = false;
        loop {
            let mut buffer = [0u8; 1500];
            match self.server.generate_outbound(self.now, &mut buffer) {
                Outcome::Sent { len, .. } => {
                    progressed = true;
                    self.client
                        .on_datagram(self.now, self.server_addr, &mut buffer[..len]);
                }
                Outcome::NextPeriod(release) => {
                    self.now = release;
                }
                Outcome::AllSendDone => return progressed,
            }
        }
    }

    fn advance(&mut self, duration: Duration) {
        self.now = self.now + duration;
        self.client.on_timer(self.now);
        self.server.on_timer(self.now);
    }

    /// Registers a capture callback on a server stream
    fn capture_server_stream(&mut self, id: StreamId) -> Arc<Mutex<Vec<StreamReadEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        self.server
            .set_read_callback(
                id,
                Box::new(move |event| sink.lock().unwrap().push(event)),
            )
            .unwrap();
        events
    }
}

fn collect_data(events: &Arc<Mutex<Vec<StreamReadEvent>>>) -> Vec<u8> {
    let mut data = Vec::new();
    for event in events.lock().unwrap().iter() {
        if let StreamReadEvent::Data { data: chunk, .. } = event {
            data.extend_from_slice(chunk);
        }
    }
    data
}

#[test]
fn handshake_completes_test() {
    let pair = Pair::handshaken();
    assert_eq!(pair.client_sink.recording().handshake_confirmed, 1);
    assert_eq!(pair.server_sink.recording().handshake_confirmed, 1);
    assert!(pair.client_sink.recording().closed.is_empty());
    assert!(pair.server_sink.recording().closed.is_empty());

    // both sides saw the other's transport parameters
    assert!(pair.client.peer_parameters().is_some());
    assert!(pair.server.peer_parameters().is_some());
}

#[test]
fn stream_data_round_trip_test() {
    let mut pair = Pair::handshaken();

    let id = pair.client.make_stream(StreamType::Bidirectional).unwrap();
    assert_eq!(pair.client.stream_send(id, b"hello").unwrap(), 5);
    pair.pump();

    // the server saw the stream open and buffered the data until a
    // reader appeared
    assert_eq!(pair.server_sink.recording().opened_streams, vec![id]);
    let events = pair.capture_server_stream(id);
    assert_eq!(collect_data(&events), b"hello");

    // more data plus FIN completes the stream
    assert_eq!(pair.client.stream_send(id, b" world").unwrap(), 6);
    pair.client.stream_close(id).unwrap();
    pair.pump();

    assert_eq!(collect_data(&events), b"hello world");
    let last = events.lock().unwrap().last().cloned().unwrap();
    assert!(matches!(last, StreamReadEvent::Data { is_fin: true, .. }));
}

#[test]
fn lost_datagram_is_retransmitted_test() {
    let mut pair = Pair::handshaken();

    let id = pair.client.make_stream(StreamType::Bidirectional).unwrap();
    pair.client.stream_send(id, b"AAAA").unwrap();
    pair.pump();
    let events = pair.capture_server_stream(id);
    assert_eq!(collect_data(&events), b"AAAA");

    // the next transmission disappears on the wire
    pair.client.stream_send(id, b"BBBB").unwrap();
    let mut buffer = [0u8; 1500];
    match pair.client.generate_outbound(pair.now, &mut buffer) {
        Outcome::Sent { .. } => {}
        other => panic!("expected a transmission, got {other:?}"),
    }

    // the probe timeout forces recovery
    pair.advance(Duration::from_secs(2));
    pair.pump();
    pair.advance(Duration::from_secs(2));
    pair.pump();

    assert_eq!(collect_data(&events), b"AAAABBBB");
}

#[test]
fn path_migration_test() {
    let mut pair = Pair::handshaken();
    let new_client_addr: SocketAddr = "198.51.100.99:7777".parse().unwrap();

    // traffic arrives from a new address
    let id = pair.client.make_stream(StreamType::Bidirectional).unwrap();
    pair.client.stream_send(id, b"migrate").unwrap();
    let mut buffer = [0u8; 1500];
    let len = match pair.client.generate_outbound(pair.now, &mut buffer) {
        Outcome::Sent { len, .. } => len,
        other => panic!("expected a transmission, got {other:?}"),
    };
    pair.server
        .on_datagram(pair.now, new_client_addr, &mut buffer[..len]);

    // the server probes the candidate path
    let mut buffer = [0u8; 1500];
    let (len, destination) = match pair.server.generate_outbound(pair.now, &mut buffer) {
        Outcome::Sent { len, destination } => (len, destination),
        other => panic!("expected a path challenge, got {other:?}"),
    };
    assert_eq!(destination, new_client_addr);
    pair.client
        .on_datagram(pair.now, pair.server_addr, &mut buffer[..len]);

    // the client echoes the challenge; the server promotes the path
    let mut buffer = [0u8; 1500];
    let len = match pair.client.generate_outbound(pair.now, &mut buffer) {
        Outcome::Sent { len, .. } => len,
        other => panic!("expected a path response, got {other:?}"),
    };
    pair.server
        .on_datagram(pair.now, new_client_addr, &mut buffer[..len]);

    assert_eq!(pair.server.peer_address(), new_client_addr);
}

#[test]
fn idle_timeout_closes_silently_test() {
    let mut pair = Pair::handshaken();

    pair.advance(Duration::from_secs(31));
    assert!(pair.client.is_closed());
    assert!(pair.server.is_closed());

    let closed = pair.client_sink.recording().closed.clone();
    assert_eq!(closed, vec![core_connection::Error::IdleTimeout]);
}

#[test]
fn application_close_test() {
    let mut pair = Pair::handshaken();

    pair.client
        .close(application::Error::new(VarInt::from_u8(42)), pair.now);
    pair.pump();

    // both sides observed the close exactly once
    let client_closed = pair.client_sink.recording().closed.clone();
    let server_closed = pair.server_sink.recording().closed.clone();
    assert_eq!(client_closed.len(), 1);
    assert_eq!(server_closed.len(), 1);
    assert!(matches!(
        server_closed[0],
        core_connection::Error::Application {
            initiator: core_connection::error::Initiator::Remote,
            ..
        }
    ));

    // the draining period ends in the terminal state
    pair.advance(Duration::from_secs(10));
    assert!(pair.client.is_closed());
    assert!(pair.server.is_closed());
}

#[test]
fn duplicate_datagram_is_harmless_test() {
    let mut pair = Pair::handshaken();

    let id = pair.client.make_stream(StreamType::Bidirectional).unwrap();
    pair.client.stream_send(id, b"once").unwrap();
    let mut buffer = [0u8; 1500];
    let len = match pair.client.generate_outbound(pair.now, &mut buffer) {
        Outcome::Sent { len, .. } => len,
        other => panic!("expected a transmission, got {other:?}"),
    };

    let mut copy = buffer[..len].to_vec();
    pair.server
        .on_datagram(pair.now, pair.client_addr, &mut buffer[..len]);
    // replayed verbatim
    pair.server.on_datagram(pair.now, pair.client_addr, &mut copy);

    let events = pair.capture_server_stream(id);
    assert_eq!(collect_data(&events), b"once");
    pair.pump();
    assert!(pair.server_sink.recording().closed.is_empty());
}


#[test]
fn session_stored_on_handshake_confirmation_test() {
    let cache = Arc::new(Mutex::new(SessionCache::new(4)));
    let pair = Pair::handshaken_with(Some(cache.clone()));

    // exactly one entry for the server, carrying its advertised limits
    let mut cache = cache.lock().unwrap();
    assert_eq!(cache.len(), 1);
    let session = cache.get(&pair.server_addr).unwrap();
    let advertised = Limits::default().initial_max_data;
    assert_eq!(session.transport_params_summary.initial_max_data, advertised);
    assert_eq!(session.early_data_limit, advertised.as_u64());
}

#[test]
fn resumed_session_seeds_early_data_test() {
    let server_addr: SocketAddr = SERVER_ADDR.parse().unwrap();
    let now = Timestamp::from_millis(1_000);
    let sink = SharedSink::default();

    // without a cached session, the peer's limits are unknown and no
    // stream may open before the handshake answers
    let mut cold =
        Connection::new_client(config(endpoint::Type::Client, 0, server_addr, sink.clone()), now)
            .unwrap();
    assert!(cold.make_stream(StreamType::Bidirectional).is_err());

    let summary = TransportParametersSummary {
        initial_max_data: VarInt::from_u32(5_000),
        initial_max_stream_data_bidi_local: VarInt::from_u32(1_000),
        initial_max_stream_data_bidi_remote: VarInt::from_u32(1_000),
        initial_max_stream_data_uni: VarInt::from_u32(1_000),
        initial_max_streams_bidi: VarInt::from_u8(4),
        initial_max_streams_uni: VarInt::from_u8(4),
        active_connection_id_limit: VarInt::from_u8(2),
        disable_active_migration: false,
    };
    let mut resuming_config = config(endpoint::Type::Client, 0, server_addr, sink);
    resuming_config.session = Some(Session {
        ticket: Bytes::from_static(b"resume-token"),
        transport_params_summary: summary,
        early_data_limit: 2_048,
    });
    let mut client = Connection::new_client(resuming_config, now).unwrap();

    // the remembered limits admit early stream data right away
    let id = client.make_stream(StreamType::Bidirectional).unwrap();
    assert_eq!(client.stream_send(id, b"early").unwrap(), 5);

    // and the cached ticket rides in the Initial header
    let mut buffer = [0u8; 1500];
    let len = match client.generate_outbound(now, &mut buffer) {
        Outcome::Sent { len, .. } => len,
        other => panic!("expected the first flight, got {other:?}"),
    };
    let decoder = quiver_codec::DecoderBufferMut::new(&mut buffer[..len]);
    let (packet, _) = ProtectedPacket::decode(decoder, 8).unwrap();
    match packet {
        ProtectedPacket::Initial(initial) => {
            assert_eq!(initial.token(), &b"resume-token"[..]);
        }
        other => panic!("expected an initial packet, got {other:?}"),
    }
}
