// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! 0-RTT session cache
//!
//! Stores what a client needs to attempt early data on the next
//! connection to the same peer. The connection stores an entry once per
//! completed handshake; whether a stored session may actually be used
//! is the caller's policy — the cache only stores and evicts.

use bytes::Bytes;
use quiver_quic_core::{transport::parameters::TransportParameters, varint::VarInt};
use std::collections::VecDeque;
use std::net::SocketAddr;

//= https://www.rfc-editor.org/rfc/rfc9001#section-4.6.1
//# A client that attempts to send 0-RTT data MUST remember all other
//# transport parameters used by the server that it is able to process.
//# The transport parameters that the server advertises during connection
//# establishment apply to all connections that are resumed using the
//# keying material established during that handshake.

/// The subset of the server's transport parameters which bound what a
/// resumed connection may do before the new handshake answers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportParametersSummary {
    pub initial_max_data: VarInt,
    pub initial_max_stream_data_bidi_local: VarInt,
    pub initial_max_stream_data_bidi_remote: VarInt,
    pub initial_max_stream_data_uni: VarInt,
    pub initial_max_streams_bidi: VarInt,
    pub initial_max_streams_uni: VarInt,
    pub active_connection_id_limit: VarInt,
    pub disable_active_migration: bool,
}

impl TransportParametersSummary {
    pub fn of(parameters: &TransportParameters) -> Self {
        Self {
            initial_max_data: parameters.initial_max_data,
            initial_max_stream_data_bidi_local: parameters.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: parameters.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: parameters.initial_max_stream_data_uni,
            initial_max_streams_bidi: parameters.initial_max_streams_bidi,
            initial_max_streams_uni: parameters.initial_max_streams_uni,
            active_connection_id_limit: parameters.active_connection_id_limit,
            disable_active_migration: parameters.disable_active_migration,
        }
    }

    /// Whether `current` honors every remembered limit
    ///
    /// A server which accepted early data must not advertise less than
    /// the client remembered; a reduction invalidates what 0-RTT may
    /// already have sent.
    pub fn is_honored_by(&self, current: &TransportParameters) -> bool {
        current.initial_max_data >= self.initial_max_data
            && current.initial_max_stream_data_bidi_local >= self.initial_max_stream_data_bidi_local
            && current.initial_max_stream_data_bidi_remote
                >= self.initial_max_stream_data_bidi_remote
            && current.initial_max_stream_data_uni >= self.initial_max_stream_data_uni
            && current.initial_max_streams_bidi >= self.initial_max_streams_bidi
            && current.initial_max_streams_uni >= self.initial_max_streams_uni
    }
}

/// Everything remembered from one completed handshake
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// The NEW_TOKEN blob to echo in the next connection's Initial
    /// packets, opaque to the transport
    pub ticket: Bytes,
    /// The server limits a resumed connection starts under
    pub transport_params_summary: TransportParametersSummary,
    /// How much early data the server will accept
    pub early_data_limit: u64,
}

/// An LRU map of peer address → session
#[derive(Debug)]
pub struct SessionCache {
    entries: VecDeque<(SocketAddr, Session)>,
    capacity: usize,
}

impl SessionCache {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Stores a session, displacing any previous entry for the address
    /// and evicting the least recently used entry when full
    pub fn insert(&mut self, peer: SocketAddr, session: Session) {
        self.entries.retain(|(addr, _)| *addr != peer);
        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front((peer, session));
    }

    /// Looks up a session, refreshing its recency
    pub fn get(&mut self, peer: &SocketAddr) -> Option<&Session> {
        let index = self.entries.iter().position(|(addr, _)| addr == peer)?;
        let entry = self.entries.remove(index).expect("index in range");
        self.entries.push_front(entry);
        self.entries.front().map(|(_, session)| session)
    }

    /// Replaces the ticket of an existing entry, e.g. when a NEW_TOKEN
    /// arrives after the session was stored
    pub fn update_ticket(&mut self, peer: &SocketAddr, ticket: Bytes) -> bool {
        for (addr, session) in self.entries.iter_mut() {
            if addr == peer {
                session.ticket = ticket;
                return true;
            }
        }
        false
    }

    pub fn remove(&mut self, peer: &SocketAddr) {
        self.entries.retain(|(addr, _)| addr != peer);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("198.51.100.7:{port}").parse().unwrap()
    }

    fn summary(initial_max_data: u64) -> TransportParametersSummary {
        TransportParametersSummary {
            initial_max_data: VarInt::new(initial_max_data).unwrap(),
            initial_max_stream_data_bidi_local: VarInt::ZERO,
            initial_max_stream_data_bidi_remote: VarInt::ZERO,
            initial_max_stream_data_uni: VarInt::ZERO,
            initial_max_streams_bidi: VarInt::ZERO,
            initial_max_streams_uni: VarInt::ZERO,
            active_connection_id_limit: VarInt::from_u8(2),
            disable_active_migration: false,
        }
    }

    fn session(tag: u8) -> Session {
        Session {
            ticket: Bytes::copy_from_slice(&[tag]),
            transport_params_summary: summary(1024),
            early_data_limit: 1024,
        }
    }

    #[test]
    fn lru_eviction_test() {
        let mut cache = SessionCache::new(2);
        cache.insert(addr(1), session(1));
        cache.insert(addr(2), session(2));

        // touching address 1 makes address 2 the eviction candidate
        cache.get(&addr(1)).unwrap();
        cache.insert(addr(3), session(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&addr(2)).is_none());
        assert!(cache.get(&addr(1)).is_some());
        assert!(cache.get(&addr(3)).is_some());
    }

    #[test]
    fn reinsert_replaces_test() {
        let mut cache = SessionCache::new(2);
        cache.insert(addr(1), session(1));
        cache.insert(addr(1), session(9));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&addr(1)).unwrap().ticket[..], [9]);
    }

    #[test]
    fn update_ticket_test() {
        let mut cache = SessionCache::new(2);
        assert!(!cache.update_ticket(&addr(1), Bytes::from_static(b"late")));

        cache.insert(addr(1), session(1));
        assert!(cache.update_ticket(&addr(1), Bytes::from_static(b"late")));
        assert_eq!(&cache.get(&addr(1)).unwrap().ticket[..], b"late");
    }

    #[test]
    fn summary_extraction_test() {
        let parameters = TransportParameters {
            initial_max_data: VarInt::from_u32(5000),
            initial_max_streams_bidi: VarInt::from_u8(7),
            ..Default::default()
        };
        let summary = TransportParametersSummary::of(&parameters);
        assert_eq!(summary.initial_max_data, VarInt::from_u32(5000));
        assert_eq!(summary.initial_max_streams_bidi, VarInt::from_u8(7));

        // a later advertisement below the remembered limits is a
        // violation
        assert!(summary.is_honored_by(&parameters));
        let reduced = TransportParameters {
            initial_max_data: VarInt::from_u32(4000),
            ..parameters
        };
        assert!(!summary.is_honored_by(&reduced));
    }
}
