// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use quiver_quic_core::{application, connection, stream::StreamId};

/// The connection's one outward-facing notification surface
///
/// Components never hold callbacks into each other; everything the
/// owner of a connection needs to observe arrives through this sink,
/// invoked by the connection while it drains its internal queues.
pub trait ConnectionEventSink {
    /// The connection reached its terminal state; fired exactly once
    fn on_connection_closed(&mut self, error: connection::Error);

    /// The handshake completed and (for a client) HANDSHAKE_DONE arrived
    fn on_handshake_confirmed(&mut self) {}

    /// The peer opened a stream
    fn on_stream_opened(&mut self, id: StreamId) {
        let _ = id;
    }

    /// The peer reset a stream
    fn on_stream_reset(&mut self, id: StreamId, error: application::Error) {
        let _ = (id, error);
    }

    /// A locally-issued connection ID became active and should be added
    /// to the listener's routing table
    fn on_connection_id_issued(&mut self, hash: u64) {
        let _ = hash;
    }

    /// A locally-issued connection ID was retired by the peer and can be
    /// removed from the routing table
    fn on_connection_id_retired(&mut self, hash: u64) {
        let _ = hash;
    }

    /// The server handed us a token for a future connection
    fn on_new_token(&mut self, token: Bytes) {
        let _ = token;
    }
}

/// Per-stream read delivery
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamReadEvent {
    /// A newly contiguous run of bytes starting at `offset`
    Data {
        offset: u64,
        data: Bytes,
        is_fin: bool,
    },
    /// The peer reset the stream
    Reset(application::Error),
}

pub type ReadCallback = Box<dyn FnMut(StreamReadEvent) + Send>;
