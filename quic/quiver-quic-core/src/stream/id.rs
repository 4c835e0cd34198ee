// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{endpoint, varint::VarInt};
use core::fmt;
use quiver_codec::{Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# The least significant bit (0x01) of the stream ID identifies the
//# initiator of the stream.  Client-initiated streams have even-numbered
//# stream IDs (with the bit set to 0), and server-initiated streams have
//# odd-numbered stream IDs (with the bit set to 1).

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# The second least significant bit (0x02) of the stream ID
//# distinguishes between bidirectional streams (with the bit set to 0)
//# and unidirectional streams (with the bit set to 1).

const INITIATOR_BIT: u64 = 0x01;
const UNIDIRECTIONAL_BIT: u64 = 0x02;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamType {
    Bidirectional,
    Unidirectional,
}

impl StreamType {
    #[inline]
    pub fn is_bidirectional(self) -> bool {
        matches!(self, Self::Bidirectional)
    }
}

/// A stream identifier
///
/// The two low bits encode the initiator and the directionality; the
/// remaining bits are a per-kind ordinal.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(VarInt);

impl StreamId {
    #[inline]
    pub const fn from_varint(id: VarInt) -> Self {
        Self(id)
    }

    /// Builds the `nth` stream id of the given initiator and type
    #[inline]
    pub fn nth(initiator: endpoint::Type, stream_type: StreamType, n: u64) -> Option<Self> {
        let ordinal = VarInt::new(n).ok()?.checked_shl(2)?;
        let mut id = ordinal.as_u64();
        if matches!(initiator, endpoint::Type::Server) {
            id |= INITIATOR_BIT;
        }
        if matches!(stream_type, StreamType::Unidirectional) {
            id |= UNIDIRECTIONAL_BIT;
        }
        // setting the low bits cannot overflow after the shift check
        Some(Self(unsafe { VarInt::new_unchecked(id) }))
    }

    #[inline]
    pub const fn as_varint(self) -> VarInt {
        self.0
    }

    #[inline]
    pub fn initiator(self) -> endpoint::Type {
        if self.0.as_u64() & INITIATOR_BIT == 0 {
            endpoint::Type::Client
        } else {
            endpoint::Type::Server
        }
    }

    #[inline]
    pub fn stream_type(self) -> StreamType {
        if self.0.as_u64() & UNIDIRECTIONAL_BIT == 0 {
            StreamType::Bidirectional
        } else {
            StreamType::Unidirectional
        }
    }

    /// The stream's ordinal within its (initiator, type) kind
    #[inline]
    pub fn ordinal(self) -> u64 {
        self.0.as_u64() >> 2
    }

    /// Whether `local_endpoint` is allowed to send data on this stream
    #[inline]
    pub fn is_sendable(self, local_endpoint: endpoint::Type) -> bool {
        match self.stream_type() {
            StreamType::Bidirectional => true,
            StreamType::Unidirectional => self.initiator() == local_endpoint,
        }
    }

    /// Whether `local_endpoint` is allowed to receive data on this stream
    #[inline]
    pub fn is_receivable(self, local_endpoint: endpoint::Type) -> bool {
        match self.stream_type() {
            StreamType::Bidirectional => true,
            StreamType::Unidirectional => self.initiator() != local_endpoint,
        }
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamId")
            .field("id", &self.0.as_u64())
            .field("initiator", &self.initiator())
            .field("type", &self.stream_type())
            .finish()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<StreamId> for VarInt {
    #[inline]
    fn from(id: StreamId) -> Self {
        id.0
    }
}

impl From<VarInt> for StreamId {
    #[inline]
    fn from(id: VarInt) -> Self {
        Self(id)
    }
}

impl EncoderValue for StreamId {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        self.0.encode(encoder)
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.0.encoding_size()
    }
}

/// Allocates locally-initiated stream ids in order
///
/// One generator exists per stream type; ids are `(counter << 2) |
/// type_bit | initiator_bit`.
#[derive(Debug)]
pub struct StreamIdGenerator {
    local_endpoint: endpoint::Type,
    stream_type: StreamType,
    next_ordinal: u64,
}

impl StreamIdGenerator {
    #[inline]
    pub fn new(local_endpoint: endpoint::Type, stream_type: StreamType) -> Self {
        Self {
            local_endpoint,
            stream_type,
            next_ordinal: 0,
        }
    }

    /// The number of streams opened so far
    #[inline]
    pub fn opened(&self) -> u64 {
        self.next_ordinal
    }

    /// Returns the next stream id, or `None` once the id space is
    /// exhausted
    #[inline]
    pub fn next_id(&mut self) -> Option<StreamId> {
        let id = StreamId::nth(self.local_endpoint, self.stream_type, self.next_ordinal)?;
        self.next_ordinal += 1;
        Some(id)
    }
}
