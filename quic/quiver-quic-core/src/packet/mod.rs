// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! QUIC packets (RFC 9000 §17)
//!
//! A received datagram is split into `ProtectedPacket`s: headers are
//! parsed but packet numbers and payloads are still protected. Once the
//! right keys are known, `open` removes header protection, expands the
//! packet number, and opens the AEAD, yielding a `CleartextPacket` whose
//! payload is ready for frame decoding.

pub mod encoding;
pub mod handshake;
pub mod initial;
pub mod long;
pub mod number;
pub mod retry;
pub mod short;
pub mod version_negotiation;
pub mod zero_rtt;

use crate::{
    crypto::{EncryptionLevel, Error as CryptoError, KeyPair},
    packet::number::{PacketNumber, PacketNumberSpace},
};
use quiver_codec::{DecoderBuffer, DecoderBufferMut, DecoderError};

pub use handshake::ProtectedHandshake;
pub use initial::ProtectedInitial;
pub use retry::ProtectedRetry;
pub use short::ProtectedShort;
pub use version_negotiation::ProtectedVersionNegotiation;
pub use zero_rtt::ProtectedZeroRtt;

//= https://www.rfc-editor.org/rfc/rfc9000#section-15
//# Version 1 of QUIC uses the version value 0x00000001.
pub const VERSION: u32 = 0x0000_0001;

/// A parsed packet whose payload is still protected
#[derive(Debug)]
pub enum ProtectedPacket<'a> {
    Initial(ProtectedInitial<'a>),
    ZeroRtt(ProtectedZeroRtt<'a>),
    Handshake(ProtectedHandshake<'a>),
    Retry(ProtectedRetry<'a>),
    Short(ProtectedShort<'a>),
    VersionNegotiation(ProtectedVersionNegotiation<'a>),
}

impl<'a> ProtectedPacket<'a> {
    /// Splits one packet off the front of a datagram
    ///
    /// `short_dcid_len` is the length of the connection IDs this
    /// endpoint issues, required to frame short headers.
    pub fn decode(
        buffer: DecoderBufferMut<'a>,
        short_dcid_len: usize,
    ) -> Result<(ProtectedPacket<'a>, DecoderBufferMut<'a>), DecoderError> {
        let first_byte = buffer.peek_byte(0)?;

        if first_byte & long::FORM_BIT == long::FORM_BIT {
            long::decode_packet(buffer)
        } else {
            let (packet, remaining) = short::ProtectedShort::decode(buffer, short_dcid_len)?;
            Ok((ProtectedPacket::Short(packet), remaining))
        }
    }

    /// The encryption level required to open this packet, if any
    #[inline]
    pub fn encryption_level(&self) -> Option<EncryptionLevel> {
        match self {
            Self::Initial(_) => Some(EncryptionLevel::Initial),
            Self::ZeroRtt(_) => Some(EncryptionLevel::EarlyData),
            Self::Handshake(_) => Some(EncryptionLevel::Handshake),
            Self::Short(_) => Some(EncryptionLevel::Application),
            Self::Retry(_) | Self::VersionNegotiation(_) => None,
        }
    }

    /// The destination connection ID carried by the header
    #[inline]
    pub fn destination_connection_id(&self) -> &[u8] {
        match self {
            Self::Initial(packet) => packet.destination_connection_id(),
            Self::ZeroRtt(packet) => packet.destination_connection_id(),
            Self::Handshake(packet) => packet.destination_connection_id(),
            Self::Retry(packet) => packet.destination_connection_id(),
            Self::Short(packet) => packet.destination_connection_id(),
            Self::VersionNegotiation(packet) => packet.destination_connection_id(),
        }
    }

    /// Opens the packet with the keys for its level
    pub fn open(
        self,
        opener: &KeyPair,
        largest_received: Option<PacketNumber>,
    ) -> Result<CleartextPacket<'a>, CryptoError> {
        match self {
            Self::Initial(packet) => packet.open(opener, largest_received),
            Self::ZeroRtt(packet) => packet.open(opener, largest_received),
            Self::Handshake(packet) => packet.open(opener, largest_received),
            Self::Short(packet) => packet.open(opener, largest_received),
            Self::Retry(_) | Self::VersionNegotiation(_) => {
                Err(CryptoError::Internal("packet type carries no payload"))
            }
        }
    }
}

/// An opened packet: expanded packet number plus decrypted payload
pub struct CleartextPacket<'a> {
    pub packet_number: PacketNumber,
    pub payload: DecoderBuffer<'a>,
    pub encryption_level: EncryptionLevel,
}

impl<'a> core::fmt::Debug for CleartextPacket<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("CleartextPacket")
            .field("packet_number", &self.packet_number)
            .field("encryption_level", &self.encryption_level)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Shared open path: unprotect the header, expand the packet number,
/// open the AEAD
pub(crate) fn open_protected(
    opener: &KeyPair,
    level: EncryptionLevel,
    bytes: &mut [u8],
    pn_offset: usize,
    largest_received: Option<PacketNumber>,
) -> Result<(PacketNumber, usize, usize), CryptoError> {
    let space = level.packet_number_space();
    let truncated =
        crate::crypto::header_protection::remove(&*opener.header_key, space, bytes, pn_offset)?;

    let largest = largest_received
        .unwrap_or_else(|| space.new_packet_number(crate::varint::VarInt::ZERO));
    let packet_number = truncated.expand(largest);

    let header_len = pn_offset + truncated.len().bytesize();
    let (header, payload) = bytes.split_at_mut(header_len);
    let payload_len = opener.key.open(packet_number.as_u64(), header, payload)?;

    Ok((packet_number, header_len, payload_len))
}

/// Packet-number spaces of all packets in one datagram must ascend;
/// used by the datagram splitter to reject malformed coalescing.
pub fn space_of(packet: &ProtectedPacket) -> Option<PacketNumberSpace> {
    packet
        .encryption_level()
        .map(|level| level.packet_number_space())
}
