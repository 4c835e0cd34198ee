// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Long header packets (RFC 9000 §17.2)

use crate::packet::{
    handshake::ProtectedHandshake, initial::ProtectedInitial, retry::ProtectedRetry,
    version_negotiation::ProtectedVersionNegotiation, zero_rtt::ProtectedZeroRtt, ProtectedPacket,
};
use crate::varint::VarInt;
use core::ops::Range;
use quiver_codec::{DecoderBuffer, DecoderBufferMut, DecoderError};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# Long Header Packet {
//#   Header Form (1) = 1,
//#   Fixed Bit (1) = 1,
//#   Long Packet Type (2),
//#   Type-Specific Bits (4),
//#   Version (32),
//#   Destination Connection ID Length (8),
//#   Destination Connection ID (0..160),
//#   Source Connection ID Length (8),
//#   Source Connection ID (0..160),
//#   Type-Specific Payload (..),
//# }

pub const FORM_BIT: u8 = 0x80;
pub const FIXED_BIT: u8 = 0x40;

const TYPE_MASK: u8 = 0b0011_0000;
const TYPE_SHIFT: u8 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl PacketType {
    #[inline]
    pub fn from_first_byte(first_byte: u8) -> Self {
        match (first_byte & TYPE_MASK) >> TYPE_SHIFT {
            0b00 => Self::Initial,
            0b01 => Self::ZeroRtt,
            0b10 => Self::Handshake,
            _ => Self::Retry,
        }
    }

    /// The two type bits positioned for the first header byte
    #[inline]
    pub fn type_bits(self) -> u8 {
        let bits = match self {
            Self::Initial => 0b00,
            Self::ZeroRtt => 0b01,
            Self::Handshake => 0b10,
            Self::Retry => 0b11,
        };
        bits << TYPE_SHIFT
    }

    /// The unprotected first byte for this type with `pn_len_bits` in
    /// the low bits
    #[inline]
    pub fn first_byte(self, pn_len_bits: u8) -> u8 {
        debug_assert!(pn_len_bits <= 0b11);
        FORM_BIT | FIXED_BIT | self.type_bits() | pn_len_bits
    }
}

/// Field layout of a parsed long header, as ranges into the packet bytes
#[derive(Debug)]
pub(crate) struct Parsed {
    pub version: u32,
    pub packet_type: PacketType,
    pub dcid: Range<usize>,
    pub scid: Range<usize>,
    /// Initial only; empty range otherwise
    pub token: Range<usize>,
    /// Offset of the protected packet number field
    pub pn_offset: usize,
    /// Total length of this packet within the datagram
    pub packet_len: usize,
}

/// Parses a long-header packet off the front of `bytes`
///
/// Works on an immutable view and returns offsets so the caller can
/// carve the mutable packet slice without aliasing.
pub(crate) fn parse(bytes: &[u8]) -> Result<Parsed, DecoderError> {
    let total_len = bytes.len();
    let buffer = DecoderBuffer::new(bytes);

    let (first_byte, buffer) = buffer.decode::<u8>()?;
    let (version, buffer) = buffer.decode::<u32>()?;
    let packet_type = PacketType::from_first_byte(first_byte);

    let offset = |remaining: &DecoderBuffer| total_len - remaining.len();

    let dcid_start = offset(&buffer) + 1;
    let (dcid, buffer) = buffer.decode_slice_with_len_prefix::<u8>()?;
    let dcid = dcid_start..dcid_start + dcid.len();

    let scid_start = offset(&buffer) + 1;
    let (scid, buffer) = buffer.decode_slice_with_len_prefix::<u8>()?;
    let scid = scid_start..scid_start + scid.len();

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
    //# A Version Negotiation packet is inherently not version specific.
    //# Upon receipt by a client, it will be identified as a Version
    //# Negotiation packet based on the Version field having a value of 0.
    if version == 0 {
        // the rest of the datagram is the supported version list
        return Ok(Parsed {
            version,
            packet_type,
            dcid,
            scid,
            token: 0..0,
            pn_offset: offset(&buffer),
            packet_len: total_len,
        });
    }

    match packet_type {
        PacketType::Retry => {
            // token plus integrity tag extend to the end of the datagram
            Ok(Parsed {
                version,
                packet_type,
                dcid,
                scid,
                token: offset(&buffer)..total_len,
                pn_offset: total_len,
                packet_len: total_len,
            })
        }
        PacketType::Initial => {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.2
            //# Token Length:  A variable-length integer specifying the length of
            //#    the Token field, in bytes.
            let (token_len, buffer) = buffer.decode::<VarInt>()?;
            let token_len: usize = token_len
                .try_into()
                .map_err(|_| DecoderError::LengthCapacityExceeded)?;
            let token_start = offset(&buffer);
            let buffer = buffer.skip(token_len)?;
            let token = token_start..token_start + token_len;

            let (pn_offset, packet_len) = finish(total_len, buffer)?;
            Ok(Parsed {
                version,
                packet_type,
                dcid,
                scid,
                token,
                pn_offset,
                packet_len,
            })
        }
        PacketType::ZeroRtt | PacketType::Handshake => {
            let (pn_offset, packet_len) = finish(total_len, buffer)?;
            Ok(Parsed {
                version,
                packet_type,
                dcid,
                scid,
                token: 0..0,
                pn_offset,
                packet_len,
            })
        }
    }
}

/// Reads the Length field and computes the packet extent
fn finish(total_len: usize, buffer: DecoderBuffer) -> Result<(usize, usize), DecoderError> {
    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
    //# Length:  This is the length of the remainder of the packet (that is,
    //#    the Packet Number and Payload fields) in bytes
    let (length, buffer) = buffer.decode::<VarInt>()?;
    let length: usize = length
        .try_into()
        .map_err(|_| DecoderError::LengthCapacityExceeded)?;
    buffer.ensure_len(length)?;

    let pn_offset = total_len - buffer.len();
    Ok((pn_offset, pn_offset + length))
}

/// Dispatches a long-header packet to its type-specific wrapper
pub(crate) fn decode_packet(
    buffer: DecoderBufferMut,
) -> Result<(ProtectedPacket, DecoderBufferMut), DecoderError> {
    let parsed = parse(buffer.peek().into_less_safe_slice())?;

    let (packet, remaining) = buffer.decode_slice(parsed.packet_len)?;
    let bytes = packet.into_less_safe_slice();

    let packet = if parsed.version == 0 {
        ProtectedPacket::VersionNegotiation(ProtectedVersionNegotiation::new(parsed, bytes))
    } else {
        match parsed.packet_type {
            PacketType::Initial => ProtectedPacket::Initial(ProtectedInitial::new(parsed, bytes)),
            PacketType::ZeroRtt => ProtectedPacket::ZeroRtt(ProtectedZeroRtt::new(parsed, bytes)),
            PacketType::Handshake => {
                ProtectedPacket::Handshake(ProtectedHandshake::new(parsed, bytes))
            }
            PacketType::Retry => ProtectedPacket::Retry(ProtectedRetry::new(parsed, bytes)),
        }
    };

    Ok((packet, remaining))
}
