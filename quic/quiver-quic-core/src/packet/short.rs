// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    crypto::{EncryptionLevel, Error as CryptoError, KeyPair},
    packet::{number::PacketNumber, open_protected, CleartextPacket},
};
use quiver_codec::{DecoderBufferMut, DecoderError};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.3.1
//# 1-RTT Packet {
//#   Header Form (1) = 0,
//#   Fixed Bit (1) = 1,
//#   Spin Bit (1),
//#   Reserved Bits (2),
//#   Key Phase (1),
//#   Packet Number Length (2),
//#   Destination Connection ID (0..160),
//#   Packet Number (8..32),
//#   Packet Payload (8..),
//# }

pub const FIXED_BIT: u8 = 0x40;
pub const SPIN_BIT: u8 = 0x20;
pub const KEY_PHASE_BIT: u8 = 0x04;

/// A received 1-RTT packet
///
/// Short headers carry no length field, so the packet always extends to
/// the end of the datagram.
#[derive(Debug)]
pub struct ProtectedShort<'a> {
    bytes: &'a mut [u8],
    dcid_len: usize,
}

impl<'a> ProtectedShort<'a> {
    pub(crate) fn decode(
        buffer: DecoderBufferMut<'a>,
        dcid_len: usize,
    ) -> Result<(Self, DecoderBufferMut<'a>), DecoderError> {
        buffer.ensure_len(1 + dcid_len)?;
        let len = buffer.len();
        let (packet, remaining) = buffer.decode_slice(len)?;
        Ok((
            Self {
                bytes: packet.into_less_safe_slice(),
                dcid_len,
            },
            remaining,
        ))
    }

    #[inline]
    pub fn destination_connection_id(&self) -> &[u8] {
        &self.bytes[1..1 + self.dcid_len]
    }

    /// The spin bit, observable without keys
    #[inline]
    pub fn spin(&self) -> bool {
        self.bytes[0] & SPIN_BIT == SPIN_BIT
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn open(
        self,
        opener: &KeyPair,
        largest_received: Option<PacketNumber>,
    ) -> Result<CleartextPacket<'a>, CryptoError> {
        let level = EncryptionLevel::Application;
        let pn_offset = 1 + self.dcid_len;
        let bytes = self.bytes;
        let (packet_number, header_len, payload_len) =
            open_protected(opener, level, bytes, pn_offset, largest_received)?;

        let payload: &'a [u8] = &bytes[header_len..header_len + payload_len];
        Ok(CleartextPacket {
            packet_number,
            payload: payload.into(),
            encryption_level: level,
        })
    }
}
