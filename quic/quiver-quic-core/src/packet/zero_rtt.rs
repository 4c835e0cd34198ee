// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    crypto::{EncryptionLevel, Error as CryptoError, KeyPair},
    packet::{long, number::PacketNumber, open_protected, CleartextPacket},
};
use core::ops::Range;

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.3
//# A 0-RTT packet uses long headers with a type value of 0x01, followed
//# by the Length and Packet Number fields; see Section 17.2.  The first
//# byte contains the Reserved and Packet Number Length bits.  A 0-RTT
//# packet is used to carry "early" data from the client to the server as
//# part of the first flight, prior to handshake completion.

#[derive(Debug)]
pub struct ProtectedZeroRtt<'a> {
    bytes: &'a mut [u8],
    version: u32,
    dcid: Range<usize>,
    scid: Range<usize>,
    pn_offset: usize,
}

impl<'a> ProtectedZeroRtt<'a> {
    pub(crate) fn new(parsed: long::Parsed, bytes: &'a mut [u8]) -> Self {
        Self {
            bytes,
            version: parsed.version,
            dcid: parsed.dcid,
            scid: parsed.scid,
            pn_offset: parsed.pn_offset,
        }
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[inline]
    pub fn destination_connection_id(&self) -> &[u8] {
        &self.bytes[self.dcid.clone()]
    }

    #[inline]
    pub fn source_connection_id(&self) -> &[u8] {
        &self.bytes[self.scid.clone()]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// The complete protected packet, e.g. for buffering until keys
    /// become available
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn open(
        self,
        opener: &KeyPair,
        largest_received: Option<PacketNumber>,
    ) -> Result<CleartextPacket<'a>, CryptoError> {
        let level = EncryptionLevel::EarlyData;
        let bytes = self.bytes;
        let (packet_number, header_len, payload_len) =
            open_protected(opener, level, bytes, self.pn_offset, largest_received)?;

        let payload: &'a [u8] = &bytes[header_len..header_len + payload_len];
        Ok(CleartextPacket {
            packet_number,
            payload: payload.into(),
            encryption_level: level,
        })
    }
}
