// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    crypto::{EncryptionLevel, Error as CryptoError, KeyPair},
    packet::{long, number::PacketNumber, open_protected, CleartextPacket},
};
use core::ops::Range;

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.2
//# An Initial packet uses long headers with a type value of 0x00.  It
//# carries the first CRYPTO frames sent by the client and server to
//# perform key exchange, and it carries ACK frames in either direction.

/// A received Initial packet, headers parsed, payload protected
#[derive(Debug)]
pub struct ProtectedInitial<'a> {
    bytes: &'a mut [u8],
    version: u32,
    dcid: Range<usize>,
    scid: Range<usize>,
    token: Range<usize>,
    pn_offset: usize,
}

impl<'a> ProtectedInitial<'a> {
    pub(crate) fn new(parsed: long::Parsed, bytes: &'a mut [u8]) -> Self {
        Self {
            bytes,
            version: parsed.version,
            dcid: parsed.dcid,
            scid: parsed.scid,
            token: parsed.token,
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

    /// The address-validation token echoed from a Retry or NEW_TOKEN
    #[inline]
    pub fn token(&self) -> &[u8] {
        &self.bytes[self.token.clone()]
    }

    /// The total size this packet occupies in the datagram
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn open(
        self,
        opener: &KeyPair,
        largest_received: Option<PacketNumber>,
    ) -> Result<CleartextPacket<'a>, CryptoError> {
        let level = EncryptionLevel::Initial;
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
