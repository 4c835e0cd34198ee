// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::packet::long;
use core::ops::Range;
use quiver_codec::{DecoderBuffer, Encoder, EncoderBuffer};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
//# A Version Negotiation packet is sent only by servers in response to a
//# client packet that contains a version that is not supported by the
//# server.

/// A received Version Negotiation packet
#[derive(Debug)]
pub struct ProtectedVersionNegotiation<'a> {
    bytes: &'a mut [u8],
    dcid: Range<usize>,
    scid: Range<usize>,
    versions: Range<usize>,
}

impl<'a> ProtectedVersionNegotiation<'a> {
    pub(crate) fn new(parsed: long::Parsed, bytes: &'a mut [u8]) -> Self {
        Self {
            bytes,
            dcid: parsed.dcid,
            scid: parsed.scid,
            versions: parsed.pn_offset..parsed.packet_len,
        }
    }

    #[inline]
    pub fn destination_connection_id(&self) -> &[u8] {
        &self.bytes[self.dcid.clone()]
    }

    #[inline]
    pub fn source_connection_id(&self) -> &[u8] {
        &self.bytes[self.scid.clone()]
    }

    /// Iterates the versions the peer supports
    pub fn supported_versions(&self) -> impl Iterator<Item = u32> + '_ {
        let mut buffer = DecoderBuffer::new(&self.bytes[self.versions.clone()]);
        core::iter::from_fn(move || {
            let (version, remaining) = buffer.decode::<u32>().ok()?;
            buffer = remaining;
            Some(version)
        })
    }
}

/// Writes a Version Negotiation packet in response to an unknown version
///
/// The echoed connection IDs are swapped: our DCID is the client's SCID.
pub fn encode(
    encoder: &mut EncoderBuffer,
    dcid: &[u8],
    scid: &[u8],
    supported_versions: &[u32],
) {
    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
    //# The value in the Unused field is set to an arbitrary value by the
    //# server.  Clients MUST ignore the value of this field.
    encoder.encode(&(long::FORM_BIT | long::FIXED_BIT));
    encoder.encode(&0u32);
    encoder.encode(&(dcid.len() as u8));
    encoder.write_slice(dcid);
    encoder.encode(&(scid.len() as u8));
    encoder.write_slice(scid);
    for version in supported_versions {
        encoder.encode(version);
    }
}
