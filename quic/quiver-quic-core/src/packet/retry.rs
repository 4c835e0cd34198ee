// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::packet::long;
use core::ops::Range;

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5
//# A Retry packet uses a long packet header with a type value of 0x03.
//# It carries an address validation token created by the server.  It is
//# used by a server that wishes to perform a retry; see Section 8.1.

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.8
//# The Retry Integrity Tag is a 128-bit field
pub const INTEGRITY_TAG_LEN: usize = 16;

/// A received Retry packet
///
/// Integrity-tag validation is the crypto provider's concern; the
/// transport consumes the token and the new source connection ID.
#[derive(Debug)]
pub struct ProtectedRetry<'a> {
    bytes: &'a mut [u8],
    version: u32,
    dcid: Range<usize>,
    scid: Range<usize>,
    token_and_tag: Range<usize>,
}

impl<'a> ProtectedRetry<'a> {
    pub(crate) fn new(parsed: long::Parsed, bytes: &'a mut [u8]) -> Self {
        Self {
            bytes,
            version: parsed.version,
            dcid: parsed.dcid,
            scid: parsed.scid,
            token_and_tag: parsed.token,
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

    /// The connection ID the client must use as DCID from now on
    #[inline]
    pub fn source_connection_id(&self) -> &[u8] {
        &self.bytes[self.scid.clone()]
    }

    /// The token to echo in subsequent Initial packets
    #[inline]
    pub fn retry_token(&self) -> Option<&[u8]> {
        let range = self.token_and_tag.clone();
        let token_end = range.end.checked_sub(INTEGRITY_TAG_LEN)?;
        if token_end <= range.start {
            // a Retry which carries no token is useless to the client
            return None;
        }
        Some(&self.bytes[range.start..token_end])
    }

    #[inline]
    pub fn integrity_tag(&self) -> Option<&[u8]> {
        let range = self.token_and_tag.clone();
        let token_end = range.end.checked_sub(INTEGRITY_TAG_LEN)?;
        if token_end < range.start {
            return None;
        }
        Some(&self.bytes[token_end..range.end])
    }
}
