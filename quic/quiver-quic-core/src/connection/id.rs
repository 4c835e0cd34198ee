// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use quiver_codec::{Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# In QUIC version 1, this value MUST NOT exceed 20 bytes.
pub const MAX_LEN: usize = 20;

/// A connection ID: up to 20 opaque bytes chosen by the endpoint that
/// wants to be addressed by them
///
/// Sequence numbers, reset tokens and routing hashes are properties of a
/// pool entry, not of the ID itself; see the transport crate's CID
/// coordinator.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct ConnectionId {
    bytes: [u8; MAX_LEN],
    len: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidLength;

impl fmt::Display for InvalidLength {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "connection id exceeds 20 bytes")
    }
}

impl ConnectionId {
    pub const EMPTY: Self = Self {
        bytes: [0; MAX_LEN],
        len: 0,
    };

    #[inline]
    pub fn try_from_bytes(slice: &[u8]) -> Result<Self, InvalidLength> {
        if slice.len() > MAX_LEN {
            return Err(InvalidLength);
        }
        let mut bytes = [0; MAX_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Self {
            bytes,
            len: slice.len() as u8,
        })
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for ConnectionId {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x")?;
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl EncoderValue for ConnectionId {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(self.as_bytes())
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_bounds_test() {
        assert!(ConnectionId::try_from_bytes(&[0; 20]).is_ok());
        assert!(ConnectionId::try_from_bytes(&[0; 21]).is_err());
        assert!(ConnectionId::try_from_bytes(&[]).unwrap().is_empty());
    }

    #[test]
    fn equality_ignores_padding_test() {
        let a = ConnectionId::try_from_bytes(&[1, 2, 3]).unwrap();
        let b = ConnectionId::try_from_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_bytes(), &[1, 2, 3]);
        assert_eq!(format!("{a:?}"), "0x010203");
    }
}
