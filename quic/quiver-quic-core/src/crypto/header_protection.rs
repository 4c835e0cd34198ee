// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Header protection (RFC 9001 §5.4)
//!
//! All pointer arithmetic for masking lives here; the packet codec hands
//! in the full packet slice plus the packet-number offset and never
//! touches mask bytes itself.

use crate::{
    crypto::{Error, HeaderKey, HeaderProtectionSample, HEADER_PROTECTION_SAMPLE_LEN},
    packet::number::{PacketNumberSpace, TruncatedPacketNumber},
};
use quiver_codec::DecoderBuffer;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.1
//# mask = header_protection(hp_key, sample)
//#
//# pn_length = (packet[0] & 0x03) + 1
//# if (packet[0] & 0x80) == 0x80:
//#    # Long header: 4 bits masked
//#    packet[0] ^= mask[0] & 0x0f
//# else:
//#    # Short header: 5 bits masked
//#    packet[0] ^= mask[0] & 0x1f
//#
//# # pn_offset is the start of the Packet Number field.
//# packet[pn_offset:pn_offset+pn_length] ^= mask[1:1+pn_length]

const LONG_HEADER_TAG: u8 = 0x80;
pub(crate) const LONG_HEADER_MASK: u8 = 0x0f;
pub(crate) const SHORT_HEADER_MASK: u8 = 0x1f;

#[inline]
fn first_byte_mask(first_byte: u8) -> u8 {
    if first_byte & LONG_HEADER_TAG == LONG_HEADER_TAG {
        LONG_HEADER_MASK
    } else {
        SHORT_HEADER_MASK
    }
}

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.2
//# the sample of ciphertext is taken starting 4 bytes after the start of
//# the Packet Number field
#[inline]
pub fn sample(packet: &[u8], pn_offset: usize) -> Result<HeaderProtectionSample, Error> {
    let start = pn_offset + 4;
    let end = start + HEADER_PROTECTION_SAMPLE_LEN;
    let slice = packet.get(start..end).ok_or(Error::Truncated)?;
    let mut sample = [0; HEADER_PROTECTION_SAMPLE_LEN];
    sample.copy_from_slice(slice);
    Ok(sample)
}

/// Masks the first-byte bits and packet-number bytes of an encoded packet
#[inline]
pub fn apply(
    header_key: &dyn HeaderKey,
    packet: &mut [u8],
    pn_offset: usize,
    pn_len: usize,
) -> Result<(), Error> {
    let mask = header_key.header_protection_mask(&sample(packet, pn_offset)?);

    packet[0] ^= mask[0] & first_byte_mask(packet[0]);
    for (byte, mask_byte) in packet[pn_offset..pn_offset + pn_len].iter_mut().zip(&mask[1..]) {
        *byte ^= mask_byte;
    }
    Ok(())
}

/// Unmasks a received packet and decodes the truncated packet number
///
/// Returns the packet number and its length; `packet` is left with the
/// protection removed so the unmasked header can serve as AEAD
/// associated data.
#[inline]
pub fn remove(
    header_key: &dyn HeaderKey,
    space: PacketNumberSpace,
    packet: &mut [u8],
    pn_offset: usize,
) -> Result<TruncatedPacketNumber, Error> {
    let mask = header_key.header_protection_mask(&sample(packet, pn_offset)?);

    packet[0] ^= mask[0] & first_byte_mask(packet[0]);
    let pn_len = space.new_packet_number_len(packet[0]);

    let pn_bytes = packet
        .get_mut(pn_offset..pn_offset + pn_len.bytesize())
        .ok_or(Error::Truncated)?;
    for (byte, mask_byte) in pn_bytes.iter_mut().zip(&mask[1..]) {
        *byte ^= mask_byte;
    }

    let (packet_number, _) = pn_len
        .decode_truncated_packet_number(DecoderBuffer::new(pn_bytes))
        .map_err(|_| Error::Truncated)?;
    Ok(packet_number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testing;

    // with an all-zero mask, protection application must be a no-op
    #[test]
    fn null_key_is_identity_test() {
        let key = testing::HeaderKey::default();
        let mut packet = [0x40u8, 0x00, 0x01, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let original = packet;
        apply(&key, &mut packet, 1, 1).unwrap();
        assert_eq!(packet, original);

        let pn = remove(&key, PacketNumberSpace::ApplicationData, &mut packet, 1).unwrap();
        assert_eq!(pn.into_u64(), 0);
        assert_eq!(pn.len().bytesize(), 1);
    }

    #[test]
    fn masking_round_trip_test() {
        let key = testing::HeaderKey::xor(0xa5);
        let mut packet = [0u8; 26];
        packet[0] = 0x41; // short header, 2-byte packet number
        packet[1] = 0x12;
        packet[2] = 0x34;
        let original = packet;

        apply(&key, &mut packet, 1, 2).unwrap();
        assert_ne!(packet, original);

        let pn = remove(&key, PacketNumberSpace::ApplicationData, &mut packet, 1).unwrap();
        assert_eq!(packet, original);
        assert_eq!(pn.into_u64(), 0x1234);
    }

    #[test]
    fn short_sample_is_rejected_test() {
        let key = testing::HeaderKey::default();
        let mut packet = [0u8; 10];
        assert_eq!(apply(&key, &mut packet, 1, 1), Err(Error::Truncated));
    }
}
