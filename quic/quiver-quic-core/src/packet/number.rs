// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet numbers, their spaces, and the truncation scheme of
//! RFC 9000 §17.1 / Appendix A

use crate::varint::VarInt;
use core::fmt;
use quiver_codec::{DecoderBuffer, DecoderBufferResult, DecoderError, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-12.3
//# Packet numbers are divided into three spaces in QUIC:
//#
//# Initial space:  All Initial packets (Section 17.2.2) are in this
//#    space.
//#
//# Handshake space:  All Handshake packets (Section 17.2.4) are in this
//#    space.
//#
//# Application data space:  All 0-RTT (Section 17.2.3) and 1-RTT
//#    (Section 17.3) packets are in this space.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketNumberSpace {
    Initial,
    Handshake,
    ApplicationData,
}

impl PacketNumberSpace {
    pub const ALL: [Self; 3] = [Self::Initial, Self::Handshake, Self::ApplicationData];

    #[inline]
    pub fn is_initial(self) -> bool {
        matches!(self, Self::Initial)
    }

    #[inline]
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Handshake)
    }

    #[inline]
    pub fn is_application_data(self) -> bool {
        matches!(self, Self::ApplicationData)
    }

    #[inline]
    pub fn new_packet_number(self, value: VarInt) -> PacketNumber {
        PacketNumber { space: self, value }
    }

    /// Reads the packet number length from the low bits of an unprotected
    /// first header byte
    #[inline]
    pub fn new_packet_number_len(self, first_byte: u8) -> PacketNumberLen {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.1
        //# The least significant two bits (those with a mask of 0x03)
        //# of byte 0 contain the length of the Packet Number field
        PacketNumberLen {
            bytesize: (first_byte & 0b11) + 1,
            space: self,
        }
    }
}

/// A full 62-bit packet number within a space
///
/// Packet numbers from different spaces never compare equal and panic
/// when mixed in debug builds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketNumber {
    space: PacketNumberSpace,
    value: VarInt,
}

impl PacketNumber {
    #[inline]
    pub fn space(self) -> PacketNumberSpace {
        self.space
    }

    #[inline]
    pub fn as_varint(self) -> VarInt {
        self.value
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.value.as_u64()
    }

    #[inline]
    pub fn next(self) -> Option<Self> {
        Some(Self {
            space: self.space,
            value: self.value.checked_add(VarInt::from_u8(1))?,
        })
    }

    #[inline]
    pub fn checked_distance(self, rhs: Self) -> Option<u64> {
        debug_assert_eq!(self.space, rhs.space);
        self.as_u64().checked_sub(rhs.as_u64())
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.1
    //# the sender MUST use a packet number size able to represent more than
    //# twice as large a range as the difference between the largest
    //# acknowledged packet and the packet number being sent.
    #[inline]
    pub fn truncate(self, largest_acked: Self) -> Option<TruncatedPacketNumber> {
        debug_assert_eq!(self.space, largest_acked.space);
        let distance = self.as_u64().checked_sub(largest_acked.as_u64())?;
        let window = distance.checked_mul(2)?;

        let bytesize = if window < 1 << 8 {
            1
        } else if window < 1 << 16 {
            2
        } else if window < 1 << 24 {
            3
        } else if window < 1 << 32 {
            4
        } else {
            return None;
        };

        let mask = (1u64 << (bytesize * 8)) - 1;
        Some(TruncatedPacketNumber {
            value: self.as_u64() & mask,
            bytesize,
            space: self.space,
        })
    }
}

impl fmt::Debug for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PacketNumber({:?}, {})", self.space, self.value)
    }
}

/// The encoded length of a truncated packet number: 1 to 4 bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketNumberLen {
    bytesize: u8,
    space: PacketNumberSpace,
}

impl PacketNumberLen {
    #[inline]
    pub fn bytesize(self) -> usize {
        self.bytesize as usize
    }

    /// The two low header bits encoding this length
    #[inline]
    pub fn header_bits(self) -> u8 {
        self.bytesize - 1
    }

    /// Decodes a truncated packet number of this length
    #[inline]
    pub fn decode_truncated_packet_number<'a>(
        self,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, TruncatedPacketNumber> {
        let (slice, buffer) = buffer.decode_slice(self.bytesize())?;
        let slice = slice.into_less_safe_slice();
        let mut value = 0u64;
        for byte in slice {
            value = (value << 8) | *byte as u64;
        }
        Ok((
            TruncatedPacketNumber {
                value,
                bytesize: self.bytesize,
                space: self.space,
            },
            buffer,
        ))
    }
}

/// A packet number as it appears on the wire: only the least significant
/// 8-32 bits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TruncatedPacketNumber {
    value: u64,
    bytesize: u8,
    space: PacketNumberSpace,
}

impl TruncatedPacketNumber {
    #[cfg(test)]
    pub(crate) fn new_for_test(value: u64, bytesize: u8, space: PacketNumberSpace) -> Self {
        Self {
            value,
            bytesize,
            space,
        }
    }

    #[inline]
    pub fn space(self) -> PacketNumberSpace {
        self.space
    }

    #[inline]
    pub fn len(self) -> PacketNumberLen {
        PacketNumberLen {
            bytesize: self.bytesize,
            space: self.space,
        }
    }

    #[inline]
    pub fn bitsize(self) -> u32 {
        self.bytesize as u32 * 8
    }

    #[inline]
    pub fn into_u64(self) -> u64 {
        self.value
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.3
    //# candidate_pn = (expected_pn & ~pn_mask) | truncated_pn
    //# if candidate_pn <= expected_pn - pn_hwin and
    //#    candidate_pn < (1 << 62) - pn_win:
    //#    return candidate_pn + pn_win
    //# if candidate_pn > expected_pn + pn_hwin and
    //#    candidate_pn >= pn_win:
    //#    return candidate_pn - pn_win
    //# return candidate_pn
    #[inline]
    pub fn expand(self, largest_received: PacketNumber) -> PacketNumber {
        debug_assert_eq!(self.space, largest_received.space());

        let expected_pn = largest_received.as_u64() + 1;
        let pn_win = 1u64 << self.bitsize();
        let pn_hwin = pn_win / 2;
        let pn_mask = pn_win - 1;

        let mut candidate_pn = (expected_pn & !pn_mask) | self.value;

        if candidate_pn.checked_add(pn_hwin).map_or(false, |v| v <= expected_pn)
            && candidate_pn < (1u64 << 62) - pn_win
        {
            candidate_pn += pn_win;
        } else if candidate_pn > expected_pn.saturating_add(pn_hwin) && candidate_pn >= pn_win {
            candidate_pn -= pn_win;
        }

        let candidate_pn = candidate_pn.min(crate::varint::MAX_VARINT_VALUE);
        // bounded above, so the unchecked constructor is sound
        let value = unsafe { VarInt::new_unchecked(candidate_pn) };
        PacketNumber {
            space: self.space,
            value,
        }
    }
}

impl EncoderValue for TruncatedPacketNumber {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let bytes = self.value.to_be_bytes();
        let start = bytes.len() - self.bytesize as usize;
        encoder.write_slice(&bytes[start..]);
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.bytesize as usize
    }
}

/// Generates ascending packet numbers for one space
#[derive(Debug)]
pub struct PacketNumberGenerator {
    space: PacketNumberSpace,
    next: VarInt,
}

impl PacketNumberGenerator {
    #[inline]
    pub fn new(space: PacketNumberSpace) -> Self {
        Self {
            space,
            next: VarInt::ZERO,
        }
    }

    /// The packet number the next call to `next` will return
    #[inline]
    pub fn peek(&self) -> PacketNumber {
        self.space.new_packet_number(self.next)
    }

    #[inline]
    pub fn next(&mut self) -> Result<PacketNumber, DecoderError> {
        let value = self.next;
        self.next = self
            .next
            .checked_add(VarInt::from_u8(1))
            .ok_or(DecoderError::InvariantViolation("packet number exhausted"))?;
        Ok(self.space.new_packet_number(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pn(value: u64) -> PacketNumber {
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::new(value).unwrap())
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.1
    //= type=test
    //# For example, if an endpoint has received an acknowledgment for packet
    //# 0xabe8bc, sending a packet with a number of 0xac5c02 requires a
    //# packet number encoding with 16 bits or more
    #[test]
    fn truncation_size_example_test() {
        let largest_acked = pn(0x00ab_e8bc);
        assert_eq!(pn(0x00ac_5c02).truncate(largest_acked).unwrap().bitsize(), 16);
        assert_eq!(pn(0x00ac_e8fe).truncate(largest_acked).unwrap().bitsize(), 24);
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.3
    //= type=test
    //# For example, if the highest successfully
    //# authenticated packet had a packet number of 0xa82f30ea, then a packet
    //# containing a 16-bit value of 0x9b32 will be decoded as 0xa82f9b32.
    #[test]
    fn expansion_example_test() {
        let largest = pn(0xa82f_30ea);
        let truncated =
            TruncatedPacketNumber::new_for_test(0x9b32, 2, PacketNumberSpace::ApplicationData);
        assert_eq!(truncated.expand(largest), pn(0xa82f_9b32));
    }

    #[test]
    fn truncate_expand_round_trip_test() {
        bolero::check!()
            .with_type::<(u64, u64)>()
            .for_each(|(largest, value)| {
                let largest = match VarInt::new(*largest) {
                    Ok(v) => PacketNumberSpace::Initial.new_packet_number(v),
                    Err(_) => return,
                };
                let value = match VarInt::new(*value) {
                    Ok(v) => PacketNumberSpace::Initial.new_packet_number(v),
                    Err(_) => return,
                };

                if let Some(truncated) = value.truncate(largest) {
                    assert_eq!(truncated.expand(largest), value);
                }
            });
    }

    #[test]
    fn wire_round_trip_test() {
        use quiver_codec::EncoderBuffer;

        let largest = pn(0xff);
        let value = pn(0x100);
        let truncated = value.truncate(largest).unwrap();

        let mut bytes = [0u8; 4];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            encoder.encode(&truncated);
            encoder.len()
        };
        assert_eq!(len, truncated.len().bytesize());

        let buffer = DecoderBuffer::new(&bytes[..len]);
        let (decoded, _) = truncated
            .len()
            .decode_truncated_packet_number(buffer)
            .unwrap();
        assert_eq!(decoded, truncated);
        assert_eq!(decoded.expand(largest), value);
    }

    #[test]
    fn generator_is_strictly_increasing_test() {
        let mut generator = PacketNumberGenerator::new(PacketNumberSpace::Initial);
        let a = generator.next().unwrap();
        let b = generator.next().unwrap();
        assert!(b > a);
        assert_eq!(a.as_u64(), 0);
        assert_eq!(b.as_u64(), 1);
    }

    #[test]
    fn header_bits_round_trip_test() {
        for bits in 0..4u8 {
            let len = PacketNumberSpace::Initial.new_packet_number_len(0b1100_0000 | bits);
            assert_eq!(len.bytesize(), bits as usize + 1);
            assert_eq!(len.header_bits(), bits);
        }
    }
}
