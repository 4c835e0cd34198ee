// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The encode→encrypt pipeline
//!
//! One function assembles a whole protected packet: header, truncated
//! packet number, caller-provided frames, padding, AEAD seal, header
//! protection. The caller only decides what goes in the payload; the
//! payload encoder it receives is already budgeted so the AEAD tag
//! always fits.

use crate::{
    crypto::{self, Error as CryptoError, KeyPair, HEADER_PROTECTION_SAMPLE_LEN},
    packet::{long, number::PacketNumber, short},
    varint::VarInt,
};
use quiver_codec::{Encoder, EncoderBuffer, EncoderValue};

/// The header of a packet under construction
#[derive(Clone, Copy, Debug)]
pub enum Header<'a> {
    Initial {
        version: u32,
        dcid: &'a [u8],
        scid: &'a [u8],
        token: &'a [u8],
    },
    ZeroRtt {
        version: u32,
        dcid: &'a [u8],
        scid: &'a [u8],
    },
    Handshake {
        version: u32,
        dcid: &'a [u8],
        scid: &'a [u8],
    },
    Short {
        dcid: &'a [u8],
        spin: bool,
        key_phase: bool,
    },
}

impl<'a> Header<'a> {
    #[inline]
    fn long_packet_type(&self) -> Option<long::PacketType> {
        match self {
            Self::Initial { .. } => Some(long::PacketType::Initial),
            Self::ZeroRtt { .. } => Some(long::PacketType::ZeroRtt),
            Self::Handshake { .. } => Some(long::PacketType::Handshake),
            Self::Short { .. } => None,
        }
    }

    #[inline]
    pub fn is_long(&self) -> bool {
        self.long_packet_type().is_some()
    }
}

/// Worst-case header overhead for budgeting, excluding the payload:
/// first byte + version + 2 cid length prefixes + 2 full cids + token
/// length + length field + 4-byte packet number
pub const MAX_LONG_HEADER_LEN: usize = 1 + 4 + 2 + 2 * 20 + 8 + 2 + 4;

/// The result of sealing one packet
#[derive(Clone, Copy, Debug)]
pub struct SealedPacket {
    /// Total bytes the packet occupies
    pub len: usize,
    /// Bytes of payload supplied by the caller (excluding padding)
    pub payload_len: usize,
}

/// Assembles and protects one packet at the front of `buffer`
///
/// `write_payload` receives an encoder whose capacity excludes the AEAD
/// tag. An empty payload aborts with an internal error; deciding that
/// nothing should be sent is the caller's job. With `min_packet_len`
/// the payload is padded until the sealed packet reaches that size
/// (e.g. the 1200-byte Initial datagram floor).
pub fn encode_packet<W>(
    buffer: &mut [u8],
    header: Header,
    packet_number: PacketNumber,
    largest_acked: Option<PacketNumber>,
    min_packet_len: Option<usize>,
    sealer: &mut KeyPair,
    write_payload: W,
) -> Result<SealedPacket, CryptoError>
where
    W: FnOnce(&mut EncoderBuffer),
{
    let space = packet_number.space();
    let reference = largest_acked.unwrap_or_else(|| space.new_packet_number(VarInt::ZERO));
    let truncated = packet_number
        .truncate(reference)
        .ok_or(CryptoError::Internal("packet number truncation failed"))?;
    let pn_len = truncated.len().bytesize();
    let tag_len = sealer.key.tag_len();

    // unprotected header, including the packet number
    let (header_len, pn_offset, length_offset) = {
        let mut encoder = EncoderBuffer::new(&mut *buffer);
        let mut length_offset = None;

        match header {
            Header::Initial {
                version,
                dcid,
                scid,
                token,
            } => {
                encoder
                    .encode(&long::PacketType::Initial.first_byte(truncated.len().header_bits()));
                encoder.encode(&version);
                encoder.encode(&(dcid.len() as u8));
                encoder.write_slice(dcid);
                encoder.encode(&(scid.len() as u8));
                encoder.write_slice(scid);
                encoder.encode(
                    &VarInt::try_from(token.len())
                        .map_err(|_| CryptoError::Internal("token length out of range"))?,
                );
                encoder.write_slice(token);
                length_offset = Some(reserve_length(&mut encoder));
            }
            Header::ZeroRtt { version, dcid, scid } | Header::Handshake { version, dcid, scid } => {
                let packet_type = header.long_packet_type().expect("long header");
                encoder.encode(&packet_type.first_byte(truncated.len().header_bits()));
                encoder.encode(&version);
                encoder.encode(&(dcid.len() as u8));
                encoder.write_slice(dcid);
                encoder.encode(&(scid.len() as u8));
                encoder.write_slice(scid);
                length_offset = Some(reserve_length(&mut encoder));
            }
            Header::Short {
                dcid,
                spin,
                key_phase,
            } => {
                let mut first_byte = short::FIXED_BIT | truncated.len().header_bits();
                if spin {
                    first_byte |= short::SPIN_BIT;
                }
                if key_phase {
                    first_byte |= short::KEY_PHASE_BIT;
                }
                encoder.encode(&first_byte);
                encoder.write_slice(dcid);
            }
        }

        let pn_offset = encoder.len();
        encoder.encode(&truncated);
        (encoder.len(), pn_offset, length_offset)
    };

    // caller frames, budgeted so the tag still fits
    let payload_budget = buffer
        .len()
        .checked_sub(header_len + tag_len)
        .ok_or(CryptoError::Internal("buffer below header and tag size"))?;
    let (payload_len, padding) = {
        let mut encoder = EncoderBuffer::new(&mut buffer[header_len..header_len + payload_budget]);
        write_payload(&mut encoder);
        let payload_len = encoder.len();
        if payload_len == 0 {
            return Err(CryptoError::Internal("refusing to seal an empty packet"));
        }

        //= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.2
        //# An endpoint MUST pad the payload of the packet to ensure that
        //# there are enough bytes for sampling.
        let sampleable = pn_len + payload_len + tag_len;
        let mut padding = (4 + HEADER_PROTECTION_SAMPLE_LEN).saturating_sub(sampleable);

        if let Some(min_len) = min_packet_len {
            let unpadded = header_len + payload_len + padding + tag_len;
            padding += min_len.saturating_sub(unpadded).min(
                encoder.remaining_capacity().saturating_sub(padding),
            );
        }

        encoder.write_repeated(padding, 0);
        (payload_len, padding)
    };

    let total_len = header_len + payload_len + padding + tag_len;
    let bytes = &mut buffer[..total_len];

    // the tag region must not leak stale bytes
    bytes[total_len - tag_len..].fill(0);

    // patch the long-header length now the payload size is known
    if let Some(offset) = length_offset {
        let length = total_len - pn_offset;
        if length >= 1 << 14 {
            return Err(CryptoError::Internal("packet exceeds length field"));
        }
        let encoded = (length as u16) | (0b01 << 14);
        bytes[offset..offset + 2].copy_from_slice(&encoded.to_be_bytes());
    }

    // seal with the header (including the packet number) as AAD
    {
        let (aad, payload) = bytes.split_at_mut(header_len);
        sealer.key.seal(packet_number.as_u64(), aad, payload)?;
    }

    crypto::header_protection::apply(&*sealer.header_key, bytes, pn_offset, pn_len)?;

    Ok(SealedPacket {
        len: total_len,
        payload_len,
    })
}

/// Writes a 2-byte varint placeholder for the Length field
#[inline]
fn reserve_length(encoder: &mut EncoderBuffer) -> usize {
    let offset = encoder.len();
    encoder.write_repeated(2, 0);
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::testing,
        frame::{self, FrameRef},
        packet::{number::PacketNumberSpace, ProtectedPacket, VERSION},
    };
    use quiver_codec::DecoderBufferMut;

    #[derive(Debug, PartialEq)]
    enum FrameDigest {
        Ping,
        MaxData(u64),
        Padding,
    }

    fn seal_and_open(header: Header, packet_number: u64) -> (Vec<FrameDigest>, usize) {
        let mut sealer = testing::key_pair(crate::crypto::EncryptionLevel::Initial);
        let opener = testing::key_pair(crate::crypto::EncryptionLevel::Initial);

        let space = match header {
            Header::Initial { .. } => PacketNumberSpace::Initial,
            Header::Handshake { .. } => PacketNumberSpace::Handshake,
            _ => PacketNumberSpace::ApplicationData,
        };
        let packet_number = space.new_packet_number(VarInt::new(packet_number).unwrap());

        let mut datagram = [0u8; 1500];
        let sealed = encode_packet(
            &mut datagram,
            header,
            packet_number,
            None,
            None,
            &mut sealer,
            |encoder| {
                encoder.encode(&frame::Ping);
                encoder.encode(&frame::MaxData {
                    maximum_data: VarInt::from_u32(4096),
                });
            },
        )
        .unwrap();

        let buffer = DecoderBufferMut::new(&mut datagram[..sealed.len]);
        let (packet, remaining) = ProtectedPacket::decode(buffer, 8).unwrap();
        assert!(remaining.is_empty());

        let cleartext = packet.open(&opener, None).unwrap();
        assert_eq!(cleartext.packet_number, packet_number);

        let mut digests = vec![];
        let mut payload = cleartext.payload;
        while !payload.is_empty() {
            let (frame, rest) = payload.decode::<FrameRef>().unwrap();
            digests.push(match frame {
                frame::Frame::Ping(_) => FrameDigest::Ping,
                frame::Frame::MaxData(f) => FrameDigest::MaxData(f.maximum_data.as_u64()),
                frame::Frame::Padding(_) => FrameDigest::Padding,
                other => panic!("unexpected frame {other:?}"),
            });
            payload = rest;
        }
        (digests, sealed.len)
    }

    #[test]
    fn initial_round_trip_test() {
        let (digests, _) = seal_and_open(
            Header::Initial {
                version: VERSION,
                dcid: &[1, 2, 3, 4, 5, 6, 7, 8],
                scid: &[9, 10, 11, 12],
                token: b"tok",
            },
            0,
        );
        assert_eq!(digests[..2], [FrameDigest::Ping, FrameDigest::MaxData(4096)]);
    }

    #[test]
    fn handshake_round_trip_test() {
        let (digests, _) = seal_and_open(
            Header::Handshake {
                version: VERSION,
                dcid: &[1; 8],
                scid: &[2; 8],
            },
            77,
        );
        assert_eq!(digests[..2], [FrameDigest::Ping, FrameDigest::MaxData(4096)]);
    }

    #[test]
    fn short_round_trip_test() {
        let (digests, _) = seal_and_open(
            Header::Short {
                dcid: &[7; 8],
                spin: false,
                key_phase: false,
            },
            3,
        );
        assert_eq!(digests[..2], [FrameDigest::Ping, FrameDigest::MaxData(4096)]);
    }

    #[test]
    fn min_packet_len_pads_test() {
        let mut sealer = testing::key_pair(crate::crypto::EncryptionLevel::Initial);
        let mut datagram = [0u8; 1500];
        let packet_number = PacketNumberSpace::Initial.new_packet_number(VarInt::ZERO);

        let sealed = encode_packet(
            &mut datagram,
            Header::Initial {
                version: VERSION,
                dcid: &[1; 8],
                scid: &[2; 8],
                token: &[],
            },
            packet_number,
            None,
            Some(1200),
            &mut sealer,
            |encoder| encoder.encode(&frame::Ping),
        )
        .unwrap();

        //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
        //= type=test
        //# A client MUST expand the payload of all UDP datagrams carrying
        //# Initial packets to at least the smallest allowed maximum
        //# datagram size of 1200 bytes
        assert_eq!(sealed.len, 1200);
    }

    #[test]
    fn coalesced_datagram_test() {
        let mut sealer = testing::key_pair(crate::crypto::EncryptionLevel::Initial);
        let mut datagram = [0u8; 1500];

        let initial_pn = PacketNumberSpace::Initial.new_packet_number(VarInt::ZERO);
        let first = encode_packet(
            &mut datagram,
            Header::Initial {
                version: VERSION,
                dcid: &[1; 8],
                scid: &[2; 8],
                token: &[],
            },
            initial_pn,
            None,
            None,
            &mut sealer,
            |encoder| encoder.encode(&frame::Ping),
        )
        .unwrap();

        let handshake_pn = PacketNumberSpace::Handshake.new_packet_number(VarInt::ZERO);
        let second = encode_packet(
            &mut datagram[first.len..],
            Header::Handshake {
                version: VERSION,
                dcid: &[1; 8],
                scid: &[2; 8],
            },
            handshake_pn,
            None,
            None,
            &mut sealer,
            |encoder| encoder.encode(&frame::Ping),
        )
        .unwrap();

        let total = first.len + second.len;
        let buffer = DecoderBufferMut::new(&mut datagram[..total]);
        let (packet, remaining) = ProtectedPacket::decode(buffer, 8).unwrap();
        assert!(matches!(packet, ProtectedPacket::Initial(_)));

        let (packet, remaining) = ProtectedPacket::decode(remaining, 8).unwrap();
        assert!(matches!(packet, ProtectedPacket::Handshake(_)));
        assert!(remaining.is_empty());
    }
}
