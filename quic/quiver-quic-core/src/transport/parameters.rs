// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport parameters (RFC 9000 §18)
//!
//! Parameters travel inside the TLS handshake as a sequence of
//! `(id, length, value)` entries. Decode collects them into one record;
//! `merged_limits` reconciles what we advertised with what the peer
//! advertised for the values both sides negotiate downward.

use crate::{connection::ConnectionId, endpoint, transport::Error, varint::VarInt};
use core::time::Duration;
use quiver_codec::{
    decoder_invariant, DecoderBuffer, DecoderBufferResult, DecoderError, DecoderValue, Encoder,
    EncoderValue,
};

const MAX_IDLE_TIMEOUT: VarInt = VarInt::from_u8(0x01);
const STATELESS_RESET_TOKEN: VarInt = VarInt::from_u8(0x02);
const MAX_UDP_PAYLOAD_SIZE: VarInt = VarInt::from_u8(0x03);
const INITIAL_MAX_DATA: VarInt = VarInt::from_u8(0x04);
const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: VarInt = VarInt::from_u8(0x05);
const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: VarInt = VarInt::from_u8(0x06);
const INITIAL_MAX_STREAM_DATA_UNI: VarInt = VarInt::from_u8(0x07);
const INITIAL_MAX_STREAMS_BIDI: VarInt = VarInt::from_u8(0x08);
const INITIAL_MAX_STREAMS_UNI: VarInt = VarInt::from_u8(0x09);
const ACK_DELAY_EXPONENT: VarInt = VarInt::from_u8(0x0a);
const MAX_ACK_DELAY: VarInt = VarInt::from_u8(0x0b);
const DISABLE_ACTIVE_MIGRATION: VarInt = VarInt::from_u8(0x0c);
const PREFERRED_ADDRESS: VarInt = VarInt::from_u8(0x0d);
const ACTIVE_CONNECTION_ID_LIMIT: VarInt = VarInt::from_u8(0x0e);
const INITIAL_SOURCE_CONNECTION_ID: VarInt = VarInt::from_u8(0x0f);
const RETRY_SOURCE_CONNECTION_ID: VarInt = VarInt::from_u8(0x10);
const ORIGINAL_DESTINATION_CONNECTION_ID: VarInt = VarInt::from_u8(0x00);

pub const STATELESS_RESET_TOKEN_LEN: usize = 16;

//= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
//# Values above 2^60 are invalid.
const MAX_STREAMS_LIMIT: u64 = 1 << 60;

/// A server's preferred address for post-handshake migration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreferredAddress {
    pub ipv4_address: [u8; 4],
    pub ipv4_port: u16,
    pub ipv6_address: [u8; 16],
    pub ipv6_port: u16,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: [u8; STATELESS_RESET_TOKEN_LEN],
}

/// The full negotiated parameter record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportParameters {
    pub max_idle_timeout: VarInt,
    pub max_udp_payload_size: VarInt,
    pub initial_max_data: VarInt,
    pub initial_max_stream_data_bidi_local: VarInt,
    pub initial_max_stream_data_bidi_remote: VarInt,
    pub initial_max_stream_data_uni: VarInt,
    pub initial_max_streams_bidi: VarInt,
    pub initial_max_streams_uni: VarInt,
    pub ack_delay_exponent: u8,
    pub max_ack_delay: VarInt,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: VarInt,
    pub original_destination_connection_id: Option<ConnectionId>,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
    pub stateless_reset_token: Option<[u8; STATELESS_RESET_TOKEN_LEN]>,
    pub preferred_address: Option<PreferredAddress>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            max_idle_timeout: VarInt::ZERO,
            //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
            //# The default for this parameter is the maximum permitted UDP
            //# payload of 65527.
            max_udp_payload_size: VarInt::from_u32(65527),
            initial_max_data: VarInt::ZERO,
            initial_max_stream_data_bidi_local: VarInt::ZERO,
            initial_max_stream_data_bidi_remote: VarInt::ZERO,
            initial_max_stream_data_uni: VarInt::ZERO,
            initial_max_streams_bidi: VarInt::ZERO,
            initial_max_streams_uni: VarInt::ZERO,
            ack_delay_exponent: 3,
            max_ack_delay: VarInt::from_u8(25),
            disable_active_migration: false,
            //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
            //# If this transport parameter is absent, a default of 2 is assumed.
            active_connection_id_limit: VarInt::from_u8(2),
            original_destination_connection_id: None,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
            stateless_reset_token: None,
            preferred_address: None,
        }
    }
}

impl TransportParameters {
    #[inline]
    pub fn max_idle_timeout(&self) -> Option<Duration> {
        if self.max_idle_timeout == VarInt::ZERO {
            None
        } else {
            Some(Duration::from_millis(self.max_idle_timeout.as_u64()))
        }
    }

    #[inline]
    pub fn max_ack_delay(&self) -> Duration {
        Duration::from_millis(self.max_ack_delay.as_u64())
    }

    /// Validates semantic constraints which the codec cannot express
    pub fn validate(&self, peer_role: endpoint::Type) -> Result<(), Error> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
        //# Values below 1200 are invalid.
        if self.max_udp_payload_size < 1200u64 {
            return Err(Error::TRANSPORT_PARAMETER_ERROR.with_reason("max_udp_payload_size below 1200"));
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
        //# Values above 20 are invalid.
        if self.ack_delay_exponent > 20 {
            return Err(Error::TRANSPORT_PARAMETER_ERROR.with_reason("ack_delay_exponent above 20"));
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
        //# Values of 2^14 or greater are invalid.
        if self.max_ack_delay >= (1u64 << 14) {
            return Err(Error::TRANSPORT_PARAMETER_ERROR.with_reason("max_ack_delay out of range"));
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
        //# The value of the active_connection_id_limit parameter MUST be at
        //# least 2.
        if self.active_connection_id_limit < 2u64 {
            return Err(Error::TRANSPORT_PARAMETER_ERROR.with_reason("active_connection_id_limit below 2"));
        }

        if self.initial_max_streams_bidi.as_u64() > MAX_STREAMS_LIMIT
            || self.initial_max_streams_uni.as_u64() > MAX_STREAMS_LIMIT
        {
            return Err(Error::TRANSPORT_PARAMETER_ERROR.with_reason("stream limit above 2^60"));
        }

        if peer_role.is_client() {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
            //# A client MUST NOT include any server-only transport parameter:
            //# original_destination_connection_id, preferred_address,
            //# retry_source_connection_id, or stateless_reset_token.
            if self.original_destination_connection_id.is_some()
                || self.preferred_address.is_some()
                || self.retry_source_connection_id.is_some()
                || self.stateless_reset_token.is_some()
            {
                return Err(Error::TRANSPORT_PARAMETER_ERROR.with_reason("server-only parameter from client"));
            }
        }

        Ok(())
    }
}

impl EncoderValue for TransportParameters {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        #[inline]
        fn varint_param<E: Encoder>(encoder: &mut E, id: VarInt, value: VarInt, default: VarInt) {
            if value != default {
                encoder.encode(&id);
                encoder.encode(&VarInt::try_from(value.encoding_size()).unwrap());
                encoder.encode(&value);
            }
        }

        #[inline]
        fn cid_param<E: Encoder>(encoder: &mut E, id: VarInt, value: &Option<ConnectionId>) {
            if let Some(cid) = value {
                encoder.encode(&id);
                encoder.encode(&VarInt::try_from(cid.len()).unwrap());
                encoder.encode(cid);
            }
        }

        varint_param(encoder, MAX_IDLE_TIMEOUT, self.max_idle_timeout, VarInt::ZERO);
        varint_param(
            encoder,
            MAX_UDP_PAYLOAD_SIZE,
            self.max_udp_payload_size,
            VarInt::from_u32(65527),
        );
        varint_param(encoder, INITIAL_MAX_DATA, self.initial_max_data, VarInt::ZERO);
        varint_param(
            encoder,
            INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
            VarInt::ZERO,
        );
        varint_param(
            encoder,
            INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
            VarInt::ZERO,
        );
        varint_param(
            encoder,
            INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
            VarInt::ZERO,
        );
        varint_param(
            encoder,
            INITIAL_MAX_STREAMS_BIDI,
            self.initial_max_streams_bidi,
            VarInt::ZERO,
        );
        varint_param(
            encoder,
            INITIAL_MAX_STREAMS_UNI,
            self.initial_max_streams_uni,
            VarInt::ZERO,
        );
        varint_param(
            encoder,
            ACK_DELAY_EXPONENT,
            VarInt::from_u8(self.ack_delay_exponent),
            VarInt::from_u8(3),
        );
        varint_param(
            encoder,
            MAX_ACK_DELAY,
            self.max_ack_delay,
            VarInt::from_u8(25),
        );
        varint_param(
            encoder,
            ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
            VarInt::from_u8(2),
        );

        if self.disable_active_migration {
            encoder.encode(&DISABLE_ACTIVE_MIGRATION);
            encoder.encode(&VarInt::ZERO);
        }

        cid_param(
            encoder,
            ORIGINAL_DESTINATION_CONNECTION_ID,
            &self.original_destination_connection_id,
        );
        cid_param(
            encoder,
            INITIAL_SOURCE_CONNECTION_ID,
            &self.initial_source_connection_id,
        );
        cid_param(
            encoder,
            RETRY_SOURCE_CONNECTION_ID,
            &self.retry_source_connection_id,
        );

        if let Some(token) = &self.stateless_reset_token {
            encoder.encode(&STATELESS_RESET_TOKEN);
            encoder.encode(&VarInt::from_u8(STATELESS_RESET_TOKEN_LEN as u8));
            encoder.encode(token);
        }

        if let Some(addr) = &self.preferred_address {
            let len = 4 + 2 + 16 + 2 + 1 + addr.connection_id.len() + STATELESS_RESET_TOKEN_LEN;
            encoder.encode(&PREFERRED_ADDRESS);
            encoder.encode(&VarInt::try_from(len).unwrap());
            encoder.encode(&addr.ipv4_address);
            encoder.encode(&addr.ipv4_port);
            encoder.encode(&addr.ipv6_address);
            encoder.encode(&addr.ipv6_port);
            encoder.encode(&(addr.connection_id.len() as u8));
            encoder.encode(&addr.connection_id);
            encoder.encode(&addr.stateless_reset_token);
        }
    }
}

impl<'a> DecoderValue<'a> for TransportParameters {
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let mut params = TransportParameters::default();
        let mut seen = [false; 0x11];
        let mut buffer = buffer;

        while !buffer.is_empty() {
            let (id, remaining) = buffer.decode::<VarInt>()?;
            let (value, remaining) = remaining.decode_slice_with_len_prefix::<VarInt>()?;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4
            //# An endpoint MUST NOT send a parameter more than once in a given
            //# transport parameters extension.
            if let Ok(index) = usize::try_from(id.as_u64()) {
                if let Some(entry) = seen.get_mut(index) {
                    decoder_invariant!(!*entry, "duplicate transport parameter");
                    *entry = true;
                }
            }

            match id {
                MAX_IDLE_TIMEOUT => params.max_idle_timeout = decode_varint(value)?,
                MAX_UDP_PAYLOAD_SIZE => params.max_udp_payload_size = decode_varint(value)?,
                INITIAL_MAX_DATA => params.initial_max_data = decode_varint(value)?,
                INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = decode_varint(value)?
                }
                INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = decode_varint(value)?
                }
                INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = decode_varint(value)?
                }
                INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = decode_varint(value)?
                }
                INITIAL_MAX_STREAMS_UNI => params.initial_max_streams_uni = decode_varint(value)?,
                ACK_DELAY_EXPONENT => {
                    let value = decode_varint(value)?;
                    decoder_invariant!(value <= 20u64, "ack_delay_exponent above 20");
                    params.ack_delay_exponent = value.as_u64() as u8;
                }
                MAX_ACK_DELAY => params.max_ack_delay = decode_varint(value)?,
                DISABLE_ACTIVE_MIGRATION => {
                    decoder_invariant!(value.is_empty(), "disable_active_migration carries data");
                    params.disable_active_migration = true;
                }
                ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = decode_varint(value)?
                }
                ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id = Some(decode_cid(value)?)
                }
                INITIAL_SOURCE_CONNECTION_ID => {
                    params.initial_source_connection_id = Some(decode_cid(value)?)
                }
                RETRY_SOURCE_CONNECTION_ID => {
                    params.retry_source_connection_id = Some(decode_cid(value)?)
                }
                STATELESS_RESET_TOKEN => {
                    let (token, rest) = value.decode_slice(STATELESS_RESET_TOKEN_LEN)?;
                    rest.ensure_empty()?;
                    let mut bytes = [0; STATELESS_RESET_TOKEN_LEN];
                    bytes.copy_from_slice(token.into_less_safe_slice());
                    params.stateless_reset_token = Some(bytes);
                }
                PREFERRED_ADDRESS => {
                    params.preferred_address = Some(decode_preferred_address(value)?)
                }
                _ => {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4.2
                    //# An endpoint MUST ignore transport parameters that it does
                    //# not support.
                }
            }

            buffer = remaining;
        }

        Ok((params, buffer))
    }
}

fn decode_varint(value: DecoderBuffer) -> Result<VarInt, DecoderError> {
    let (varint, remaining) = value.decode::<VarInt>()?;
    remaining.ensure_empty()?;
    Ok(varint)
}

fn decode_cid(value: DecoderBuffer) -> Result<ConnectionId, DecoderError> {
    ConnectionId::try_from_bytes(value.as_less_safe_slice())
        .map_err(|_| DecoderError::InvariantViolation("connection id exceeds 20 bytes"))
}

fn decode_preferred_address(value: DecoderBuffer) -> Result<PreferredAddress, DecoderError> {
    let (ipv4, value) = value.decode_slice(4)?;
    let (ipv4_port, value) = value.decode::<u16>()?;
    let (ipv6, value) = value.decode_slice(16)?;
    let (ipv6_port, value) = value.decode::<u16>()?;
    let (cid, value) = value.decode_slice_with_len_prefix::<u8>()?;
    let (token, value) = value.decode_slice(STATELESS_RESET_TOKEN_LEN)?;
    value.ensure_empty()?;

    let mut ipv4_address = [0; 4];
    ipv4_address.copy_from_slice(ipv4.into_less_safe_slice());
    let mut ipv6_address = [0; 16];
    ipv6_address.copy_from_slice(ipv6.into_less_safe_slice());
    let mut stateless_reset_token = [0; STATELESS_RESET_TOKEN_LEN];
    stateless_reset_token.copy_from_slice(token.into_less_safe_slice());

    let connection_id = ConnectionId::try_from_bytes(cid.into_less_safe_slice())
        .map_err(|_| DecoderError::InvariantViolation("connection id exceeds 20 bytes"))?;

    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
    //# A server that chooses a zero-length connection ID MUST NOT provide
    //# a preferred address.
    decoder_invariant!(!connection_id.is_empty(), "preferred address without connection id");

    Ok(PreferredAddress {
        ipv4_address,
        ipv4_port,
        ipv6_address,
        ipv6_port,
        connection_id,
        stateless_reset_token,
    })
}

/// Limits which govern the connection after both sides' parameters are
/// known
///
/// Each endpoint enforces the smaller of what it intends and what the
/// peer advertises only for values where that is meaningful (idle
/// timeout); directional limits come from exactly one side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergedLimits {
    /// min of both non-zero idle timeouts
    pub idle_timeout: Option<Duration>,
    pub max_udp_payload_size: u16,
}

pub fn merged_limits(
    local: &TransportParameters,
    peer: &TransportParameters,
) -> MergedLimits {
    //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
    //# Each endpoint advertises a max_idle_timeout, but the effective
    //# value at an endpoint is computed as the minimum of the two
    //# advertised values (or the sole advertised value, if only one
    //# endpoint advertises a non-zero value).
    let idle_timeout = match (local.max_idle_timeout(), peer.max_idle_timeout()) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    };

    let max_udp_payload_size = local
        .max_udp_payload_size
        .min(peer.max_udp_payload_size)
        .as_u64()
        .min(u16::MAX as u64) as u16;

    MergedLimits {
        idle_timeout,
        max_udp_payload_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_codec::EncoderBuffer;

    fn round_trip(params: &TransportParameters) -> TransportParameters {
        let mut bytes = vec![0u8; 1024];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            encoder.encode(params);
            encoder.len()
        };
        let buffer = DecoderBuffer::new(&bytes[..len]);
        let (decoded, remaining) = buffer.decode::<TransportParameters>().unwrap();
        assert!(remaining.is_empty());
        decoded
    }

    #[test]
    fn default_round_trip_test() {
        let params = TransportParameters::default();
        // all defaults encode to an empty sequence
        assert_eq!(params.encoding_size(), 0);
        assert_eq!(round_trip(&params), params);
    }

    #[test]
    fn full_round_trip_test() {
        let params = TransportParameters {
            max_idle_timeout: VarInt::from_u32(30_000),
            max_udp_payload_size: VarInt::from_u16(1472),
            initial_max_data: VarInt::from_u32(1_000_000),
            initial_max_stream_data_bidi_local: VarInt::from_u32(65_536),
            initial_max_stream_data_bidi_remote: VarInt::from_u32(65_536),
            initial_max_stream_data_uni: VarInt::from_u32(32_768),
            initial_max_streams_bidi: VarInt::from_u8(100),
            initial_max_streams_uni: VarInt::from_u8(3),
            ack_delay_exponent: 8,
            max_ack_delay: VarInt::from_u8(50),
            disable_active_migration: true,
            active_connection_id_limit: VarInt::from_u8(4),
            original_destination_connection_id: Some(
                ConnectionId::try_from_bytes(&[1, 2, 3, 4]).unwrap(),
            ),
            initial_source_connection_id: Some(
                ConnectionId::try_from_bytes(&[5, 6, 7, 8]).unwrap(),
            ),
            retry_source_connection_id: None,
            stateless_reset_token: Some([0xab; 16]),
            preferred_address: Some(PreferredAddress {
                ipv4_address: [192, 0, 2, 1],
                ipv4_port: 443,
                ipv6_address: [0x20; 16],
                ipv6_port: 8443,
                connection_id: ConnectionId::try_from_bytes(&[9, 9, 9]).unwrap(),
                stateless_reset_token: [0xcd; 16],
            }),
        };
        assert_eq!(round_trip(&params), params);
    }

    #[test]
    fn duplicate_parameter_is_rejected_test() {
        // initial_max_data twice
        let bytes = [0x04u8, 0x01, 0x05, 0x04, 0x01, 0x06];
        let buffer = DecoderBuffer::new(&bytes);
        assert!(buffer.decode::<TransportParameters>().is_err());
    }

    #[test]
    fn unknown_parameter_is_ignored_test() {
        // a grease-style unknown parameter followed by initial_max_data
        let bytes = [0x21u8, 0x02, 0xaa, 0xbb, 0x04, 0x01, 0x07];
        let buffer = DecoderBuffer::new(&bytes);
        let (params, _) = buffer.decode::<TransportParameters>().unwrap();
        assert_eq!(params.initial_max_data, VarInt::from_u8(7));
    }

    #[test]
    fn validation_test() {
        let mut params = TransportParameters {
            max_udp_payload_size: VarInt::from_u16(1100),
            ..Default::default()
        };
        assert!(params.validate(endpoint::Type::Server).is_err());

        params.max_udp_payload_size = VarInt::from_u16(1500);
        assert!(params.validate(endpoint::Type::Server).is_ok());

        // server-only parameter sent by a client
        params.stateless_reset_token = Some([0; 16]);
        assert!(params.validate(endpoint::Type::Client).is_err());
        assert!(params.validate(endpoint::Type::Server).is_ok());
    }

    #[test]
    fn idle_timeout_merge_test() {
        let local = TransportParameters {
            max_idle_timeout: VarInt::from_u32(30_000),
            ..Default::default()
        };
        let peer = TransportParameters {
            max_idle_timeout: VarInt::from_u32(10_000),
            ..Default::default()
        };

        let merged = merged_limits(&local, &peer);
        assert_eq!(merged.idle_timeout, Some(Duration::from_secs(10)));

        let silent_peer = TransportParameters::default();
        let merged = merged_limits(&local, &silent_peer);
        assert_eq!(merged.idle_timeout, Some(Duration::from_secs(30)));
    }
}
