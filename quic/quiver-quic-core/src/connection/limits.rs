// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{transport::parameters::TransportParameters, varint::VarInt};
use core::time::Duration;

//= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
//# The default for this parameter is the maximum permitted UDP payload of
//# 65527.
pub const MAX_UDP_PAYLOAD_DEFAULT: u16 = 65527;

/// Locally-configured connection limits
///
/// These seed the transport parameters advertised to the peer. Values
/// which are negotiated down by the peer are reflected in the merged
/// parameter view, not here.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_idle_timeout: Duration,
    pub max_udp_payload_size: u16,
    pub initial_max_data: VarInt,
    pub initial_max_stream_data_bidi_local: VarInt,
    pub initial_max_stream_data_bidi_remote: VarInt,
    pub initial_max_stream_data_uni: VarInt,
    pub initial_max_streams_bidi: VarInt,
    pub initial_max_streams_uni: VarInt,
    pub ack_delay_exponent: u8,
    pub max_ack_delay: Duration,
    pub active_connection_id_limit: VarInt,
    pub migration_support: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_idle_timeout: Duration::from_secs(30),
            max_udp_payload_size: MAX_UDP_PAYLOAD_DEFAULT,
            initial_max_data: VarInt::from_u32(10 * 1024 * 1024),
            initial_max_stream_data_bidi_local: VarInt::from_u32(1024 * 1024),
            initial_max_stream_data_bidi_remote: VarInt::from_u32(1024 * 1024),
            initial_max_stream_data_uni: VarInt::from_u32(1024 * 1024),
            initial_max_streams_bidi: VarInt::from_u16(100),
            initial_max_streams_uni: VarInt::from_u16(100),
            //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
            //# If this value is absent, a default value of 3 is assumed
            ack_delay_exponent: 3,
            //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
            //# If this value is absent, a default of 25 milliseconds is assumed
            max_ack_delay: Duration::from_millis(25),
            active_connection_id_limit: VarInt::from_u8(4),
            migration_support: true,
        }
    }
}

impl Limits {
    /// Builds the transport parameters this endpoint advertises
    pub fn to_transport_parameters(&self) -> TransportParameters {
        TransportParameters {
            max_idle_timeout: VarInt::new(self.max_idle_timeout.as_millis() as u64)
                .unwrap_or(VarInt::MAX),
            max_udp_payload_size: VarInt::from_u16(self.max_udp_payload_size),
            initial_max_data: self.initial_max_data,
            initial_max_stream_data_bidi_local: self.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: self.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: self.initial_max_stream_data_uni,
            initial_max_streams_bidi: self.initial_max_streams_bidi,
            initial_max_streams_uni: self.initial_max_streams_uni,
            ack_delay_exponent: self.ack_delay_exponent,
            max_ack_delay: VarInt::new(self.max_ack_delay.as_millis() as u64)
                .unwrap_or(VarInt::MAX),
            disable_active_migration: !self.migration_support,
            active_connection_id_limit: self.active_connection_id_limit,
            ..Default::default()
        }
    }
}
