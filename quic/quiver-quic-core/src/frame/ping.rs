// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::Tag;
use quiver_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.2
//# Endpoints can use PING frames (type=0x01) to verify that their peers
//# are still alive or to check reachability to the peer.

pub const TAG: Tag = 0x01;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ping;

impl Ping {
    #[inline]
    pub const fn tag(&self) -> Tag {
        TAG
    }
}

decoder_parameterized_value!(
    impl<'a> Ping {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            Ok((Ping, buffer))
        }
    }
);

impl EncoderValue for Ping {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG);
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        1
    }
}
