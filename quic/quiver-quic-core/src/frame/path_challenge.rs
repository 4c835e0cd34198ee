// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::Tag;
use quiver_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.17
//# Endpoints can use PATH_CHALLENGE frames (type=0x1a) to check
//# reachability to the peer and for path validation during connection
//# migration.

pub const TAG: Tag = 0x1a;

pub const DATA_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathChallenge {
    /// 8 bytes of unpredictable data; the peer echoes them in a
    /// PATH_RESPONSE
    pub data: [u8; DATA_LEN],
}

impl PathChallenge {
    #[inline]
    pub const fn tag(&self) -> Tag {
        TAG
    }
}

decoder_parameterized_value!(
    impl<'a> PathChallenge {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let (slice, buffer) = buffer.decode_slice(DATA_LEN)?;
            let mut data = [0; DATA_LEN];
            data.copy_from_slice(slice.into_less_safe_slice());
            Ok((PathChallenge { data }, buffer))
        }
    }
);

impl EncoderValue for PathChallenge {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG);
        encoder.encode(&self.data);
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        1 + DATA_LEN
    }
}
