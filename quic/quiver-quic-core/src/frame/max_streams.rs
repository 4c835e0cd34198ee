// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, stream::StreamType, varint::VarInt};
use quiver_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.11
//# A MAX_STREAMS frame (type=0x12 or 0x13) informs the peer of the
//# cumulative number of streams of a given type it is permitted to open.

pub const TAG_BIDI: Tag = 0x12;
pub const TAG_UNI: Tag = 0x13;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxStreams {
    pub stream_type: StreamType,
    pub maximum_streams: VarInt,
}

impl MaxStreams {
    #[inline]
    pub fn tag(&self) -> Tag {
        match self.stream_type {
            StreamType::Bidirectional => TAG_BIDI,
            StreamType::Unidirectional => TAG_UNI,
        }
    }
}

decoder_parameterized_value!(
    impl<'a> MaxStreams {
        fn decode(tag: Tag, buffer: Buffer) -> Result<Self> {
            let stream_type = if tag == TAG_BIDI {
                StreamType::Bidirectional
            } else {
                StreamType::Unidirectional
            };
            let (maximum_streams, buffer) = buffer.decode::<VarInt>()?;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.11
            //# This value cannot exceed 2^60, as it is not possible to encode
            //# stream IDs larger than 2^62-1.
            quiver_codec::decoder_invariant!(
                maximum_streams.as_u64() <= 1 << 60,
                "max streams limit exceeded"
            );

            Ok((
                MaxStreams {
                    stream_type,
                    maximum_streams,
                },
                buffer,
            ))
        }
    }
);

impl EncoderValue for MaxStreams {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());
        encoder.encode(&self.maximum_streams);
    }
}
