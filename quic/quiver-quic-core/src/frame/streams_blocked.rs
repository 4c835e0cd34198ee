// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, stream::StreamType, varint::VarInt};
use quiver_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.14
//# A sender SHOULD send a STREAMS_BLOCKED frame (type=0x16 or 0x17) when
//# it wishes to open a stream but is unable to do so due to the maximum
//# stream limit set by its peer.

pub const TAG_BIDI: Tag = 0x16;
pub const TAG_UNI: Tag = 0x17;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamsBlocked {
    pub stream_type: StreamType,
    /// The stream-count limit at which blocking occurred
    pub stream_limit: VarInt,
}

impl StreamsBlocked {
    #[inline]
    pub fn tag(&self) -> Tag {
        match self.stream_type {
            StreamType::Bidirectional => TAG_BIDI,
            StreamType::Unidirectional => TAG_UNI,
        }
    }
}

decoder_parameterized_value!(
    impl<'a> StreamsBlocked {
        fn decode(tag: Tag, buffer: Buffer) -> Result<Self> {
            let stream_type = if tag == TAG_BIDI {
                StreamType::Bidirectional
            } else {
                StreamType::Unidirectional
            };
            let (stream_limit, buffer) = buffer.decode::<VarInt>()?;

            quiver_codec::decoder_invariant!(
                stream_limit.as_u64() <= 1 << 60,
                "stream limit exceeded"
            );

            Ok((
                StreamsBlocked {
                    stream_type,
                    stream_limit,
                },
                buffer,
            ))
        }
    }
);

impl EncoderValue for StreamsBlocked {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());
        encoder.encode(&self.stream_limit);
    }
}
