// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use quiver_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.13
//# A sender SHOULD send a STREAM_DATA_BLOCKED frame (type=0x15) when it
//# wishes to send data but is unable to do so due to stream-level flow
//# control.

pub const TAG: Tag = 0x15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamDataBlocked {
    pub stream_id: VarInt,
    /// The stream-level limit at which blocking occurred
    pub stream_data_limit: VarInt,
}

impl StreamDataBlocked {
    #[inline]
    pub const fn tag(&self) -> Tag {
        TAG
    }
}

decoder_parameterized_value!(
    impl<'a> StreamDataBlocked {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let (stream_id, buffer) = buffer.decode()?;
            let (stream_data_limit, buffer) = buffer.decode()?;
            Ok((
                StreamDataBlocked {
                    stream_id,
                    stream_data_limit,
                },
                buffer,
            ))
        }
    }
);

impl EncoderValue for StreamDataBlocked {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG);
        encoder.encode(&self.stream_id);
        encoder.encode(&self.stream_data_limit);
    }
}
