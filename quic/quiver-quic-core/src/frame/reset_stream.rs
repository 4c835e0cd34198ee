// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use quiver_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.4
//# An endpoint uses a RESET_STREAM frame (type=0x04) to abruptly
//# terminate the sending part of a stream.

pub const TAG: Tag = 0x04;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetStream {
    pub stream_id: VarInt,

    pub application_error_code: VarInt,

    /// The number of bytes the sender had committed to the stream when
    /// it was reset
    pub final_size: VarInt,
}

impl ResetStream {
    #[inline]
    pub const fn tag(&self) -> Tag {
        TAG
    }
}

decoder_parameterized_value!(
    impl<'a> ResetStream {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let (stream_id, buffer) = buffer.decode()?;
            let (application_error_code, buffer) = buffer.decode()?;
            let (final_size, buffer) = buffer.decode()?;
            Ok((
                ResetStream {
                    stream_id,
                    application_error_code,
                    final_size,
                },
                buffer,
            ))
        }
    }
);

impl EncoderValue for ResetStream {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG);
        encoder.encode(&self.stream_id);
        encoder.encode(&self.application_error_code);
        encoder.encode(&self.final_size);
    }
}
