// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use quiver_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.5
//# An endpoint uses a STOP_SENDING frame (type=0x05) to communicate that
//# incoming data is being discarded on receipt per application request.

pub const TAG: Tag = 0x05;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopSending {
    pub stream_id: VarInt,
    pub application_error_code: VarInt,
}

impl StopSending {
    #[inline]
    pub const fn tag(&self) -> Tag {
        TAG
    }
}

decoder_parameterized_value!(
    impl<'a> StopSending {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let (stream_id, buffer) = buffer.decode()?;
            let (application_error_code, buffer) = buffer.decode()?;
            Ok((
                StopSending {
                    stream_id,
                    application_error_code,
                },
                buffer,
            ))
        }
    }
);

impl EncoderValue for StopSending {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG);
        encoder.encode(&self.stream_id);
        encoder.encode(&self.application_error_code);
    }
}
