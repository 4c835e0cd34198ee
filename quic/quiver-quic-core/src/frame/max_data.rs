// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use quiver_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.9
//# A MAX_DATA frame (type=0x10) is used in flow control to inform the
//# peer of the maximum amount of data that can be sent on the connection
//# as a whole.

pub const TAG: Tag = 0x10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxData {
    pub maximum_data: VarInt,
}

impl MaxData {
    #[inline]
    pub const fn tag(&self) -> Tag {
        TAG
    }
}

decoder_parameterized_value!(
    impl<'a> MaxData {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let (maximum_data, buffer) = buffer.decode()?;
            Ok((MaxData { maximum_data }, buffer))
        }
    }
);

impl EncoderValue for MaxData {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG);
        encoder.encode(&self.maximum_data);
    }
}
