// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use quiver_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
//# A server sends a NEW_TOKEN frame (type=0x07) to provide the client
//# with a token to send in the header of an Initial packet for a future
//# connection.

pub const TAG: Tag = 0x07;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewToken<Data> {
    pub token: Data,
}

impl<Data> NewToken<Data> {
    #[inline]
    pub const fn tag(&self) -> Tag {
        TAG
    }

    #[inline]
    pub fn map_data<F: FnOnce(Data) -> Out, Out>(self, map: F) -> NewToken<Out> {
        NewToken {
            token: map(self.token),
        }
    }
}

decoder_parameterized_value!(
    impl<'a, Data> NewToken<Data> {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let (token_slice, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
            //# A client MUST treat receipt of a NEW_TOKEN frame with an empty
            //# Token field as a connection error of type FRAME_ENCODING_ERROR.
            quiver_codec::decoder_invariant!(!token_slice.is_empty(), "empty new token");

            let (token, remaining) = token_slice.decode::<Data>()?;
            remaining.ensure_empty()?;
            Ok((NewToken { token }, buffer))
        }
    }
);

impl<Data: EncoderValue> EncoderValue for NewToken<Data> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG);
        encoder.encode_with_len_prefix::<VarInt, _>(&self.token);
    }
}
