// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::Tag;
use quiver_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.1
//# A PADDING frame (type=0x00) has no semantic value.  PADDING frames
//# can be used to increase the size of a packet.

pub const TAG: Tag = 0x00;

/// A run of consecutive PADDING bytes
///
/// Decoding greedily folds a whole run of zero bytes into one frame so
/// a fully-padded Initial packet costs one frame, not 1200.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Padding {
    pub length: usize,
}

impl Padding {
    #[inline]
    pub const fn tag(&self) -> Tag {
        TAG
    }
}

decoder_parameterized_value!(
    impl<'a> Padding {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let mut length = 1;

            let peek = buffer.peek();
            let slice = peek.into_less_safe_slice();
            for byte in slice {
                if *byte != TAG {
                    break;
                }
                length += 1;
            }
            let run = length - 1;
            let buffer = buffer.skip(run)?;

            Ok((Padding { length }, buffer))
        }
    }
);

impl EncoderValue for Padding {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_repeated(self.length, TAG)
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.length
    }
}
