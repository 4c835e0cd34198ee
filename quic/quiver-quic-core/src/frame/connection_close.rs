// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use quiver_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.19
//# An endpoint sends a CONNECTION_CLOSE frame (type=0x1c or 0x1d) to
//# notify its peer that the connection is being closed.  The
//# CONNECTION_CLOSE frame with a type of 0x1c is used to signal errors
//# at only the QUIC layer, or the absence of errors (with the NO_ERROR
//# code).  The CONNECTION_CLOSE frame with a type of 0x1d is used to
//# signal an error with the application that uses QUIC.

pub const TAG: Tag = 0x1c;
pub const TAG_APPLICATION: Tag = 0x1d;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionClose<Data> {
    pub error_code: VarInt,

    /// The type of the frame which triggered the error; `None` marks the
    /// application variant (0x1d), which carries no frame type on the
    /// wire
    pub frame_type: Option<VarInt>,

    /// Optional human-readable diagnostic, not protocol-relevant
    pub reason: Option<Data>,
}

impl<Data> ConnectionClose<Data> {
    #[inline]
    pub fn tag(&self) -> Tag {
        if self.frame_type.is_some() {
            TAG
        } else {
            TAG_APPLICATION
        }
    }

    #[inline]
    pub fn is_application_close(&self) -> bool {
        self.frame_type.is_none()
    }

    #[inline]
    pub fn map_data<F: FnOnce(Data) -> Out, Out>(self, map: F) -> ConnectionClose<Out> {
        ConnectionClose {
            error_code: self.error_code,
            frame_type: self.frame_type,
            reason: self.reason.map(map),
        }
    }
}

decoder_parameterized_value!(
    impl<'a, Data> ConnectionClose<Data> {
        fn decode(tag: Tag, buffer: Buffer) -> Result<Self> {
            let (error_code, buffer) = buffer.decode::<VarInt>()?;

            let (frame_type, buffer) = if tag == TAG {
                let (frame_type, buffer) = buffer.decode::<VarInt>()?;
                (Some(frame_type), buffer)
            } else {
                (None, buffer)
            };

            let (reason_slice, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
            let (reason, buffer) = if reason_slice.is_empty() {
                (None, buffer)
            } else {
                let (reason, remaining) = reason_slice.decode::<Data>()?;
                remaining.ensure_empty()?;
                (Some(reason), buffer)
            };

            Ok((
                ConnectionClose {
                    error_code,
                    frame_type,
                    reason,
                },
                buffer,
            ))
        }
    }
);

impl<Data: EncoderValue> EncoderValue for ConnectionClose<Data> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());
        encoder.encode(&self.error_code);

        if let Some(frame_type) = self.frame_type {
            encoder.encode(&frame_type);
        }

        match &self.reason {
            Some(reason) => encoder.encode_with_len_prefix::<VarInt, _>(reason),
            None => encoder.encode(&VarInt::ZERO),
        }
    }
}
