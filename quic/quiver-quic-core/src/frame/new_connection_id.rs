// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{connection::ConnectionId, frame::Tag, varint::VarInt};
use quiver_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
//# An endpoint sends a NEW_CONNECTION_ID frame (type=0x18) to provide
//# its peer with alternative connection IDs that can be used to break
//# linkability when migrating connections.

pub const TAG: Tag = 0x18;

pub const STATELESS_RESET_TOKEN_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewConnectionId {
    /// The sequence number assigned to the connection ID by the sender
    pub sequence_number: VarInt,

    /// Connection IDs with sequence numbers below this value are
    /// implicitly retired
    pub retire_prior_to: VarInt,

    pub connection_id: ConnectionId,

    /// Token for recognizing stateless resets issued for this ID
    pub stateless_reset_token: [u8; STATELESS_RESET_TOKEN_LEN],
}

impl NewConnectionId {
    #[inline]
    pub const fn tag(&self) -> Tag {
        TAG
    }
}

decoder_parameterized_value!(
    impl<'a> NewConnectionId {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let (sequence_number, buffer) = buffer.decode::<VarInt>()?;
            let (retire_prior_to, buffer) = buffer.decode::<VarInt>()?;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# Receipt of the same frame multiple times MUST NOT be treated as
            //# a connection error.  A receiver can use the sequence number
            //# supplied in the NEW_CONNECTION_ID frame to handle receiving the
            //# same NEW_CONNECTION_ID frame multiple times.
            quiver_codec::decoder_invariant!(
                retire_prior_to <= sequence_number,
                "retire_prior_to exceeds sequence_number"
            );

            let (id_slice, buffer) = buffer.decode_slice_with_len_prefix::<u8>()?;
            let id_slice = id_slice.into_less_safe_slice();

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# This value MUST NOT be zero, and MUST NOT exceed 20 bytes.
            quiver_codec::decoder_invariant!(
                !id_slice.is_empty(),
                "zero-length connection id"
            );
            let connection_id = match ConnectionId::try_from_bytes(id_slice) {
                Ok(id) => id,
                Err(_) => {
                    return Err(quiver_codec::DecoderError::InvariantViolation(
                        "connection id exceeds 20 bytes",
                    ))
                }
            };

            let (token_slice, buffer) = buffer.decode_slice(STATELESS_RESET_TOKEN_LEN)?;
            let mut stateless_reset_token = [0; STATELESS_RESET_TOKEN_LEN];
            stateless_reset_token.copy_from_slice(token_slice.into_less_safe_slice());

            Ok((
                NewConnectionId {
                    sequence_number,
                    retire_prior_to,
                    connection_id,
                    stateless_reset_token,
                },
                buffer,
            ))
        }
    }
);

impl EncoderValue for NewConnectionId {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG);
        encoder.encode(&self.sequence_number);
        encoder.encode(&self.retire_prior_to);
        encoder.encode(&(self.connection_id.len() as u8));
        encoder.encode(&self.connection_id);
        encoder.encode(&self.stateless_reset_token);
    }
}
