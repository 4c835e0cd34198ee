// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{FitError, Tag},
    varint::VarInt,
};
use core::{convert::TryFrom, mem::size_of};
use quiver_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# STREAM frames implicitly create a stream and carry stream data.  The
//# Type field in the STREAM frame takes the form 0b00001XXX (or the set
//# of values from 0x08 to 0x0f).

pub const TAG: Tag = 0x08;
pub const TAG_MAX: Tag = 0x0f;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# *  The OFF bit (0x04) in the frame type is set to indicate that there
//#    is an Offset field present.

const OFF_BIT: Tag = 0x04;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# *  The LEN bit (0x02) in the frame type is set to indicate that there
//#    is a Length field present.

const LEN_BIT: Tag = 0x02;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# *  The FIN bit (0x01) indicates that the frame marks the end of the
//#    stream.

const FIN_BIT: Tag = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stream<Data> {
    pub stream_id: VarInt,

    /// Byte offset of `data` within the stream
    pub offset: VarInt,

    /// When set, the frame extends to the end of the packet and omits
    /// its Length field
    pub is_last_frame: bool,

    /// When set, `offset + data.len()` is the stream's final size
    pub is_fin: bool,

    pub data: Data,
}

impl<Data> Stream<Data> {
    #[inline]
    pub fn tag(&self) -> Tag {
        let mut tag = TAG;

        if *self.offset != 0 {
            tag |= OFF_BIT;
        }

        if !self.is_last_frame {
            tag |= LEN_BIT;
        }

        if self.is_fin {
            tag |= FIN_BIT;
        }

        tag
    }

    /// Converts the payload representation
    #[inline]
    pub fn map_data<F: FnOnce(Data) -> Out, Out>(self, map: F) -> Stream<Out> {
        Stream {
            stream_id: self.stream_id,
            offset: self.offset,
            is_last_frame: self.is_last_frame,
            is_fin: self.is_fin,
            data: map(self.data),
        }
    }
}

impl<Data: EncoderValue> Stream<Data> {
    /// Trims the frame to `capacity` bytes of packet space
    ///
    /// Updates `is_last_frame` and returns the payload length that fits,
    /// or an error if not even the frame header fits.
    #[inline]
    pub fn try_fit(&mut self, capacity: usize) -> Result<usize, FitError> {
        let mut fixed_len = size_of::<Tag>();
        fixed_len += self.stream_id.encoding_size();

        if *self.offset != 0 {
            fixed_len += self.offset.encoding_size();
        }

        let remaining_capacity = capacity.checked_sub(fixed_len).ok_or(FitError)?;

        let data_len = self.data.encoding_size();
        let max_data_len = remaining_capacity.min(data_len);

        // data which exactly fills the packet omits the length prefix
        if max_data_len == remaining_capacity {
            self.is_last_frame = true;
            return Ok(max_data_len);
        }

        self.is_last_frame = false;

        let len_prefix_size = VarInt::try_from(max_data_len)
            .map_err(|_| FitError)?
            .encoding_size();

        let prefixed_data_len = remaining_capacity
            .checked_sub(len_prefix_size)
            .ok_or(FitError)?;

        Ok(prefixed_data_len.min(data_len))
    }
}

decoder_parameterized_value!(
    impl<'a, Data> Stream<Data> {
        fn decode(tag: Tag, buffer: Buffer) -> Result<Self> {
            let has_offset = tag & OFF_BIT == OFF_BIT;
            let is_last_frame = tag & LEN_BIT != LEN_BIT;
            let is_fin = tag & FIN_BIT == FIN_BIT;

            let (stream_id, buffer) = buffer.decode()?;

            let (offset, buffer) = if has_offset {
                buffer.decode()?
            } else {
                (Default::default(), buffer)
            };

            let (data, buffer) = if is_last_frame {
                let len = buffer.len();
                let (data, buffer) = buffer.decode_slice(len)?;
                let (data, remaining) = data.decode()?;
                remaining.ensure_empty()?;
                (data, buffer)
            } else {
                buffer.decode_with_len_prefix::<VarInt, Data>()?
            };

            let frame = Stream {
                stream_id,
                offset,
                is_last_frame,
                is_fin,
                data,
            };

            Ok((frame, buffer))
        }
    }
);

impl<Data: EncoderValue> EncoderValue for Stream<Data> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());
        encoder.encode(&self.stream_id);

        if *self.offset != 0 {
            encoder.encode(&self.offset);
        }

        if self.is_last_frame {
            encoder.encode(&self.data);
        } else {
            encoder.encode_with_len_prefix::<VarInt, _>(&self.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Padding;
    use bolero::check;

    fn model(stream_id: VarInt, offset: VarInt, length: u16, capacity: usize) {
        let length = length as usize;
        let mut frame = Stream {
            stream_id,
            offset,
            is_last_frame: false,
            is_fin: false,
            data: Padding { length },
        };

        if let Ok(new_length) = frame.try_fit(capacity) {
            frame.data = Padding { length: new_length };

            assert!(
                frame.encoding_size() <= capacity,
                "encoding_size exceeds capacity {frame:?}"
            );

            if frame.is_last_frame {
                // the length prefix is omitted only when data fills the
                // packet exactly
                assert_eq!(frame.encoding_size(), capacity, "{frame:?}");
            }
        } else {
            assert!(
                frame.encoding_size() > capacity,
                "fit rejection requires an oversized frame {frame:?}"
            );
        }
    }

    #[test]
    fn try_fit_test() {
        check!()
            .with_type::<(u64, u64, u16, u16)>()
            .for_each(|(stream_id, offset, length, capacity)| {
                let (Ok(stream_id), Ok(offset)) = (VarInt::new(*stream_id), VarInt::new(*offset))
                else {
                    return;
                };
                model(stream_id, offset, *length, *capacity as usize);
            });
    }
}
