// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    decoder::{DecoderBuffer, DecoderBufferMut},
    encoder::{estimator::EncoderLenEstimator, Encoder},
};
use byteorder::{ByteOrder, NetworkEndian};
use core::{convert::TryFrom, mem::size_of};

/// A value which can be encoded into an `Encoder`
pub trait EncoderValue: Sized {
    /// Encodes the value into the encoder
    fn encode<E: Encoder>(&self, encoder: &mut E);

    /// Returns the number of bytes `encode` will write
    #[inline]
    fn encoding_size(&self) -> usize {
        let mut estimator = EncoderLenEstimator::new(usize::MAX);
        self.encode(&mut estimator);
        estimator.len()
    }

    /// Returns the encoding size given the remaining capacity of `encoder`
    #[inline]
    fn encoding_size_for_encoder<E: Encoder>(&self, _encoder: &E) -> usize {
        self.encoding_size()
    }

    /// Encodes the value prefixed with its length as a `Len`
    #[inline]
    fn encode_with_len_prefix<Len: TryFrom<usize> + EncoderValue, E: Encoder>(
        &self,
        encoder: &mut E,
    ) where
        Len::Error: core::fmt::Debug,
    {
        let len = self.encoding_size_for_encoder(encoder);
        let prefix = Len::try_from(len).expect("length prefix out of range");
        prefix.encode(encoder);
        self.encode(encoder);
    }

    /// Encodes the value into a freshly-allocated vec
    #[cfg(feature = "alloc")]
    fn encode_to_vec(&self) -> alloc::vec::Vec<u8> {
        let mut bytes = alloc::vec![0u8; self.encoding_size()];
        let mut encoder = crate::EncoderBuffer::new(&mut bytes);
        self.encode(&mut encoder);
        let len = encoder.len();
        bytes.truncate(len);
        bytes
    }
}

impl EncoderValue for u8 {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_sized(1, |dest| dest[0] = *self)
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        1
    }
}

macro_rules! encoder_value_network_endian {
    ($call:ident, $ty:ty) => {
        impl EncoderValue for $ty {
            #[inline]
            fn encode<E: Encoder>(&self, encoder: &mut E) {
                encoder.write_sized(size_of::<Self>(), |dest| {
                    NetworkEndian::$call(dest, *self);
                })
            }

            #[inline]
            fn encoding_size(&self) -> usize {
                size_of::<Self>()
            }
        }
    };
}

encoder_value_network_endian!(write_u16, u16);
encoder_value_network_endian!(write_u32, u32);
encoder_value_network_endian!(write_u64, u64);

macro_rules! encoder_value_slice {
    ($ty:ty, |$self:ident| $value:expr) => {
        impl EncoderValue for $ty {
            #[inline]
            fn encode<E: Encoder>(&$self, encoder: &mut E) {
                encoder.write_slice($value)
            }

            #[inline]
            fn encoding_size(&self) -> usize {
                self.len()
            }
        }
    };
}

encoder_value_slice!(&[u8], |self| self);
encoder_value_slice!(&mut [u8], |self| self);
encoder_value_slice!(DecoderBuffer<'_>, |self| self.as_less_safe_slice());
encoder_value_slice!(DecoderBufferMut<'_>, |self| self.as_less_safe_slice());

impl<const LEN: usize> EncoderValue for [u8; LEN] {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(self)
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        LEN
    }
}

#[cfg(feature = "bytes")]
impl EncoderValue for bytes::Bytes {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_bytes(self)
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.len()
    }
}

impl EncoderValue for () {
    #[inline]
    fn encode<E: Encoder>(&self, _encoder: &mut E) {}

    #[inline]
    fn encoding_size(&self) -> usize {
        0
    }
}

impl<T: EncoderValue> EncoderValue for Option<T> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        if let Some(value) = self {
            value.encode(encoder)
        }
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.as_ref().map_or(0, |value| value.encoding_size())
    }
}

#[cfg(feature = "alloc")]
impl EncoderValue for alloc::vec::Vec<u8> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(self)
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.len()
    }
}
