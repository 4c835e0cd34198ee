// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::decoder::{
    buffer::{DecoderBuffer, DecoderBufferResult},
    buffer_mut::{DecoderBufferMut, DecoderBufferMutResult},
};
use byteorder::{ByteOrder, NetworkEndian};

/// A value which can be decoded from a read-only buffer
pub trait DecoderValue<'a>: Sized {
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self>;
}

/// A value which can be decoded from a mutable buffer
pub trait DecoderValueMut<'a>: Sized {
    fn decode_mut(buffer: DecoderBufferMut<'a>) -> DecoderBufferMutResult<'a, Self>;
}

/// A value whose decoding depends on a previously-read parameter,
/// e.g. a frame body selected by its type tag
pub trait DecoderParameterizedValue<'a>: Sized {
    type Parameter;

    fn decode_parameterized(
        parameter: Self::Parameter,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self>;
}

pub trait DecoderParameterizedValueMut<'a>: Sized {
    type Parameter;

    fn decode_parameterized_mut(
        parameter: Self::Parameter,
        buffer: DecoderBufferMut<'a>,
    ) -> DecoderBufferMutResult<'a, Self>;
}

/// Implements `DecoderValue` and `DecoderValueMut` from a single body
#[macro_export]
macro_rules! decoder_value {
    (impl<$lt:lifetime $(, $generic:ident)*> $ty:ty {
        fn decode($buffer:ident: Buffer) -> Result<Self> $body:block
    }) => {
        impl<$lt $(, $generic: $crate::DecoderValue<$lt>)*> $crate::DecoderValue<$lt> for $ty {
            #[inline]
            fn decode(
                buffer: $crate::DecoderBuffer<$lt>,
            ) -> $crate::DecoderBufferResult<$lt, Self> {
                let $buffer = buffer;
                $body
            }
        }

        impl<$lt $(, $generic: $crate::DecoderValueMut<$lt>)*> $crate::DecoderValueMut<$lt> for $ty {
            #[inline]
            fn decode_mut(
                buffer: $crate::DecoderBufferMut<$lt>,
            ) -> $crate::DecoderBufferMutResult<$lt, Self> {
                let $buffer = buffer;
                $body
            }
        }
    };
}

/// Implements `DecoderParameterizedValue` and `DecoderParameterizedValueMut`
/// from a single body
#[macro_export]
macro_rules! decoder_parameterized_value {
    (impl<$lt:lifetime $(, $generic:ident)*> $ty:ty {
        fn decode($param:ident: $param_ty:ty, $buffer:ident: Buffer) -> Result<Self> $body:block
    }) => {
        impl<$lt $(, $generic: $crate::DecoderValue<$lt>)*> $crate::DecoderParameterizedValue<$lt>
            for $ty
        {
            type Parameter = $param_ty;

            #[inline]
            fn decode_parameterized(
                parameter: $param_ty,
                buffer: $crate::DecoderBuffer<$lt>,
            ) -> $crate::DecoderBufferResult<$lt, Self> {
                let $param = parameter;
                let $buffer = buffer;
                $body
            }
        }

        impl<$lt $(, $generic: $crate::DecoderValueMut<$lt>)*>
            $crate::DecoderParameterizedValueMut<$lt> for $ty
        {
            type Parameter = $param_ty;

            #[inline]
            fn decode_parameterized_mut(
                parameter: $param_ty,
                buffer: $crate::DecoderBufferMut<$lt>,
            ) -> $crate::DecoderBufferMutResult<$lt, Self> {
                let $param = parameter;
                let $buffer = buffer;
                $body
            }
        }
    };
}

macro_rules! decoder_value_integer {
    ($ty:ident, $len:expr, $read:expr) => {
        impl<'a> DecoderValue<'a> for $ty {
            #[inline]
            fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
                let (slice, buffer) = buffer.decode_slice($len)?;
                let value = $read(slice.into_less_safe_slice());
                Ok((value, buffer))
            }
        }

        impl<'a> DecoderValueMut<'a> for $ty {
            #[inline]
            fn decode_mut(buffer: DecoderBufferMut<'a>) -> DecoderBufferMutResult<'a, Self> {
                let (slice, buffer) = buffer.decode_slice($len)?;
                let value = $read(slice.into_less_safe_slice());
                Ok((value, buffer))
            }
        }
    };
}

decoder_value_integer!(u8, 1, |slice: &[u8]| slice[0]);
decoder_value_integer!(u16, 2, NetworkEndian::read_u16);
decoder_value_integer!(u32, 4, NetworkEndian::read_u32);
decoder_value_integer!(u64, 8, NetworkEndian::read_u64);

impl<'a> DecoderValue<'a> for &'a [u8] {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let len = buffer.len();
        let (slice, buffer) = buffer.decode_slice(len)?;
        Ok((slice.into_less_safe_slice(), buffer))
    }
}

impl<'a> DecoderValueMut<'a> for &'a [u8] {
    #[inline]
    fn decode_mut(buffer: DecoderBufferMut<'a>) -> DecoderBufferMutResult<'a, Self> {
        let len = buffer.len();
        let (slice, buffer) = buffer.decode_slice(len)?;
        Ok((slice.into_less_safe_slice(), buffer))
    }
}

impl<'a> DecoderValueMut<'a> for &'a mut [u8] {
    #[inline]
    fn decode_mut(buffer: DecoderBufferMut<'a>) -> DecoderBufferMutResult<'a, Self> {
        let len = buffer.len();
        let (slice, buffer) = buffer.decode_slice(len)?;
        Ok((slice.into_less_safe_slice(), buffer))
    }
}

// The buffers themselves decode by consuming all remaining bytes. This is
// what lets frame payload fields be generic over the buffer type.
impl<'a> DecoderValue<'a> for DecoderBuffer<'a> {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let len = buffer.len();
        buffer.decode_slice(len)
    }
}

impl<'a> DecoderValueMut<'a> for DecoderBuffer<'a> {
    #[inline]
    fn decode_mut(buffer: DecoderBufferMut<'a>) -> DecoderBufferMutResult<'a, Self> {
        let len = buffer.len();
        let (slice, buffer) = buffer.decode_slice(len)?;
        Ok((slice.freeze(), buffer))
    }
}

impl<'a> DecoderValueMut<'a> for DecoderBufferMut<'a> {
    #[inline]
    fn decode_mut(buffer: DecoderBufferMut<'a>) -> DecoderBufferMutResult<'a, Self> {
        let len = buffer.len();
        buffer.decode_slice(len)
    }
}

impl<'a> DecoderValue<'a> for () {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        Ok(((), buffer))
    }
}

impl<'a> DecoderValueMut<'a> for () {
    #[inline]
    fn decode_mut(buffer: DecoderBufferMut<'a>) -> DecoderBufferMutResult<'a, Self> {
        Ok(((), buffer))
    }
}
