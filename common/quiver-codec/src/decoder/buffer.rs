// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::decoder::{
    impl_buffer,
    value::{DecoderParameterizedValue, DecoderValue},
    DecoderError,
};

/// A read-only view over a byte slice with a consuming cursor
///
/// Every decode operation returns the decoded value together with the
/// remaining buffer, so a partially-consumed buffer can never be reused
/// by mistake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderBuffer<'a> {
    bytes: &'a [u8],
}

pub type DecoderBufferResult<'a, T> = Result<(T, DecoderBuffer<'a>), DecoderError>;

impl<'a> DecoderBuffer<'a> {
    #[inline]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Consumes the buffer, returning the underlying slice
    #[inline]
    pub fn into_less_safe_slice(self) -> &'a [u8] {
        self.bytes
    }
}

impl_buffer!(
    DecoderBuffer,
    DecoderBufferResult,
    DecoderValue,
    decode,
    DecoderParameterizedValue,
    decode_parameterized,
    split_at
);

impl<'a> From<&'a [u8]> for DecoderBuffer<'a> {
    #[inline]
    fn from(bytes: &'a [u8]) -> Self {
        Self::new(bytes)
    }
}

#[cfg(feature = "bytes")]
impl<'a> From<&'a bytes::Bytes> for DecoderBuffer<'a> {
    #[inline]
    fn from(bytes: &'a bytes::Bytes) -> Self {
        Self::new(bytes.as_ref())
    }
}
