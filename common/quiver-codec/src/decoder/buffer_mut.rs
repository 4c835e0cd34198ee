// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::decoder::{
    impl_buffer,
    value::{DecoderParameterizedValueMut, DecoderValueMut},
    DecoderError,
};

/// A mutable view over a byte slice with a consuming cursor
///
/// Used where decoding needs to modify bytes in place, e.g. removing
/// header protection from a received packet.
#[derive(Debug, PartialEq, Eq)]
pub struct DecoderBufferMut<'a> {
    bytes: &'a mut [u8],
}

pub type DecoderBufferMutResult<'a, T> = Result<(T, DecoderBufferMut<'a>), DecoderError>;

impl<'a> DecoderBufferMut<'a> {
    #[inline]
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// Consumes the buffer, returning the underlying slice
    #[inline]
    pub fn into_less_safe_slice(self) -> &'a mut [u8] {
        self.bytes
    }

    /// Mutably borrows the buffer's slice, discarding any panic protection
    #[inline]
    pub fn as_less_safe_slice_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    /// Freezes the buffer into a read-only view
    #[inline]
    pub fn freeze(self) -> super::DecoderBuffer<'a> {
        super::DecoderBuffer::new(self.bytes)
    }
}

impl_buffer!(
    DecoderBufferMut,
    DecoderBufferMutResult,
    DecoderValueMut,
    decode_mut,
    DecoderParameterizedValueMut,
    decode_parameterized_mut,
    split_at_mut
);
