// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::{
    convert::{TryFrom, TryInto},
    fmt,
    ops::Deref,
};
use quiver_codec::{decoder_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-16
//# The QUIC variable-length integer encoding reserves the two most
//# significant bits of the first byte to encode the base 2 logarithm of
//# the integer encoding length in bytes.  The integer value is encoded
//# on the remaining bits, in network byte order.

pub const MAX_VARINT_VALUE: u64 = 4_611_686_018_427_387_903;

const MAX_1_BYTE: u64 = (1 << 6) - 1;
const MAX_2_BYTE: u64 = (1 << 14) - 1;
const MAX_4_BYTE: u64 = (1 << 30) - 1;

#[derive(Clone, Copy, Debug)]
pub struct VarIntError;

impl fmt::Display for VarIntError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "varint range exceeded")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for VarIntError {}

/// An unsigned integer in the range `0..=2^62-1`
///
/// All length, offset and identifier fields on the wire are `VarInt`s,
/// which means overflow can be ruled out at construction instead of at
/// every use site.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct VarInt(u64);

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl VarInt {
    pub const MAX: Self = Self(MAX_VARINT_VALUE);
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn new(value: u64) -> Result<Self, VarIntError> {
        if value > MAX_VARINT_VALUE {
            return Err(VarIntError);
        }
        Ok(Self(value))
    }

    /// Returns a `VarInt` without validating the value is in range
    ///
    /// # Safety
    ///
    /// Callers need to ensure the value is at most `VarInt::MAX`
    #[inline]
    pub const unsafe fn new_unchecked(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        Self(value as u64)
    }

    #[inline]
    pub const fn from_u16(value: u16) -> Self {
        Self(value as u64)
    }

    #[inline]
    pub const fn from_u32(value: u32) -> Self {
        Self(value as u64)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the number of bytes the shortest wire form occupies
    #[inline]
    pub const fn encoding_len(self) -> usize {
        match self.0 {
            0..=MAX_1_BYTE => 1,
            0..=MAX_2_BYTE => 2,
            0..=MAX_4_BYTE => 4,
            _ => 8,
        }
    }

    #[inline]
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        Self::new(self.0.checked_add(rhs.0)?).ok()
    }

    #[inline]
    pub fn checked_add_usize(self, rhs: usize) -> Option<Self> {
        let rhs = rhs.try_into().ok()?;
        self.checked_add(rhs)
    }

    #[inline]
    #[must_use]
    pub fn saturating_add(self, rhs: Self) -> Self {
        Self::new(self.0.saturating_add(rhs.0)).unwrap_or(Self::MAX)
    }

    #[inline]
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        Some(Self(self.0.checked_sub(rhs.0)?))
    }

    #[inline]
    #[must_use]
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub fn checked_mul(self, rhs: Self) -> Option<Self> {
        Self::new(self.0.checked_mul(rhs.0)?).ok()
    }

    #[inline]
    pub fn checked_shl(self, rhs: u32) -> Option<Self> {
        Self::new(self.0.checked_shl(rhs)?).ok()
    }
}

impl EncoderValue for VarInt {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let value = self.0;
        match self.encoding_len() {
            1 => encoder.write_sized(1, |dest| dest[0] = value as u8),
            2 => encoder.write_sized(2, |dest| {
                dest.copy_from_slice(&((value as u16) | (0b01 << 14)).to_be_bytes())
            }),
            4 => encoder.write_sized(4, |dest| {
                dest.copy_from_slice(&((value as u32) | (0b10 << 30)).to_be_bytes())
            }),
            _ => encoder.write_sized(8, |dest| {
                dest.copy_from_slice(&(value | (0b11 << 62)).to_be_bytes())
            }),
        }
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.encoding_len()
    }
}

decoder_value!(
    impl<'a> VarInt {
        fn decode(buffer: Buffer) -> Result<Self> {
            let header = buffer.peek_byte(0)?;

            Ok(match header >> 6 {
                0b00 => {
                    let value = header & 0b0011_1111;
                    let buffer = buffer.skip(1)?;
                    (Self(value.into()), buffer)
                }
                0b01 => {
                    let (value, buffer) = buffer.decode::<u16>()?;
                    (Self((value & 0b0011_1111_1111_1111).into()), buffer)
                }
                0b10 => {
                    let (value, buffer) = buffer.decode::<u32>()?;
                    (Self((value & MAX_4_BYTE as u32).into()), buffer)
                }
                _ => {
                    let (value, buffer) = buffer.decode::<u64>()?;
                    (Self(value & MAX_VARINT_VALUE), buffer)
                }
            })
        }
    }
);

impl AsRef<u64> for VarInt {
    #[inline]
    fn as_ref(&self) -> &u64 {
        &self.0
    }
}

impl Deref for VarInt {
    type Target = u64;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

macro_rules! impl_from_lesser {
    ($ty:ty) => {
        impl From<$ty> for VarInt {
            #[inline]
            fn from(value: $ty) -> Self {
                Self(value.into())
            }
        }
    };
}

impl_from_lesser!(u8);
impl_from_lesser!(u16);
impl_from_lesser!(u32);

impl From<VarInt> for u64 {
    #[inline]
    fn from(value: VarInt) -> u64 {
        value.0
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntError;

    #[inline]
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = VarIntError;

    #[inline]
    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value as u64)
    }
}

impl TryInto<usize> for VarInt {
    type Error = <usize as TryFrom<u64>>::Error;

    #[inline]
    fn try_into(self) -> Result<usize, Self::Error> {
        self.0.try_into()
    }
}

impl core::ops::Add for VarInt {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn add(self, rhs: Self) -> Self {
        if cfg!(debug_assertions) {
            self.checked_add(rhs).expect("VarInt overflow occurred")
        } else {
            Self(self.0 + rhs.0)
        }
    }
}

impl core::ops::Add<usize> for VarInt {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn add(self, rhs: usize) -> Self {
        if cfg!(debug_assertions) {
            self.checked_add_usize(rhs).expect("VarInt overflow occurred")
        } else {
            Self(self.0 + rhs as u64)
        }
    }
}

impl core::ops::AddAssign<Self> for VarInt {
    #[inline]
    #[track_caller]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl core::ops::AddAssign<usize> for VarInt {
    #[inline]
    #[track_caller]
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl core::ops::Sub for VarInt {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: Self) -> Self {
        // Bounds check is inherited from u64
        Self(self.0 - rhs.0)
    }
}

impl core::ops::SubAssign<Self> for VarInt {
    #[inline]
    #[track_caller]
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0
    }
}

impl PartialEq<u64> for VarInt {
    #[inline]
    fn eq(&self, other: &u64) -> bool {
        self.0.eq(other)
    }
}

impl PartialEq<usize> for VarInt {
    #[inline]
    fn eq(&self, other: &usize) -> bool {
        self.0.eq(&(*other as u64))
    }
}

impl PartialOrd<u64> for VarInt {
    #[inline]
    fn partial_cmp(&self, other: &u64) -> Option<core::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

impl PartialOrd<usize> for VarInt {
    #[inline]
    fn partial_cmp(&self, other: &usize) -> Option<core::cmp::Ordering> {
        self.0.partial_cmp(&(*other as u64))
    }
}
