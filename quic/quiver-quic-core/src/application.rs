// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use core::fmt;

/// An application-defined error code
///
/// Carried opaquely by RESET_STREAM, STOP_SENDING and application
/// CONNECTION_CLOSE frames; the transport never interprets it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Error(VarInt);

impl Error {
    pub const UNKNOWN: Self = Self(VarInt::MAX);

    #[inline]
    pub const fn new(code: VarInt) -> Self {
        Self(code)
    }

    #[inline]
    pub const fn as_varint(self) -> VarInt {
        self.0
    }
}

impl From<VarInt> for Error {
    #[inline]
    fn from(value: VarInt) -> Self {
        Self(value)
    }
}

impl From<Error> for VarInt {
    #[inline]
    fn from(error: Error) -> Self {
        error.0
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "application error code {}", self.0)
    }
}
