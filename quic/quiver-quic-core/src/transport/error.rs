// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use core::fmt;

//= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
//# QUIC transport error codes and application error codes share a common
//# space; an application error code is carried in frames whose type
//# identifies them as application-relevant.

/// A transport-level error, as carried by CONNECTION_CLOSE (type 0x1c)
///
/// The `frame_type` records which frame triggered the error, when known.
/// The `reason` is a static diagnostic phrase; it is never required for
/// protocol correctness.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error {
    pub code: Code,
    pub frame_type: Option<VarInt>,
    pub reason: &'static str,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Code(VarInt);

impl Code {
    #[inline]
    pub const fn new(code: VarInt) -> Self {
        Self(code)
    }

    #[inline]
    pub const fn as_varint(self) -> VarInt {
        self.0
    }
}

macro_rules! error_codes {
    ($($(#[doc = $doc:literal])* $name:ident = $value:expr;)*) => {
        impl Code {
            $(
                $(#[doc = $doc])*
                pub const $name: Self = Self(VarInt::from_u8($value));
            )*

            pub fn description(self) -> Option<&'static str> {
                match self.0.as_u64() {
                    $(
                        $value => Some(stringify!($name)),
                    )*
                    _ => None,
                }
            }
        }

        impl Error {
            $(
                $(#[doc = $doc])*
                pub const $name: Self = Self {
                    code: Code::$name,
                    frame_type: None,
                    reason: "",
                };
            )*
        }
    };
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
error_codes! {
    /// The connection is being closed abruptly in the absence of any error
    NO_ERROR = 0x0;
    /// The endpoint encountered an internal error
    INTERNAL_ERROR = 0x1;
    /// The server refused to accept a new connection
    CONNECTION_REFUSED = 0x2;
    /// Received more data than permitted in advertised data limits
    FLOW_CONTROL_ERROR = 0x3;
    /// Received a frame for a stream identifier that exceeded advertised
    /// stream limits
    STREAM_LIMIT_ERROR = 0x4;
    /// Received a frame for a stream that was not in a state that
    /// permitted that frame
    STREAM_STATE_ERROR = 0x5;
    /// Received a STREAM or RESET_STREAM frame inconsistent with an
    /// established final size
    FINAL_SIZE_ERROR = 0x6;
    /// Received a frame that was badly formatted
    FRAME_ENCODING_ERROR = 0x7;
    /// Received transport parameters that were badly formatted, absent
    /// though mandatory, or otherwise in error
    TRANSPORT_PARAMETER_ERROR = 0x8;
    /// The number of connection IDs provided exceeds the advertised
    /// active_connection_id_limit
    CONNECTION_ID_LIMIT_ERROR = 0x9;
    /// Detected an error with protocol compliance not covered by more
    /// specific error codes
    PROTOCOL_VIOLATION = 0xA;
    /// Received an invalid Retry Token in a client Initial
    INVALID_TOKEN = 0xB;
    /// The application or application protocol caused the connection to
    /// be closed
    APPLICATION_ERROR = 0xC;
    /// Received more data in CRYPTO frames than can be buffered
    CRYPTO_BUFFER_EXCEEDED = 0xD;
    /// Key update error
    KEY_UPDATE_ERROR = 0xE;
    /// The endpoint has reached the confidentiality or integrity limit
    /// for the AEAD algorithm
    AEAD_LIMIT_REACHED = 0xF;
    /// No viable network path exists
    NO_VIABLE_PATH = 0x10;
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
//# CRYPTO_ERROR (0x0100-0x01ff):  The cryptographic handshake failed.  A
//#    range of 256 values is reserved for carrying error codes specific
//#    to the cryptographic handshake that is used.
const CRYPTO_ERROR_BASE: u64 = 0x100;

impl Error {
    /// Creates an error carrying the given TLS alert code
    #[inline]
    pub const fn crypto_error(alert: u8) -> Self {
        Self {
            code: Code(VarInt::from_u16(CRYPTO_ERROR_BASE as u16 + alert as u16)),
            frame_type: None,
            reason: "",
        }
    }

    /// Attaches a static reason phrase
    #[inline]
    #[must_use]
    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }

    /// Records the frame type which triggered the error
    #[inline]
    #[must_use]
    pub const fn with_frame_type(mut self, tag: Tag) -> Self {
        self.frame_type = Some(VarInt::from_u8(tag));
        self
    }

    #[inline]
    pub fn is_crypto_error(&self) -> bool {
        (CRYPTO_ERROR_BASE..CRYPTO_ERROR_BASE + 0x100).contains(&self.code.as_varint().as_u64())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut d = f.debug_struct("transport::Error");
        match self.code.description() {
            Some(description) => d.field("code", &description),
            None => d.field("code", &self.code.as_varint().as_u64()),
        };
        if let Some(frame_type) = self.frame_type {
            d.field("frame_type", &frame_type);
        }
        if !self.reason.is_empty() {
            d.field("reason", &self.reason);
        }
        d.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.reason.is_empty() {
            write!(f, "{}", self.reason)
        } else if let Some(description) = self.code.description() {
            write!(f, "{description}")
        } else {
            write!(f, "error {}", self.code.as_varint())
        }
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.description() {
            Some(description) => write!(f, "{description}"),
            None => write!(f, "Code({})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_error_range_test() {
        let error = Error::crypto_error(40);
        assert!(error.is_crypto_error());
        assert_eq!(error.code.as_varint().as_u64(), 0x128);
        assert!(!Error::PROTOCOL_VIOLATION.is_crypto_error());
    }

    #[test]
    fn builder_test() {
        let error = Error::FLOW_CONTROL_ERROR
            .with_reason("stream data exceeds limit")
            .with_frame_type(0x08);
        assert_eq!(error.code, Code::FLOW_CONTROL_ERROR);
        assert_eq!(error.frame_type, Some(VarInt::from_u8(0x08)));
        assert_eq!(error.to_string(), "stream data exceeds limit");
    }
}
