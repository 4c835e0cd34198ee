// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// A packet-protection failure
///
/// `AuthenticationFailed` is deliberately uninformative: RFC 9001 §9.3
/// requires packets which fail AEAD verification to be discarded with no
/// observable side effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// No keys are installed (yet, or any more) for the required level
    KeysUnavailable,
    /// AEAD verification failed; the packet must be dropped silently
    AuthenticationFailed,
    /// The packet was too short to contain the required fields
    Truncated,
    /// The long header carried a version this endpoint does not speak
    UnknownVersion,
    /// A bug on our side, e.g. sealing into an undersized buffer
    Internal(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::KeysUnavailable => write!(f, "keys unavailable for encryption level"),
            Self::AuthenticationFailed => write!(f, "packet authentication failed"),
            Self::Truncated => write!(f, "packet truncated"),
            Self::UnknownVersion => write!(f, "unknown QUIC version"),
            Self::Internal(reason) => write!(f, "internal crypto error: {reason}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
