// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{application, transport};
use core::fmt;

/// The reason a connection ended
///
/// Exactly one of these is surfaced through the event sink when the
/// connection reaches its terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The connection was closed without an error
    Closed { initiator: Initiator },
    /// The connection was closed on the transport level, either locally
    /// or by the peer
    Transport {
        error: transport::Error,
        initiator: Initiator,
    },
    /// The application closed the connection or reset the stream
    Application {
        error: application::Error,
        initiator: Initiator,
    },
    /// The connection was idle longer than the negotiated idle timeout
    IdleTimeout,
    /// Every candidate path failed validation
    NoValidPath,
    /// The endpoint ran out of a local resource
    Internal { reason: &'static str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Initiator {
    Local,
    Remote,
}

impl Initiator {
    #[inline]
    pub fn is_local(self) -> bool {
        matches!(self, Self::Local)
    }
}

impl Error {
    #[inline]
    pub fn initiator(&self) -> Option<Initiator> {
        match self {
            Self::Closed { initiator }
            | Self::Transport { initiator, .. }
            | Self::Application { initiator, .. } => Some(*initiator),
            _ => None,
        }
    }
}

impl From<transport::Error> for Error {
    #[inline]
    fn from(error: transport::Error) -> Self {
        if error.code == transport::error::Code::NO_ERROR {
            Self::Closed {
                initiator: Initiator::Local,
            }
        } else {
            Self::Transport {
                error,
                initiator: Initiator::Local,
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Closed { .. } => write!(f, "connection closed without error"),
            Self::Transport { error, .. } => write!(f, "transport error: {error}"),
            Self::Application { error, .. } => write!(f, "application error: {error}"),
            Self::IdleTimeout => write!(f, "connection idle timeout expired"),
            Self::NoValidPath => write!(f, "no valid network path"),
            Self::Internal { reason } => write!(f, "internal error: {reason}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
