// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// The role a connection plays in the handshake
///
/// The role decides stream-id allocation, which packet types may be
/// sent, and who emits HANDSHAKE_DONE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Client,
    Server,
}

impl Type {
    #[inline]
    pub fn is_client(self) -> bool {
        matches!(self, Self::Client)
    }

    #[inline]
    pub fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }

    /// The opposite role
    #[inline]
    pub fn peer_type(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}
