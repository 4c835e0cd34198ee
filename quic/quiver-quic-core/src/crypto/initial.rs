// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{crypto::KeyPair, endpoint};
use hex_literal::hex;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.2
//# initial_salt = 0x38762cf7f55934b34d179ae6a4c80cadccbb7f0a
pub const INITIAL_SALT: [u8; 20] = hex!("38762cf7f55934b34d179ae6a4c80cadccbb7f0a");

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.2
//# The hash function for HKDF when deriving initial secrets and keys is
//# SHA-256

/// Derives Initial-level keys from the client's destination connection ID
///
/// The derivation itself (HKDF-SHA256 with the fixed salt, then
/// AES-128-GCM) belongs to the crypto provider; the transport only knows
/// that the same DCID yields the same keys on both endpoints, and that a
/// Retry packet forces re-derivation from the new DCID.
pub trait InitialKeyProvider: Send {
    /// Keys for sealing outbound Initial packets
    fn sealer(&self, dcid: &[u8], local: endpoint::Type) -> KeyPair;

    /// Keys for opening inbound Initial packets
    fn opener(&self, dcid: &[u8], local: endpoint::Type) -> KeyPair;
}
