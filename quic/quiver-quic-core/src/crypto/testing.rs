// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic crypto for tests
//!
//! The null key passes payloads through unchanged with a zero-length
//! tag; the xor variants make protection observable without pulling a
//! real AEAD into the tree.

use crate::{
    crypto::{
        self, EncryptionLevel, HeaderProtectionMask, HeaderProtectionSample, KeyPair,
    },
    endpoint,
};
use alloc::boxed::Box;

/// The byte the null key writes where a real AEAD would put its tag
const TAG_FILL: u8 = 0xaa;

#[derive(Clone, Copy, Debug, Default)]
pub struct Key {
    xor: u8,
    tag_len: usize,
    pub fail_on_open: bool,
}

impl Key {
    pub fn new() -> Self {
        Self::default()
    }

    /// A key which xors payload bytes, so "encrypted" bytes differ from
    /// plaintext in tests
    pub fn xor(mask: u8) -> Self {
        Self {
            xor: mask,
            tag_len: 0,
            fail_on_open: false,
        }
    }

    /// A key with a tag, to exercise tag accounting in the packet codec
    pub fn with_tag_len(tag_len: usize) -> Self {
        Self {
            xor: 0,
            tag_len,
            fail_on_open: false,
        }
    }
}

impl crypto::Key for Key {
    fn seal(
        &mut self,
        _packet_number: u64,
        _header: &[u8],
        payload: &mut [u8],
    ) -> Result<(), crypto::Error> {
        let split = payload.len().checked_sub(self.tag_len).ok_or(
            crypto::Error::Internal("sealing buffer smaller than tag"),
        )?;
        let (plaintext, tag) = payload.split_at_mut(split);
        for byte in plaintext {
            *byte ^= self.xor;
        }
        tag.fill(TAG_FILL);
        Ok(())
    }

    fn open(
        &self,
        _packet_number: u64,
        _header: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, crypto::Error> {
        if self.fail_on_open {
            return Err(crypto::Error::AuthenticationFailed);
        }
        let split = payload
            .len()
            .checked_sub(self.tag_len)
            .ok_or(crypto::Error::Truncated)?;
        for byte in &mut payload[..split] {
            *byte ^= self.xor;
        }
        Ok(split)
    }

    fn tag_len(&self) -> usize {
        self.tag_len
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderKey {
    mask: u8,
}

impl HeaderKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn xor(mask: u8) -> Self {
        Self { mask }
    }
}

impl crypto::HeaderKey for HeaderKey {
    fn header_protection_mask(&self, _sample: &HeaderProtectionSample) -> HeaderProtectionMask {
        [self.mask; crypto::HEADER_PROTECTION_MASK_LEN]
    }
}

/// Builds a null key pair for one direction of `level`
pub fn key_pair(_level: EncryptionLevel) -> KeyPair {
    KeyPair {
        key: Box::new(Key::new()),
        header_key: Box::new(HeaderKey::new()),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct InitialKeyProvider;

impl crypto::initial::InitialKeyProvider for InitialKeyProvider {
    fn sealer(&self, _dcid: &[u8], _local: endpoint::Type) -> KeyPair {
        key_pair(EncryptionLevel::Initial)
    }

    fn opener(&self, _dcid: &[u8], _local: endpoint::Type) -> KeyPair {
        key_pair(EncryptionLevel::Initial)
    }
}
