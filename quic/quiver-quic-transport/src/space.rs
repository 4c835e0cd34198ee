// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-encryption-level keys and per-packet-number-space state

use crate::{ack_tracker::AckTracker, sent_packets::SentPackets, stream::CryptoStream};
use quiver_quic_core::{
    ack,
    crypto::{EncryptionLevel, KeyPair},
    packet::number::{PacketNumber, PacketNumberGenerator, PacketNumberSpace},
    time::Timer,
};

/// Keys for one encryption level; read and write halves arrive
/// separately as the TLS handshake progresses
#[derive(Debug, Default)]
pub struct LevelKeys {
    pub sealer: Option<KeyPair>,
    pub opener: Option<KeyPair>,
}

/// All installed keys, indexed by encryption level
#[derive(Debug)]
pub struct KeySet {
    levels: [LevelKeys; 4],
}

impl KeySet {
    pub fn new() -> Self {
        Self {
            levels: Default::default(),
        }
    }

    #[inline]
    fn index(level: EncryptionLevel) -> usize {
        match level {
            EncryptionLevel::Initial => 0,
            EncryptionLevel::EarlyData => 1,
            EncryptionLevel::Handshake => 2,
            EncryptionLevel::Application => 3,
        }
    }

    pub fn install_sealer(&mut self, level: EncryptionLevel, keys: KeyPair) {
        self.levels[Self::index(level)].sealer = Some(keys);
    }

    pub fn install_opener(&mut self, level: EncryptionLevel, keys: KeyPair) {
        self.levels[Self::index(level)].opener = Some(keys);
    }

    #[inline]
    pub fn has_sealer(&self, level: EncryptionLevel) -> bool {
        self.levels[Self::index(level)].sealer.is_some()
    }

    #[inline]
    pub fn has_opener(&self, level: EncryptionLevel) -> bool {
        self.levels[Self::index(level)].opener.is_some()
    }

    #[inline]
    pub fn sealer_mut(&mut self, level: EncryptionLevel) -> Option<&mut KeyPair> {
        self.levels[Self::index(level)].sealer.as_mut()
    }

    #[inline]
    pub fn opener(&self, level: EncryptionLevel) -> Option<&KeyPair> {
        self.levels[Self::index(level)].opener.as_ref()
    }

    //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9
    //# An endpoint MUST discard its Handshake keys when the TLS handshake
    //# is confirmed.
    pub fn discard(&mut self, level: EncryptionLevel) {
        self.levels[Self::index(level)] = LevelKeys::default();
    }
}

/// Everything scoped to one packet number space
#[derive(Debug)]
pub struct PacketSpace {
    space: PacketNumberSpace,
    pub generator: PacketNumberGenerator,
    pub ack_tracker: AckTracker,
    pub sent: SentPackets,
    pub crypto_stream: CryptoStream,
    /// Armed when a packet may be declared lost by time threshold
    pub loss_timer: Timer,
}

impl PacketSpace {
    pub fn new(space: PacketNumberSpace, ack_settings: ack::Settings) -> Self {
        Self {
            space,
            generator: PacketNumberGenerator::new(space),
            ack_tracker: AckTracker::new(ack_settings),
            sent: SentPackets::new(),
            crypto_stream: CryptoStream::new(),
            loss_timer: Timer::default(),
        }
    }

    #[inline]
    pub fn space(&self) -> PacketNumberSpace {
        self.space
    }

    /// The largest packet number the peer acknowledged in this space,
    /// used for packet-number truncation
    #[inline]
    pub fn largest_acked(&self) -> Option<PacketNumber> {
        self.sent.largest_acked().map(|pn| {
            self.space
                .new_packet_number(quiver_quic_core::varint::VarInt::new(pn).expect("valid pn"))
        })
    }
}
