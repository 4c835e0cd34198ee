// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The TLS handshake boundary
//!
//! The engine is fed reassembled CRYPTO-frame payload and answers
//! through the `Context` callbacks: handshake bytes to be framed as
//! CRYPTO at a given level, key installs as secrets become available,
//! the peer's transport parameters, and alerts.

use crate::{
    crypto::{EncryptionLevel, Key, HeaderKey},
    transport,
};
use alloc::boxed::Box;

/// An abstract TLS handshake engine
pub trait HandshakeEngine: Send {
    /// Hands the engine this endpoint's encoded transport parameters for
    /// the quic_transport_parameters extension
    fn set_transport_parameters(&mut self, parameters: &[u8]);

    /// Starts the handshake; on a client this produces the ClientHello
    fn start(&mut self, context: &mut dyn Context) -> Result<(), transport::Error>;

    /// Feeds reassembled CRYPTO payload received at `level` into the
    /// engine
    fn on_crypto_data(
        &mut self,
        level: EncryptionLevel,
        data: &[u8],
        context: &mut dyn Context,
    ) -> Result<(), transport::Error>;
}

/// Callbacks the engine drives while making progress
pub trait Context {
    /// Install keys for opening packets received at `level`
    fn install_read_keys(
        &mut self,
        level: EncryptionLevel,
        key: Box<dyn Key>,
        header_key: Box<dyn HeaderKey>,
    );

    /// Install keys for sealing packets sent at `level`
    fn install_write_keys(
        &mut self,
        level: EncryptionLevel,
        key: Box<dyn Key>,
        header_key: Box<dyn HeaderKey>,
    );

    /// The engine produced handshake bytes to be carried in CRYPTO
    /// frames at `level`
    fn deliver_handshake_data(&mut self, level: EncryptionLevel, data: &[u8]);

    /// The peer's encoded transport parameters arrived in the handshake
    fn on_peer_transport_parameters(&mut self, data: &[u8]) -> Result<(), transport::Error>;

    /// The handshake completed successfully
    fn on_handshake_complete(&mut self);

    /// The engine raised a fatal TLS alert
    fn on_alert(&mut self, level: EncryptionLevel, alert: u8);

    /// All buffered handshake data for the current flight is complete
    /// and may be transmitted
    fn flush_flight(&mut self);
}
