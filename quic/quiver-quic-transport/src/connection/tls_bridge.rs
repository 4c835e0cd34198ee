// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buffering adapter between the TLS engine and the connection
//!
//! The engine is driven with a `&mut dyn Context`; buffering its
//! outputs here and applying them afterwards keeps the engine unaware
//! of connection internals and the borrow graph trivial.

use quiver_quic_core::{
    crypto::{tls, EncryptionLevel, HeaderKey, Key, KeyPair},
    transport,
};

#[derive(Default)]
pub struct TlsBridge {
    pub read_keys: Vec<(EncryptionLevel, KeyPair)>,
    pub write_keys: Vec<(EncryptionLevel, KeyPair)>,
    pub handshake_data: Vec<(EncryptionLevel, Vec<u8>)>,
    pub peer_transport_parameters: Option<Vec<u8>>,
    pub handshake_complete: bool,
    pub alert: Option<(EncryptionLevel, u8)>,
    pub error: Option<transport::Error>,
}

impl tls::Context for TlsBridge {
    fn install_read_keys(
        &mut self,
        level: EncryptionLevel,
        key: Box<dyn Key>,
        header_key: Box<dyn HeaderKey>,
    ) {
        self.read_keys.push((level, KeyPair { key, header_key }));
    }

    fn install_write_keys(
        &mut self,
        level: EncryptionLevel,
        key: Box<dyn Key>,
        header_key: Box<dyn HeaderKey>,
    ) {
        self.write_keys.push((level, KeyPair { key, header_key }));
    }

    fn deliver_handshake_data(&mut self, level: EncryptionLevel, data: &[u8]) {
        self.handshake_data.push((level, data.to_vec()));
    }

    fn on_peer_transport_parameters(&mut self, data: &[u8]) -> Result<(), transport::Error> {
        self.peer_transport_parameters = Some(data.to_vec());
        Ok(())
    }

    fn on_handshake_complete(&mut self) {
        self.handshake_complete = true;
    }

    fn on_alert(&mut self, level: EncryptionLevel, alert: u8) {
        self.alert = Some((level, alert));
    }

    fn flush_flight(&mut self) {
        // transmission is pull-based; a completed flight needs no signal
    }
}
