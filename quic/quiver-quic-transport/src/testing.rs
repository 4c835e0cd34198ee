// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for in-crate tests

use crate::event::ConnectionEventSink;
use bytes::Bytes;
use quiver_quic_core::{
    application, connection,
    crypto::{self, tls, EncryptionLevel},
    endpoint,
    stream::StreamId,
    transport,
};
use std::sync::{Arc, Mutex};

/// Records every event for later assertions
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub closed: Vec<connection::Error>,
    pub handshake_confirmed: usize,
    pub opened_streams: Vec<StreamId>,
    pub reset_streams: Vec<(StreamId, application::Error)>,
    pub issued_cids: Vec<u64>,
    pub retired_cids: Vec<u64>,
    pub tokens: Vec<Bytes>,
}

impl ConnectionEventSink for RecordingSink {
    fn on_connection_closed(&mut self, error: connection::Error) {
        self.closed.push(error);
    }

    fn on_handshake_confirmed(&mut self) {
        self.handshake_confirmed += 1;
    }

    fn on_stream_opened(&mut self, id: StreamId) {
        self.opened_streams.push(id);
    }

    fn on_stream_reset(&mut self, id: StreamId, error: application::Error) {
        self.reset_streams.push((id, error));
    }

    fn on_connection_id_issued(&mut self, hash: u64) {
        self.issued_cids.push(hash);
    }

    fn on_connection_id_retired(&mut self, hash: u64) {
        self.retired_cids.push(hash);
    }

    fn on_new_token(&mut self, token: Bytes) {
        self.tokens.push(token);
    }
}

/// A sink handle that can outlive the connection owning it
#[derive(Clone, Default)]
pub struct SharedSink(pub Arc<Mutex<RecordingSink>>);

impl SharedSink {
    pub fn recording(&self) -> std::sync::MutexGuard<'_, RecordingSink> {
        self.0.lock().unwrap()
    }
}

impl ConnectionEventSink for SharedSink {
    fn on_connection_closed(&mut self, error: connection::Error) {
        self.recording().on_connection_closed(error)
    }

    fn on_handshake_confirmed(&mut self) {
        self.recording().on_handshake_confirmed()
    }

    fn on_stream_opened(&mut self, id: StreamId) {
        self.recording().on_stream_opened(id)
    }

    fn on_stream_reset(&mut self, id: StreamId, error: application::Error) {
        self.recording().on_stream_reset(id, error)
    }

    fn on_connection_id_issued(&mut self, hash: u64) {
        self.recording().on_connection_id_issued(hash)
    }

    fn on_connection_id_retired(&mut self, hash: u64) {
        self.recording().on_connection_id_retired(hash)
    }

    fn on_new_token(&mut self, token: Bytes) {
        self.recording().on_new_token(token)
    }
}

// a toy handshake: CLIENT_HELLO → SERVER_HELLO + SERVER_FLIGHT →
// CLIENT_FINISHED, with null keys and the transport parameters riding
// in the hello/flight payloads
const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const SERVER_FLIGHT: u8 = 3;
const CLIENT_FINISHED: u8 = 4;

fn message(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(3 + payload.len());
    bytes.push(tag);
    bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

fn null_keys() -> (Box<dyn crypto::Key>, Box<dyn crypto::HeaderKey>) {
    (
        Box::new(crypto::testing::Key::new()),
        Box::new(crypto::testing::HeaderKey::new()),
    )
}

/// A deterministic, scripted stand-in for a TLS engine
pub struct TestEngine {
    role: endpoint::Type,
    local_params: Vec<u8>,
}

impl TestEngine {
    pub fn new(role: endpoint::Type) -> Self {
        Self {
            role,
            local_params: Vec::new(),
        }
    }

    fn on_message(
        &mut self,
        tag: u8,
        payload: &[u8],
        context: &mut dyn tls::Context,
    ) -> Result<(), transport::Error> {
        match (self.role, tag) {
            (endpoint::Type::Server, CLIENT_HELLO) => {
                context.on_peer_transport_parameters(payload)?;

                let (key, header_key) = null_keys();
                context.install_read_keys(EncryptionLevel::Handshake, key, header_key);
                let (key, header_key) = null_keys();
                context.install_write_keys(EncryptionLevel::Handshake, key, header_key);
                let (key, header_key) = null_keys();
                context.install_read_keys(EncryptionLevel::Application, key, header_key);
                let (key, header_key) = null_keys();
                context.install_write_keys(EncryptionLevel::Application, key, header_key);

                context.deliver_handshake_data(
                    EncryptionLevel::Initial,
                    &message(SERVER_HELLO, &[]),
                );
                context.deliver_handshake_data(
                    EncryptionLevel::Handshake,
                    &message(SERVER_FLIGHT, &self.local_params),
                );
                context.flush_flight();
                Ok(())
            }
            (endpoint::Type::Client, SERVER_HELLO) => {
                let (key, header_key) = null_keys();
                context.install_read_keys(EncryptionLevel::Handshake, key, header_key);
                let (key, header_key) = null_keys();
                context.install_write_keys(EncryptionLevel::Handshake, key, header_key);
                Ok(())
            }
            (endpoint::Type::Client, SERVER_FLIGHT) => {
                context.on_peer_transport_parameters(payload)?;

                let (key, header_key) = null_keys();
                context.install_read_keys(EncryptionLevel::Application, key, header_key);
                let (key, header_key) = null_keys();
                context.install_write_keys(EncryptionLevel::Application, key, header_key);

                context.deliver_handshake_data(
                    EncryptionLevel::Handshake,
                    &message(CLIENT_FINISHED, &[]),
                );
                context.flush_flight();
                context.on_handshake_complete();
                Ok(())
            }
            (endpoint::Type::Server, CLIENT_FINISHED) => {
                context.on_handshake_complete();
                Ok(())
            }
            _ => Err(transport::Error::PROTOCOL_VIOLATION.with_reason("unexpected message")),
        }
    }
}

impl tls::HandshakeEngine for TestEngine {
    fn set_transport_parameters(&mut self, parameters: &[u8]) {
        self.local_params = parameters.to_vec();
    }

    fn start(&mut self, context: &mut dyn tls::Context) -> Result<(), transport::Error> {
        if self.role.is_client() {
            context.deliver_handshake_data(
                EncryptionLevel::Initial,
                &message(CLIENT_HELLO, &self.local_params),
            );
            context.flush_flight();
        }
        Ok(())
    }

    fn on_crypto_data(
        &mut self,
        _level: EncryptionLevel,
        data: &[u8],
        context: &mut dyn tls::Context,
    ) -> Result<(), transport::Error> {
        let mut rest = data;
        while !rest.is_empty() {
            if rest.len() < 3 {
                return Err(
                    transport::Error::PROTOCOL_VIOLATION.with_reason("truncated message")
                );
            }
            let tag = rest[0];
            let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
            if rest.len() < 3 + len {
                return Err(
                    transport::Error::PROTOCOL_VIOLATION.with_reason("truncated message")
                );
            }
            let payload = &rest[3..3 + len];
            rest = &rest[3 + len..];
            self.on_message(tag, payload, context)?;
        }
        Ok(())
    }
}
