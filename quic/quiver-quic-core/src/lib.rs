// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire types and transport primitives for a QUIC endpoint (RFC 9000 /
//! RFC 9001): variable-length integers, frames, packets, the crypto
//! interface, packet-number arithmetic, recovery and flow-control
//! building blocks.
//!
//! This crate holds everything below the connection state machine; the
//! connection itself lives in `quiver-quic-transport`.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod ack;
pub mod application;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod frame;
pub mod interval_set;
pub mod packet;
pub mod random;
pub mod recovery;
pub mod stream;
pub mod time;
pub mod transmission;
pub mod transport;
pub mod varint;

pub use varint::VarInt;
