// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The QUIC connection state machine
//!
//! A `Connection` is a pure stepper: datagrams go in through
//! `on_datagram`, outbound datagrams come out of `generate_outbound`,
//! and `on_timer` advances every internal clock. There is no I/O, no
//! locking and no await point anywhere in this crate; an endpoint wraps
//! the stepper in whatever runtime it likes.

pub mod ack_tracker;
pub mod cid;
pub mod connection;
pub mod event;
pub mod flow;
pub mod path;
pub mod recovery;
pub mod scheduler;
pub mod sent_packets;
pub mod session;
pub mod space;
pub mod stream;

#[cfg(test)]
mod testing;

pub use connection::{Connection, Config, Outcome};
pub use event::ConnectionEventSink;

/// An owned frame queued for (re)transmission
pub type PendingFrame = quiver_quic_core::frame::Frame<quiver_quic_core::ack::Ranges, bytes::Bytes>;
