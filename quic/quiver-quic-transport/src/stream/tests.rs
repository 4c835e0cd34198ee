// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{flow::StreamCountController, testing::RecordingSink};
use quiver_quic_core::transport::error::Code;

fn varint(value: u64) -> VarInt {
    VarInt::new(value).unwrap()
}

fn manager(local: endpoint::Type) -> StreamManager {
    let limits = StreamLimits {
        local_bidi_recv: varint(1000),
        remote_bidi_recv: varint(1000),
        uni_recv: varint(1000),
        local_bidi_send: varint(1000),
        remote_bidi_send: varint(1000),
        uni_send: varint(1000),
    };
    StreamManager::new(
        local,
        limits,
        StreamCountController::new(varint(10), varint(10)),
        StreamCountController::new(varint(10), varint(10)),
    )
}

fn remote_bidi(ordinal: u64) -> StreamId {
    // streams opened by the peer of a client endpoint
    StreamId::nth(endpoint::Type::Server, StreamType::Bidirectional, ordinal).unwrap()
}

#[test]
fn local_open_allocates_in_order_test() {
    let mut manager = manager(endpoint::Type::Client);
    let first = manager.open(StreamType::Bidirectional).unwrap();
    let second = manager.open(StreamType::Bidirectional).unwrap();
    assert_eq!(first.as_varint().as_u64(), 0);
    assert_eq!(second.as_varint().as_u64(), 4);

    let uni = manager.open(StreamType::Unidirectional).unwrap();
    assert_eq!(uni.as_varint().as_u64(), 2);
}

#[test]
fn remote_stream_created_on_first_frame_test() {
    let mut manager = manager(endpoint::Type::Client);
    let mut sink = RecordingSink::default();

    let growth = manager
        .on_stream_frame(remote_bidi(0), 0, Bytes::from_static(b"hi"), false, &mut sink)
        .unwrap();
    assert_eq!(growth, 2);
    assert_eq!(sink.opened_streams, vec![remote_bidi(0)]);
}

#[test]
fn higher_stream_implicitly_opens_lower_test() {
    let mut manager = manager(endpoint::Type::Client);
    let mut sink = RecordingSink::default();

    manager
        .on_stream_frame(remote_bidi(2), 0, Bytes::from_static(b"hi"), false, &mut sink)
        .unwrap();
    assert_eq!(
        sink.opened_streams,
        vec![remote_bidi(0), remote_bidi(1), remote_bidi(2)]
    );

    // a late frame for the implicitly-created stream 1 still works
    manager
        .on_stream_frame(remote_bidi(1), 0, Bytes::from_static(b"yo"), false, &mut sink)
        .unwrap();
    assert_eq!(sink.opened_streams.len(), 3);
}

#[test]
fn stream_limit_enforcement_test() {
    let mut manager = manager(endpoint::Type::Client);
    let mut sink = RecordingSink::default();

    let err = manager
        .on_stream_frame(remote_bidi(10), 0, Bytes::new(), false, &mut sink)
        .unwrap_err();
    assert_eq!(err.code, Code::STREAM_LIMIT_ERROR);
}

#[test]
fn frame_on_send_only_stream_is_rejected_test() {
    let mut manager = manager(endpoint::Type::Client);
    let mut sink = RecordingSink::default();

    // a client-initiated uni stream cannot carry data toward the client
    let id = StreamId::nth(endpoint::Type::Client, StreamType::Unidirectional, 0).unwrap();
    let err = manager
        .on_stream_frame(id, 0, Bytes::new(), false, &mut sink)
        .unwrap_err();
    assert_eq!(err.code, Code::STREAM_STATE_ERROR);
}

#[test]
fn late_frame_after_close_is_ignored_test() {
    let mut manager = manager(endpoint::Type::Client);
    let mut sink = RecordingSink::default();
    let id = remote_bidi(0);

    manager
        .on_stream_frame(id, 0, Bytes::from_static(b"all"), true, &mut sink)
        .unwrap();
    // a reader drains the receive side; finish the send half too
    manager.set_read_callback(id, Box::new(|_| {})).unwrap();
    manager.close_stream(id).unwrap();
    let tx = manager.try_send(id, 100, 1000).unwrap();
    assert!(tx.is_fin);
    manager.on_stream_data_acked(id, 0, 0, true);
    assert_eq!(manager.stream_count(), 0);

    // a retransmitted copy arrives afterwards
    let growth = manager
        .on_stream_frame(id, 0, Bytes::from_static(b"all"), true, &mut sink)
        .unwrap();
    assert_eq!(growth, 0);
}

#[test]
fn round_robin_fairness_test() {
    let mut manager = manager(endpoint::Type::Client);
    let a = manager.open(StreamType::Bidirectional).unwrap();
    let b = manager.open(StreamType::Bidirectional).unwrap();

    manager.send(a, b"aaaa").unwrap();
    manager.send(b, b"bbbb").unwrap();

    // duplicates are not enqueued
    manager.notify_active(a);

    let first = manager.pop_active().unwrap();
    let second = manager.pop_active().unwrap();
    assert_eq!((first, second), (a, b));
    assert!(manager.pop_active().is_none());
}

#[test]
fn reset_control_frame_emission_test() {
    let mut manager = manager(endpoint::Type::Client);
    let id = manager.open(StreamType::Bidirectional).unwrap();
    manager.send(id, b"data").unwrap();
    manager
        .reset_stream(id, application::Error::new(varint(5)))
        .unwrap();

    let mut pending = VecDeque::new();
    manager.collect_control_frames(&mut pending);

    assert!(pending.iter().any(|frame| matches!(
        frame,
        crate::PendingFrame::ResetStream(reset)
            if reset.application_error_code == varint(5)
    )));
}

#[test]
fn max_streams_update_emission_test() {
    let mut manager = manager(endpoint::Type::Client);
    let mut sink = RecordingSink::default();

    // open and finish enough remote streams to trigger replenishment
    for ordinal in 0..6u64 {
        let id = remote_bidi(ordinal);
        manager
            .on_stream_frame(id, 0, Bytes::from_static(b"x"), true, &mut sink)
            .unwrap();
        manager.set_read_callback(id, Box::new(|_| {})).unwrap();
        manager.close_stream(id).unwrap();
        let _ = manager.try_send(id, 100, 1000);
        manager.on_stream_data_acked(id, 0, 1, true);
    }
    assert_eq!(manager.stream_count(), 0);

    let mut pending = VecDeque::new();
    manager.collect_control_frames(&mut pending);
    assert!(pending
        .iter()
        .any(|frame| matches!(frame, crate::PendingFrame::MaxStreams(_))));
}
