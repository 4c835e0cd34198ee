// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{ack, connection::ConnectionId, stream::StreamType, varint::VarInt};
use quiver_codec::{DecoderBuffer, EncoderBuffer};

fn varint(value: u64) -> VarInt {
    VarInt::new(value).unwrap()
}

/// Encodes `frame`, decodes it back, and checks both the value and the
/// consumed length
fn round_trip<F>(frame: F) -> FrameRef<'static>
where
    F: EncoderValue + core::fmt::Debug,
{
    let mut bytes = vec![0u8; 1500];
    let len = {
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&frame);
        encoder.len()
    };
    assert_eq!(len, frame.encoding_size(), "encoding_size mismatch {frame:?}");
    bytes.truncate(len);

    // leak the encoded bytes so the decoded view can be returned
    let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
    let buffer = DecoderBuffer::new(bytes);
    let (decoded, remaining) = buffer.decode::<FrameRef>().unwrap();
    assert!(
        remaining.is_empty(),
        "decoder consumed {} of {len} bytes for {frame:?}",
        len - remaining.len()
    );
    decoded
}

#[test]
fn ping_round_trip_test() {
    assert_eq!(round_trip(Ping), Ping.into());
}

#[test]
fn handshake_done_round_trip_test() {
    assert_eq!(round_trip(HandshakeDone), HandshakeDone.into());
}

#[test]
fn reset_stream_round_trip_test() {
    let frame = ResetStream {
        stream_id: varint(4),
        application_error_code: varint(77),
        final_size: varint(16_385),
    };
    assert_eq!(round_trip(frame), frame.into());
}

#[test]
fn stop_sending_round_trip_test() {
    let frame = StopSending {
        stream_id: varint(8),
        application_error_code: varint(1),
    };
    assert_eq!(round_trip(frame), frame.into());
}

#[test]
fn max_data_round_trip_test() {
    let frame = MaxData {
        maximum_data: varint(1_073_741_824),
    };
    assert_eq!(round_trip(frame), frame.into());
}

#[test]
fn max_stream_data_round_trip_test() {
    let frame = MaxStreamData {
        stream_id: varint(12),
        maximum_stream_data: varint(65_536),
    };
    assert_eq!(round_trip(frame), frame.into());
}

#[test]
fn max_streams_round_trip_test() {
    for stream_type in [StreamType::Bidirectional, StreamType::Unidirectional] {
        let frame = MaxStreams {
            stream_type,
            maximum_streams: varint(100),
        };
        assert_eq!(round_trip(frame), frame.into());
    }
}

#[test]
fn data_blocked_round_trip_test() {
    let frame = DataBlocked {
        data_limit: varint(4096),
    };
    assert_eq!(round_trip(frame), frame.into());
}

#[test]
fn stream_data_blocked_round_trip_test() {
    let frame = StreamDataBlocked {
        stream_id: varint(3),
        stream_data_limit: varint(1024),
    };
    assert_eq!(round_trip(frame), frame.into());
}

#[test]
fn streams_blocked_round_trip_test() {
    for stream_type in [StreamType::Bidirectional, StreamType::Unidirectional] {
        let frame = StreamsBlocked {
            stream_type,
            stream_limit: varint(10),
        };
        assert_eq!(round_trip(frame), frame.into());
    }
}

#[test]
fn new_connection_id_round_trip_test() {
    let frame = NewConnectionId {
        sequence_number: varint(7),
        retire_prior_to: varint(3),
        connection_id: ConnectionId::try_from_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
        stateless_reset_token: [0xee; 16],
    };
    assert_eq!(round_trip(frame), frame.into());
}

#[test]
fn new_connection_id_rejects_inverted_retire_test() {
    let frame = NewConnectionId {
        sequence_number: varint(2),
        retire_prior_to: varint(5),
        connection_id: ConnectionId::try_from_bytes(&[1]).unwrap(),
        stateless_reset_token: [0; 16],
    };
    let mut bytes = [0u8; 64];
    let len = {
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&frame);
        encoder.len()
    };
    let buffer = DecoderBuffer::new(&bytes[..len]);
    assert!(buffer.decode::<FrameRef>().is_err());
}

#[test]
fn retire_connection_id_round_trip_test() {
    let frame = RetireConnectionId {
        sequence_number: varint(9),
    };
    assert_eq!(round_trip(frame), frame.into());
}

#[test]
fn path_challenge_round_trip_test() {
    let frame = PathChallenge {
        data: [1, 2, 3, 4, 5, 6, 7, 8],
    };
    assert_eq!(round_trip(frame), frame.into());
}

#[test]
fn path_response_round_trip_test() {
    let frame = PathResponse {
        data: [8, 7, 6, 5, 4, 3, 2, 1],
    };
    assert_eq!(round_trip(frame), frame.into());
}

#[test]
fn connection_close_round_trip_test() {
    // transport variant with a reason
    let frame = ConnectionClose {
        error_code: varint(0x03),
        frame_type: Some(varint(0x08)),
        reason: Some(&b"flow control"[..]),
    };
    match round_trip(frame) {
        Frame::ConnectionClose(decoded) => {
            assert_eq!(decoded.error_code, varint(0x03));
            assert_eq!(decoded.frame_type, Some(varint(0x08)));
            assert_eq!(
                decoded.reason.unwrap().into_less_safe_slice(),
                b"flow control"
            );
        }
        other => panic!("expected connection close, got {other:?}"),
    }

    // application variant without a reason
    let frame: ConnectionClose<&[u8]> = ConnectionClose {
        error_code: varint(99),
        frame_type: None,
        reason: None,
    };
    match round_trip(frame) {
        Frame::ConnectionClose(decoded) => {
            assert!(decoded.is_application_close());
            assert_eq!(decoded.error_code, varint(99));
            assert!(decoded.reason.is_none());
        }
        other => panic!("expected connection close, got {other:?}"),
    }
}

#[test]
fn crypto_round_trip_test() {
    let frame = Crypto {
        offset: varint(1200),
        data: &b"client hello bytes"[..],
    };
    match round_trip(frame) {
        Frame::Crypto(decoded) => {
            assert_eq!(decoded.offset, varint(1200));
            assert_eq!(
                decoded.data.into_less_safe_slice(),
                b"client hello bytes"
            );
        }
        other => panic!("expected crypto, got {other:?}"),
    }
}

#[test]
fn new_token_round_trip_test() {
    let frame = NewToken {
        token: &b"resumption token"[..],
    };
    match round_trip(frame) {
        Frame::NewToken(decoded) => {
            assert_eq!(decoded.token.into_less_safe_slice(), b"resumption token");
        }
        other => panic!("expected new token, got {other:?}"),
    }
}

#[test]
fn stream_round_trip_test() {
    for (offset, is_fin, is_last_frame) in [
        (0u64, false, false),
        (0, true, false),
        (4096, false, false),
        (4096, true, true),
    ] {
        let frame = Stream {
            stream_id: varint(4),
            offset: varint(offset),
            is_last_frame,
            is_fin,
            data: &b"stream payload"[..],
        };
        match round_trip(frame) {
            Frame::Stream(decoded) => {
                assert_eq!(decoded.stream_id, varint(4));
                assert_eq!(decoded.offset, varint(offset));
                assert_eq!(decoded.is_fin, is_fin);
                assert_eq!(decoded.is_last_frame, is_last_frame);
                assert_eq!(decoded.data.into_less_safe_slice(), b"stream payload");
            }
            other => panic!("expected stream, got {other:?}"),
        }
    }
}

#[test]
fn ack_round_trip_test() {
    let mut ranges = ack::Ranges::new();
    ranges.insert(varint(0)..=varint(2));
    ranges.insert(varint(5)..=varint(5));
    ranges.insert(varint(8)..=varint(12));

    let frame = Ack {
        ack_delay: varint(100),
        ranges: ranges.clone(),
        ecn_counts: None,
    };

    match round_trip(frame) {
        Frame::Ack(decoded) => {
            assert_eq!(decoded.largest_acknowledged(), varint(12));
            assert_eq!(decoded.ack_delay, varint(100));
            let expected: Vec<_> = ranges.ack_ranges().collect();
            let actual: Vec<_> = decoded.ranges.ack_ranges().collect();
            assert_eq!(expected, actual);
            assert_eq!(decoded.ranges.smallest_acknowledged(), varint(0));
            assert!(decoded.ecn_counts.is_none());
        }
        other => panic!("expected ack, got {other:?}"),
    }
}

#[test]
fn ack_ecn_round_trip_test() {
    let mut ranges = ack::Ranges::new();
    ranges.insert(varint(3)..=varint(4));

    let frame = Ack {
        ack_delay: varint(0),
        ranges,
        ecn_counts: Some(EcnCounts {
            ect_0_count: varint(10),
            ect_1_count: varint(0),
            ce_count: varint(2),
        }),
    };

    match round_trip(frame) {
        Frame::Ack(decoded) => {
            assert_eq!(
                decoded.ecn_counts,
                Some(EcnCounts {
                    ect_0_count: varint(10),
                    ect_1_count: varint(0),
                    ce_count: varint(2),
                })
            );
        }
        other => panic!("expected ack, got {other:?}"),
    }
}

#[test]
fn ack_malformed_gap_is_rejected_test() {
    // largest=1, range count=1, first range=1 (smallest=0), then a gap
    // which would underflow below zero
    let bytes = [0x02u8, 0x01, 0x00, 0x01, 0x01, 0x05, 0x00];
    let buffer = DecoderBuffer::new(&bytes);
    assert!(buffer.decode::<FrameRef>().is_err());
}

#[test]
fn unknown_frame_is_rejected_test() {
    let bytes = [0x40u8, 0x20];
    let buffer = DecoderBuffer::new(&bytes);
    assert!(buffer.decode::<FrameRef>().is_err());
}

#[test]
fn ack_elicitation_test() {
    let ack_frame: Frame<ack::Ranges, &[u8]> = Frame::Ack(Ack {
        ack_delay: varint(0),
        ranges: {
            let mut ranges = ack::Ranges::new();
            ranges.insert_value(varint(0));
            ranges
        },
        ecn_counts: None,
    });

    assert!(!ack_frame.is_ack_eliciting());
    assert!(!Frame::<ack::Ranges, &[u8]>::Padding(Padding { length: 10 }).is_ack_eliciting());
    assert!(Frame::<ack::Ranges, &[u8]>::Ping(Ping).is_ack_eliciting());

    assert!(Frame::<ack::Ranges, &[u8]>::PathChallenge(PathChallenge { data: [0; 8] })
        .is_probing());
    assert!(!Frame::<ack::Ranges, &[u8]>::Ping(Ping).is_probing());
}
