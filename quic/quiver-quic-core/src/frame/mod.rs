// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! QUIC frames (RFC 9000 §19)
//!
//! Every frame is a plain record with its own `encode`/`decode`; the
//! `Frame` enum dispatches decoding on the type tag. Frames which carry
//! payload are generic over the payload representation (`Data`) so the
//! same codec serves borrowed wire views and owned retransmission
//! queues; the ACK frame is generic over its range source the same way.

use quiver_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderError, DecoderParameterizedValue, DecoderValue,
    Encoder, EncoderValue,
};

pub mod ack;
pub mod connection_close;
pub mod crypto;
pub mod data_blocked;
pub mod handshake_done;
pub mod max_data;
pub mod max_stream_data;
pub mod max_streams;
pub mod new_connection_id;
pub mod new_token;
pub mod padding;
pub mod path_challenge;
pub mod path_response;
pub mod ping;
pub mod reset_stream;
pub mod retire_connection_id;
pub mod stop_sending;
pub mod stream;
pub mod stream_data_blocked;
pub mod streams_blocked;

pub use ack::{Ack, AckRanges, AckRangesDecoder, EcnCounts};
pub use connection_close::ConnectionClose;
pub use crypto::Crypto;
pub use data_blocked::DataBlocked;
pub use handshake_done::HandshakeDone;
pub use max_data::MaxData;
pub use max_stream_data::MaxStreamData;
pub use max_streams::MaxStreams;
pub use new_connection_id::NewConnectionId;
pub use new_token::NewToken;
pub use padding::Padding;
pub use path_challenge::PathChallenge;
pub use path_response::PathResponse;
pub use ping::Ping;
pub use reset_stream::ResetStream;
pub use retire_connection_id::RetireConnectionId;
pub use stop_sending::StopSending;
pub use stream::Stream;
pub use stream_data_blocked::StreamDataBlocked;
pub use streams_blocked::StreamsBlocked;

pub type Tag = u8;

/// The frame did not fit in the remaining packet capacity
///
/// This is not a protocol error: the caller finalizes the current packet
/// and retries in the next one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FitError;

/// A decoded frame borrowing from the packet payload
pub type FrameRef<'a> = Frame<AckRangesDecoder<'a>, DecoderBuffer<'a>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame<A, Data> {
    Padding(Padding),
    Ping(Ping),
    Ack(Ack<A>),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto<Data>),
    NewToken(NewToken<Data>),
    Stream(Stream<Data>),
    MaxData(MaxData),
    MaxStreamData(MaxStreamData),
    MaxStreams(MaxStreams),
    DataBlocked(DataBlocked),
    StreamDataBlocked(StreamDataBlocked),
    StreamsBlocked(StreamsBlocked),
    NewConnectionId(NewConnectionId),
    RetireConnectionId(RetireConnectionId),
    PathChallenge(PathChallenge),
    PathResponse(PathResponse),
    ConnectionClose(ConnectionClose<Data>),
    HandshakeDone(HandshakeDone),
}

macro_rules! impl_from_frame {
    ($variant:ident, $ty:ty) => {
        impl<A, Data> From<$ty> for Frame<A, Data> {
            #[inline]
            fn from(frame: $ty) -> Self {
                Frame::$variant(frame)
            }
        }
    };
}

impl_from_frame!(Padding, Padding);
impl_from_frame!(Ping, Ping);
impl_from_frame!(Ack, Ack<A>);
impl_from_frame!(ResetStream, ResetStream);
impl_from_frame!(StopSending, StopSending);
impl_from_frame!(Crypto, Crypto<Data>);
impl_from_frame!(NewToken, NewToken<Data>);
impl_from_frame!(Stream, Stream<Data>);
impl_from_frame!(MaxData, MaxData);
impl_from_frame!(MaxStreamData, MaxStreamData);
impl_from_frame!(MaxStreams, MaxStreams);
impl_from_frame!(DataBlocked, DataBlocked);
impl_from_frame!(StreamDataBlocked, StreamDataBlocked);
impl_from_frame!(StreamsBlocked, StreamsBlocked);
impl_from_frame!(NewConnectionId, NewConnectionId);
impl_from_frame!(RetireConnectionId, RetireConnectionId);
impl_from_frame!(PathChallenge, PathChallenge);
impl_from_frame!(PathResponse, PathResponse);
impl_from_frame!(ConnectionClose, ConnectionClose<Data>);
impl_from_frame!(HandshakeDone, HandshakeDone);

impl<A, Data> Frame<A, Data> {
    pub fn tag(&self) -> Tag {
        match self {
            Frame::Padding(frame) => frame.tag(),
            Frame::Ping(frame) => frame.tag(),
            Frame::Ack(frame) => frame.tag(),
            Frame::ResetStream(frame) => frame.tag(),
            Frame::StopSending(frame) => frame.tag(),
            Frame::Crypto(frame) => frame.tag(),
            Frame::NewToken(frame) => frame.tag(),
            Frame::Stream(frame) => frame.tag(),
            Frame::MaxData(frame) => frame.tag(),
            Frame::MaxStreams(frame) => frame.tag(),
            Frame::MaxStreamData(frame) => frame.tag(),
            Frame::DataBlocked(frame) => frame.tag(),
            Frame::StreamDataBlocked(frame) => frame.tag(),
            Frame::StreamsBlocked(frame) => frame.tag(),
            Frame::NewConnectionId(frame) => frame.tag(),
            Frame::RetireConnectionId(frame) => frame.tag(),
            Frame::PathChallenge(frame) => frame.tag(),
            Frame::PathResponse(frame) => frame.tag(),
            Frame::ConnectionClose(frame) => frame.tag(),
            Frame::HandshakeDone(frame) => frame.tag(),
        }
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2
    //# Packets containing PADDING, ACK, and CONNECTION_CLOSE frames are
    //# not ack-eliciting.
    #[inline]
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding(_) | Frame::Ack(_) | Frame::ConnectionClose(_)
        )
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-9.1
    //# PATH_CHALLENGE, PATH_RESPONSE, NEW_CONNECTION_ID, and PADDING
    //# frames are "probing frames", and all other frames are "non-probing
    //# frames".
    #[inline]
    pub fn is_probing(&self) -> bool {
        matches!(
            self,
            Frame::Padding(_)
                | Frame::PathChallenge(_)
                | Frame::PathResponse(_)
                | Frame::NewConnectionId(_)
        )
    }

    /// Whether the frame counts toward the congestion window
    ///
    /// Everything but pure ACK frames is congestion controlled.
    #[inline]
    pub fn is_congestion_controlled(&self) -> bool {
        !matches!(self, Frame::Ack(_))
    }
}

impl<A: AckRanges, Data: EncoderValue> EncoderValue for Frame<A, Data> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        match self {
            Frame::Padding(frame) => encoder.encode(frame),
            Frame::Ping(frame) => encoder.encode(frame),
            Frame::Ack(frame) => encoder.encode(frame),
            Frame::ResetStream(frame) => encoder.encode(frame),
            Frame::StopSending(frame) => encoder.encode(frame),
            Frame::Crypto(frame) => encoder.encode(frame),
            Frame::NewToken(frame) => encoder.encode(frame),
            Frame::Stream(frame) => encoder.encode(frame),
            Frame::MaxData(frame) => encoder.encode(frame),
            Frame::MaxStreamData(frame) => encoder.encode(frame),
            Frame::MaxStreams(frame) => encoder.encode(frame),
            Frame::DataBlocked(frame) => encoder.encode(frame),
            Frame::StreamDataBlocked(frame) => encoder.encode(frame),
            Frame::StreamsBlocked(frame) => encoder.encode(frame),
            Frame::NewConnectionId(frame) => encoder.encode(frame),
            Frame::RetireConnectionId(frame) => encoder.encode(frame),
            Frame::PathChallenge(frame) => encoder.encode(frame),
            Frame::PathResponse(frame) => encoder.encode(frame),
            Frame::ConnectionClose(frame) => encoder.encode(frame),
            Frame::HandshakeDone(frame) => encoder.encode(frame),
        }
    }
}

impl<'a> DecoderValue<'a> for FrameRef<'a> {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let tag = buffer.peek_byte(0)?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
        //# The Frame Type field uses a variable-length integer encoding...
        //# with one exception.  To ensure simple and efficient
        //# implementations of frame parsing, a frame type MUST use the
        //# shortest possible encoding.
        //
        // All frame types defined by RFC 9000 fit in a single byte; a
        // greater tag is an extension frame this endpoint does not speak.
        if tag >= 0b0100_0000 {
            return Err(DecoderError::InvariantViolation("unknown frame"));
        }

        let buffer = buffer.skip(1)?;

        macro_rules! decode {
            ($variant:ident) => {{
                let (frame, buffer) = buffer.decode_parameterized(tag)?;
                Ok((Frame::$variant(frame), buffer))
            }};
        }

        match tag {
            padding::TAG => decode!(Padding),
            ping::TAG => decode!(Ping),
            ack::TAG..=ack::TAG_ECN => decode!(Ack),
            reset_stream::TAG => decode!(ResetStream),
            stop_sending::TAG => decode!(StopSending),
            crypto::TAG => decode!(Crypto),
            new_token::TAG => decode!(NewToken),
            stream::TAG..=stream::TAG_MAX => decode!(Stream),
            max_data::TAG => decode!(MaxData),
            max_stream_data::TAG => decode!(MaxStreamData),
            max_streams::TAG_BIDI..=max_streams::TAG_UNI => decode!(MaxStreams),
            data_blocked::TAG => decode!(DataBlocked),
            stream_data_blocked::TAG => decode!(StreamDataBlocked),
            streams_blocked::TAG_BIDI..=streams_blocked::TAG_UNI => decode!(StreamsBlocked),
            new_connection_id::TAG => decode!(NewConnectionId),
            retire_connection_id::TAG => decode!(RetireConnectionId),
            path_challenge::TAG => decode!(PathChallenge),
            path_response::TAG => decode!(PathResponse),
            connection_close::TAG..=connection_close::TAG_APPLICATION => decode!(ConnectionClose),
            handshake_done::TAG => decode!(HandshakeDone),
            _ => Err(DecoderError::InvariantViolation("unknown frame")),
        }
    }
}

#[cfg(test)]
mod tests;
