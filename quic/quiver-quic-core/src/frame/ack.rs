// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use core::{fmt, ops::RangeInclusive, time::Duration};
use quiver_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderError, DecoderParameterizedValue, Encoder,
    EncoderValue,
};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3
//# Receivers send ACK frames (types 0x02 and 0x03) to inform senders of
//# packets they have received and processed.  The ACK frame contains one
//# or more ACK Ranges.  ACK Ranges identify acknowledged packets.  If
//# the frame type is 0x03, ACK frames also contain the cumulative count
//# of QUIC packets with associated ECN marks received on the connection
//# up until this point.

pub const TAG: Tag = 0x02;
pub const TAG_ECN: Tag = 0x03;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3
//# ACK Frame {
//#   Type (i) = 0x02..0x03,
//#   Largest Acknowledged (i),
//#   ACK Delay (i),
//#   ACK Range Count (i),
//#   First ACK Range (i),
//#   ACK Range (..) ...,
//#   [ECN Counts (..)],
//# }

/// A source of acknowledged packet-number ranges
///
/// Ranges iterate in descending order, starting with the range that
/// contains the largest acknowledged packet number.
pub trait AckRanges {
    fn ack_ranges(&self) -> impl Iterator<Item = RangeInclusive<VarInt>> + '_;

    fn largest_acknowledged(&self) -> VarInt;

    fn smallest_acknowledged(&self) -> VarInt;

    /// The number of Gap/ACK Range pairs following the first range
    fn excess_range_count(&self) -> usize;
}

#[derive(Clone, PartialEq, Eq)]
pub struct Ack<A> {
    /// Acknowledgment delay in microseconds, already scaled by the
    /// sender's ack_delay_exponent
    pub ack_delay: VarInt,

    pub ranges: A,

    pub ecn_counts: Option<EcnCounts>,
}

impl<A> Ack<A> {
    #[inline]
    pub fn tag(&self) -> Tag {
        if self.ecn_counts.is_some() {
            TAG_ECN
        } else {
            TAG
        }
    }

    #[inline]
    pub fn ack_delay(&self) -> Duration {
        Duration::from_micros(self.ack_delay.as_u64())
    }
}

impl<A: AckRanges> Ack<A> {
    #[inline]
    pub fn largest_acknowledged(&self) -> VarInt {
        self.ranges.largest_acknowledged()
    }
}

impl<A> fmt::Debug for Ack<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ack")
            .field("ack_delay", &self.ack_delay)
            .field("ecn_counts", &self.ecn_counts)
            .finish_non_exhaustive()
    }
}

impl<A: AckRanges> EncoderValue for Ack<A> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());

        let mut ranges = self.ranges.ack_ranges();
        let first = ranges.next().expect("ack frame requires at least one range");
        let largest = *first.end();
        let first_range = *first.end() - *first.start();

        encoder.encode(&largest);
        encoder.encode(&self.ack_delay);
        encoder.encode(
            &VarInt::try_from(self.ranges.excess_range_count()).expect("range count overflow"),
        );
        encoder.encode(&first_range);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.1
        //# Each ACK Range consists of alternating Gap and ACK Range Length
        //# values in descending packet number order.
        let mut previous_smallest = *first.start();
        for range in ranges {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.1
            //# Gap:  A variable-length integer indicating the number of
            //#    contiguous unacknowledged packets preceding the packet number
            //#    one lower than the smallest in the preceding ACK Range.
            let gap = previous_smallest - *range.end() - VarInt::from_u8(2);
            let length = *range.end() - *range.start();
            encoder.encode(&gap);
            encoder.encode(&length);
            previous_smallest = *range.start();
        }

        encoder.encode(&self.ecn_counts);
    }
}

/// Lazily-decoded ACK ranges borrowing the frame payload
///
/// The whole range list is validated once during frame decode; iteration
/// afterwards cannot fail.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AckRangesDecoder<'a> {
    largest_acknowledged: VarInt,
    smallest_acknowledged: VarInt,
    excess_range_count: usize,
    buffer: DecoderBuffer<'a>,
}

impl<'a> fmt::Debug for AckRangesDecoder<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.ack_ranges()).finish()
    }
}

impl<'a> AckRanges for AckRangesDecoder<'a> {
    #[inline]
    fn ack_ranges(&self) -> impl Iterator<Item = RangeInclusive<VarInt>> + '_ {
        AckRangesIter {
            remaining: self.excess_range_count + 1,
            largest: self.largest_acknowledged,
            buffer: self.buffer,
        }
    }

    #[inline]
    fn largest_acknowledged(&self) -> VarInt {
        self.largest_acknowledged
    }

    #[inline]
    fn smallest_acknowledged(&self) -> VarInt {
        self.smallest_acknowledged
    }

    #[inline]
    fn excess_range_count(&self) -> usize {
        self.excess_range_count
    }
}

struct AckRangesIter<'a> {
    remaining: usize,
    largest: VarInt,
    buffer: DecoderBuffer<'a>,
}

impl<'a> Iterator for AckRangesIter<'a> {
    type Item = RangeInclusive<VarInt>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.remaining = self.remaining.checked_sub(1)?;

        // validated during frame decode, so failures are unreachable
        let (length, buffer) = self.buffer.decode::<VarInt>().ok()?;
        let smallest = self.largest.checked_sub(length)?;
        let range = smallest..=self.largest;

        if self.remaining > 0 {
            let (gap, buffer) = buffer.decode::<VarInt>().ok()?;
            self.largest = smallest
                .checked_sub(gap)?
                .checked_sub(VarInt::from_u8(2))?;
            self.buffer = buffer;
        } else {
            self.buffer = buffer;
        }

        Some(range)
    }
}

fn decode_ack_ranges<'a>(
    largest_acknowledged: VarInt,
    buffer: DecoderBuffer<'a>,
) -> DecoderBufferResult<'a, AckRangesDecoder<'a>> {
    let (range_count, buffer) = buffer.decode::<VarInt>()?;
    let excess_range_count: usize = range_count
        .try_into()
        .map_err(|_| DecoderError::LengthCapacityExceeded)?;

    // walk the whole list once so later iteration is infallible
    let ranges_buffer = buffer;
    let mut largest = largest_acknowledged;
    let mut smallest = largest;
    let mut remaining = buffer;
    for index in 0..=excess_range_count {
        let (length, buffer) = remaining.decode::<VarInt>()?;
        smallest = largest
            .checked_sub(length)
            .ok_or(DecoderError::InvariantViolation("ack range underflow"))?;

        if index < excess_range_count {
            let (gap, buffer) = buffer.decode::<VarInt>()?;
            largest = smallest
                .checked_sub(gap)
                .and_then(|value| value.checked_sub(VarInt::from_u8(2)))
                .ok_or(DecoderError::InvariantViolation("ack gap underflow"))?;
            remaining = buffer;
        } else {
            remaining = buffer;
        }
    }

    let consumed = ranges_buffer.len() - remaining.len();
    let (ranges, remaining) = ranges_buffer.decode_slice(consumed)?;

    Ok((
        AckRangesDecoder {
            largest_acknowledged,
            smallest_acknowledged: smallest,
            excess_range_count,
            buffer: ranges,
        },
        remaining,
    ))
}

impl<'a> DecoderParameterizedValue<'a> for Ack<AckRangesDecoder<'a>> {
    type Parameter = Tag;

    #[inline]
    fn decode_parameterized(
        tag: Tag,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        let (largest_acknowledged, buffer) = buffer.decode()?;
        let (ack_delay, buffer) = buffer.decode()?;
        let (ranges, buffer) = decode_ack_ranges(largest_acknowledged, buffer)?;

        let (ecn_counts, buffer) = if tag == TAG_ECN {
            let (counts, buffer) = buffer.decode::<EcnCounts>()?;
            (Some(counts), buffer)
        } else {
            (None, buffer)
        };

        Ok((
            Ack {
                ack_delay,
                ranges,
                ecn_counts,
            },
            buffer,
        ))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EcnCounts {
    /// Packets received with the ECT(0) codepoint
    pub ect_0_count: VarInt,
    /// Packets received with the ECT(1) codepoint
    pub ect_1_count: VarInt,
    /// Packets received with the ECN-CE codepoint
    pub ce_count: VarInt,
}

impl EncoderValue for EcnCounts {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.ect_0_count);
        encoder.encode(&self.ect_1_count);
        encoder.encode(&self.ce_count);
    }
}

quiver_codec::decoder_value!(
    impl<'a> EcnCounts {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (ect_0_count, buffer) = buffer.decode()?;
            let (ect_1_count, buffer) = buffer.decode()?;
            let (ce_count, buffer) = buffer.decode()?;
            Ok((
                EcnCounts {
                    ect_0_count,
                    ect_1_count,
                    ce_count,
                },
                buffer,
            ))
        }
    }
);
