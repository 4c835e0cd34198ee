// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The handshake data stream of one encryption level
//!
//! CRYPTO frames behave like a stream with no id, no flow control and
//! no FIN; each level carries an independent offset space.

use bytes::{Bytes, BytesMut};
use quiver_quic_core::{interval_set::IntervalSet, transport};
use std::collections::{BTreeMap, VecDeque};

//= https://www.rfc-editor.org/rfc/rfc9000#section-7.5
//# Implementations MUST support buffering at least 4096 bytes of data
//# received in out-of-order CRYPTO frames.
const RECV_BUFFER_LIMIT: u64 = 64 * 1024;

/// A CRYPTO frame's worth of data picked by `try_send`
#[derive(Debug, PartialEq, Eq)]
pub struct CryptoTransmission {
    pub offset: u64,
    pub data: Bytes,
}

#[derive(Debug, Default)]
pub struct CryptoStream {
    // send half
    tx_chunks: VecDeque<Bytes>,
    tx_start_offset: u64,
    tx_end_offset: u64,
    next_offset: u64,
    retransmit: IntervalSet<u64>,
    acked: IntervalSet<u64>,

    // receive half
    rx_segments: BTreeMap<u64, Bytes>,
    rx_delivered: u64,
}

impl CryptoStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues handshake bytes produced by the TLS engine
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.tx_end_offset += data.len() as u64;
        self.tx_chunks.push_back(Bytes::copy_from_slice(data));
    }

    /// Whether any handshake data awaits (re)transmission
    pub fn has_transmission_interest(&self) -> bool {
        !self.retransmit.is_empty() || self.next_offset < self.tx_end_offset
    }

    /// Picks the next CRYPTO transmission bounded by `max_len`
    pub fn try_send(&mut self, max_len: usize) -> Option<CryptoTransmission> {
        if max_len == 0 {
            return None;
        }

        while let Some(range) = self.retransmit.pop_min() {
            let start = range.start.max(self.tx_start_offset);
            if start > range.end {
                continue;
            }
            let available = (range.end - start + 1) as usize;
            let len = available.min(max_len);
            if len < available {
                self.retransmit.insert(start + len as u64..=range.end);
            }
            return Some(CryptoTransmission {
                offset: start,
                data: self.range(start, len),
            });
        }

        let available = (self.tx_end_offset - self.next_offset).min(max_len as u64) as usize;
        if available == 0 {
            return None;
        }
        let offset = self.next_offset;
        self.next_offset += available as u64;
        Some(CryptoTransmission {
            offset,
            data: self.range(offset, available),
        })
    }

    pub fn on_data_acked(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        self.acked.insert(offset..=offset + len - 1);

        // release the contiguous acked prefix
        if let Some(range) = self.acked.inclusive_ranges().next() {
            if *range.start() <= self.tx_start_offset {
                let release_to = range.end() + 1;
                while let Some(front) = self.tx_chunks.front_mut() {
                    let front_end = self.tx_start_offset + front.len() as u64;
                    if front_end <= release_to {
                        self.tx_start_offset = front_end;
                        self.tx_chunks.pop_front();
                    } else if release_to > self.tx_start_offset {
                        let cut = (release_to - self.tx_start_offset) as usize;
                        *front = front.slice(cut..);
                        self.tx_start_offset = release_to;
                        break;
                    } else {
                        break;
                    }
                }
            }
        }
    }

    pub fn on_data_lost(&mut self, offset: u64, len: u64) {
        if len > 0 {
            self.retransmit.insert(offset..=offset + len - 1);
        }
    }

    /// Handles an inbound CRYPTO frame; returns the newly contiguous
    /// handshake bytes for the TLS engine, if any
    pub fn on_crypto_frame(
        &mut self,
        offset: u64,
        data: Bytes,
    ) -> Result<Option<Bytes>, transport::Error> {
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            transport::Error::FRAME_ENCODING_ERROR.with_reason("crypto offset overflow")
        })?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.5
        //# If an endpoint's buffer is exceeded, it can close the
        //# connection with a CRYPTO_BUFFER_EXCEEDED error code.
        if end.saturating_sub(self.rx_delivered) > RECV_BUFFER_LIMIT {
            return Err(transport::Error::CRYPTO_BUFFER_EXCEEDED
                .with_reason("out-of-order crypto data limit"));
        }

        let mut offset = offset;
        let mut data = data;
        if offset < self.rx_delivered {
            let skip = (self.rx_delivered - offset).min(data.len() as u64) as usize;
            data = data.slice(skip..);
            offset += skip as u64;
        }
        if !data.is_empty() {
            // identical retransmissions are common during the handshake;
            // keep whichever copy covers more
            match self.rx_segments.get(&offset) {
                Some(existing) if existing.len() >= data.len() => {}
                _ => {
                    self.rx_segments.insert(offset, data);
                }
            }
        }

        let mut run: Option<BytesMut> = None;
        let mut single: Option<Bytes> = None;
        while let Some(entry) = self.rx_segments.first_entry() {
            let start = *entry.key();
            if start > self.rx_delivered {
                break;
            }
            let data = entry.remove();
            let end = start + data.len() as u64;
            if end <= self.rx_delivered {
                continue;
            }
            let fresh = data.slice((self.rx_delivered - start) as usize..);
            self.rx_delivered = end;
            match (&mut run, single.take()) {
                (None, None) => single = Some(fresh),
                (None, Some(first)) => {
                    let mut joined = BytesMut::with_capacity(first.len() + fresh.len());
                    joined.extend_from_slice(&first);
                    joined.extend_from_slice(&fresh);
                    run = Some(joined);
                }
                (Some(joined), _) => joined.extend_from_slice(&fresh),
            }
        }

        Ok(match (run, single) {
            (Some(joined), _) => Some(joined.freeze()),
            (None, Some(single)) => Some(single),
            (None, None) => None,
        })
    }

    fn range(&self, offset: u64, len: usize) -> Bytes {
        debug_assert!(offset >= self.tx_start_offset);
        let mut skip = (offset - self.tx_start_offset) as usize;
        let mut chunks = self.tx_chunks.iter();

        let mut chunk = loop {
            let chunk = chunks.next().expect("offset within buffer");
            if skip < chunk.len() {
                break chunk.slice(skip..);
            }
            skip -= chunk.len();
        };

        if chunk.len() >= len {
            return chunk.slice(..len);
        }

        let mut out = BytesMut::with_capacity(len);
        let mut remaining = len;
        loop {
            let take = chunk.len().min(remaining);
            out.extend_from_slice(&chunk[..take]);
            remaining -= take;
            if remaining == 0 {
                return out.freeze();
            }
            chunk = chunks.next().expect("range within buffer").clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_and_ack_test() {
        let mut stream = CryptoStream::new();
        stream.write(b"client hello");
        assert!(stream.has_transmission_interest());

        let tx = stream.try_send(1000).unwrap();
        assert_eq!(tx.offset, 0);
        assert_eq!(&tx.data[..], b"client hello");
        assert!(!stream.has_transmission_interest());

        stream.on_data_acked(0, 12);
        assert_eq!(stream.tx_start_offset, 12);
    }

    #[test]
    fn lost_data_is_resent_test() {
        let mut stream = CryptoStream::new();
        stream.write(b"abcdef");
        let _ = stream.try_send(1000).unwrap();

        stream.on_data_lost(0, 6);
        let tx = stream.try_send(3).unwrap();
        assert_eq!(tx.offset, 0);
        assert_eq!(&tx.data[..], b"abc");
        let tx = stream.try_send(1000).unwrap();
        assert_eq!(tx.offset, 3);
        assert_eq!(&tx.data[..], b"def");
    }

    #[test]
    fn reordered_receive_test() {
        let mut stream = CryptoStream::new();
        assert_eq!(
            stream
                .on_crypto_frame(6, Bytes::from_static(b"finished"))
                .unwrap(),
            None
        );
        let delivered = stream
            .on_crypto_frame(0, Bytes::from_static(b"server"))
            .unwrap()
            .unwrap();
        assert_eq!(&delivered[..], b"serverfinished");
    }

    #[test]
    fn duplicate_receive_is_ignored_test() {
        let mut stream = CryptoStream::new();
        let first = stream
            .on_crypto_frame(0, Bytes::from_static(b"hello"))
            .unwrap();
        assert!(first.is_some());
        let second = stream
            .on_crypto_frame(0, Bytes::from_static(b"hello"))
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn buffer_limit_test() {
        let mut stream = CryptoStream::new();
        let err = stream
            .on_crypto_frame(RECV_BUFFER_LIMIT, Bytes::from_static(b"x"))
            .unwrap_err();
        assert_eq!(
            err.code,
            quiver_quic_core::transport::error::Code::CRYPTO_BUFFER_EXCEEDED
        );
    }
}
