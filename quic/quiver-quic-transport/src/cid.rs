// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection-ID pools
//!
//! Two independent pools: IDs we issue so the peer can address us
//! (local), and IDs the peer issued so we can address it (remote). The
//! local pool is replenished via NEW_CONNECTION_ID; migration rotates
//! the remote pool.

use crate::{event::ConnectionEventSink, PendingFrame};
use quiver_quic_core::{
    connection::ConnectionId,
    frame::{new_connection_id::STATELESS_RESET_TOKEN_LEN, NewConnectionId, RetireConnectionId},
    random, transport,
    varint::VarInt,
};
use siphasher::sip::SipHasher13;
use std::collections::VecDeque;
use std::hash::Hasher;

/// Keep at least this many spare local IDs available to the peer
const MIN_LOCAL_POOL: usize = 3;
/// Never hold more than this many live local IDs
const MAX_LOCAL_POOL: usize = 8;

const LOCAL_CID_LEN: usize = 8;

#[derive(Clone, Debug)]
struct LocalEntry {
    id: ConnectionId,
    sequence_number: u64,
    stateless_reset_token: [u8; STATELESS_RESET_TOKEN_LEN],
    hash: u64,
}

#[derive(Clone, Debug)]
struct RemoteEntry {
    id: ConnectionId,
    sequence_number: u64,
    stateless_reset_token: Option<[u8; STATELESS_RESET_TOKEN_LEN]>,
}

pub struct CidCoordinator {
    local: Vec<LocalEntry>,
    next_local_sequence: u64,
    /// The peer's active_connection_id_limit bounds how many live local
    /// IDs we may have issued
    peer_cid_limit: usize,

    remote: Vec<RemoteEntry>,
    current_remote_sequence: u64,
    /// RETIRE_CONNECTION_ID frames waiting to be sent
    retire_queue: VecDeque<u64>,

    /// NEW_CONNECTION_ID frames waiting to be sent
    issue_queue: VecDeque<NewConnectionId>,

    hash_key: (u64, u64),
}

impl CidCoordinator {
    /// Seeds both pools from the handshake-established IDs
    pub fn new(
        initial_local: ConnectionId,
        initial_remote: ConnectionId,
        hash_key: (u64, u64),
    ) -> Self {
        let hash = hash_cid(hash_key, &initial_local);
        Self {
            local: vec![LocalEntry {
                id: initial_local,
                sequence_number: 0,
                stateless_reset_token: [0; STATELESS_RESET_TOKEN_LEN],
                hash,
            }],
            next_local_sequence: 1,
            peer_cid_limit: 2,
            remote: vec![RemoteEntry {
                id: initial_remote,
                sequence_number: 0,
                stateless_reset_token: None,
            }],
            current_remote_sequence: 0,
            retire_queue: VecDeque::new(),
            issue_queue: VecDeque::new(),
            hash_key,
        }
    }

    /// The ID to put in outbound short/long headers as DCID
    pub fn current_remote(&self) -> ConnectionId {
        self.remote
            .iter()
            .find(|entry| entry.sequence_number == self.current_remote_sequence)
            .map(|entry| entry.id)
            .expect("current remote id present in pool")
    }

    /// The length of IDs we issue, needed to frame short headers
    pub fn local_cid_len(&self) -> usize {
        self.local.first().map_or(LOCAL_CID_LEN, |e| e.id.len())
    }

    /// Whether `dcid` matches any live local ID
    pub fn is_local(&self, dcid: &[u8]) -> bool {
        self.local.iter().any(|entry| entry.id.as_bytes() == dcid)
    }

    /// Routing hashes for every live local ID
    pub fn local_hashes(&self) -> impl Iterator<Item = u64> + '_ {
        self.local.iter().map(|entry| entry.hash)
    }

    pub fn on_peer_cid_limit(&mut self, limit: VarInt) {
        self.peer_cid_limit = limit.as_u64().min(MAX_LOCAL_POOL as u64) as usize;
    }

    /// Tops the local pool up to the target and queues the
    /// NEW_CONNECTION_ID announcements
    ///
    /// The number of live IDs never exceeds the peer's limit.
    pub fn replenish_local(
        &mut self,
        random: &mut dyn random::Generator,
        events: &mut dyn ConnectionEventSink,
    ) {
        let spare = self.local.len().saturating_sub(1);
        if spare >= MIN_LOCAL_POOL {
            return;
        }
        let target = MAX_LOCAL_POOL.min(self.peer_cid_limit).max(1);
        while self.local.len() < target {
            let mut bytes = [0u8; LOCAL_CID_LEN];
            random.fill(&mut bytes);
            let id = ConnectionId::try_from_bytes(&bytes).expect("within length bound");

            let mut stateless_reset_token = [0u8; STATELESS_RESET_TOKEN_LEN];
            random.fill(&mut stateless_reset_token);

            let sequence_number = self.next_local_sequence;
            self.next_local_sequence += 1;
            let hash = hash_cid(self.hash_key, &id);

            self.local.push(LocalEntry {
                id,
                sequence_number,
                stateless_reset_token,
                hash,
            });
            events.on_connection_id_issued(hash);

            self.issue_queue.push_back(NewConnectionId {
                sequence_number: VarInt::new(sequence_number).unwrap_or(VarInt::MAX),
                retire_prior_to: VarInt::ZERO,
                connection_id: id,
                stateless_reset_token,
            });
        }
    }

    /// The peer retired one of our IDs
    pub fn on_retire_connection_id(
        &mut self,
        frame: &RetireConnectionId,
        current_dcid: &[u8],
        random: &mut dyn random::Generator,
        events: &mut dyn ConnectionEventSink,
    ) -> Result<(), transport::Error> {
        let sequence = frame.sequence_number.as_u64();

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
        //# Receipt of a RETIRE_CONNECTION_ID frame containing a sequence
        //# number greater than any previously sent to the peer MUST be
        //# treated as a connection error of type PROTOCOL_VIOLATION.
        if sequence >= self.next_local_sequence {
            return Err(transport::Error::PROTOCOL_VIOLATION
                .with_reason("retired unissued connection id"));
        }

        if let Some(index) = self
            .local
            .iter()
            .position(|entry| entry.sequence_number == sequence)
        {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
            //# The sequence number specified in a RETIRE_CONNECTION_ID frame
            //# MUST NOT refer to the Destination Connection ID field of the
            //# packet in which the frame is contained.
            if self.local[index].id.as_bytes() == current_dcid {
                return Err(transport::Error::PROTOCOL_VIOLATION
                    .with_reason("retired the connection id carrying the frame"));
            }
            let entry = self.local.swap_remove(index);
            events.on_connection_id_retired(entry.hash);
        }

        self.replenish_local(random, events);
        Ok(())
    }

    /// The peer issued a new ID for us to use
    pub fn on_new_connection_id(
        &mut self,
        frame: &NewConnectionId,
    ) -> Result<(), transport::Error> {
        let sequence = frame.sequence_number.as_u64();

        if let Some(existing) = self
            .remote
            .iter()
            .find(|entry| entry.sequence_number == sequence)
        {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# If an endpoint receives a NEW_CONNECTION_ID frame that repeats
            //# a previously issued connection ID with a different Stateless
            //# Reset Token field value or a different Sequence Number field
            //# value, or if a sequence number is used for different
            //# connection IDs, the endpoint MAY treat that receipt as a
            //# connection error of type PROTOCOL_VIOLATION.
            if existing.id != frame.connection_id {
                return Err(transport::Error::PROTOCOL_VIOLATION
                    .with_reason("sequence number reused for a different id"));
            }
            return Ok(());
        }

        self.remote.push(RemoteEntry {
            id: frame.connection_id,
            sequence_number: sequence,
            stateless_reset_token: Some(frame.stateless_reset_token),
        });

        // honor retire_prior_to
        let retire_prior_to = frame.retire_prior_to.as_u64();
        let mut retired = Vec::new();
        self.remote.retain(|entry| {
            if entry.sequence_number < retire_prior_to {
                retired.push(entry.sequence_number);
                false
            } else {
                true
            }
        });
        let mut must_rotate = false;
        for sequence in retired {
            if sequence == self.current_remote_sequence {
                must_rotate = true;
            }
            self.retire_queue.push_back(sequence);
        }
        if must_rotate {
            self.current_remote_sequence = self
                .remote
                .iter()
                .map(|entry| entry.sequence_number)
                .min()
                .expect("frame inserted an eligible id");
        }

        Ok(())
    }

    /// Replaces the provisional sequence-0 remote ID
    ///
    /// Used by a client when the server's first response (or a Retry)
    /// establishes the real ID to address it by.
    pub fn update_initial_remote(&mut self, id: ConnectionId) {
        if let Some(entry) = self
            .remote
            .iter_mut()
            .find(|entry| entry.sequence_number == 0)
        {
            entry.id = id;
        } else {
            self.remote.push(RemoteEntry {
                id,
                sequence_number: 0,
                stateless_reset_token: None,
            });
            self.current_remote_sequence = 0;
        }
    }

    /// Switches to the next unused remote ID, retiring the current one;
    /// used when promoting a migrated path
    pub fn rotate_remote(&mut self) -> bool {
        let Some(next) = self
            .remote
            .iter()
            .filter(|entry| entry.sequence_number > self.current_remote_sequence)
            .map(|entry| entry.sequence_number)
            .min()
        else {
            return false;
        };

        let old = self.current_remote_sequence;
        self.current_remote_sequence = next;
        self.remote.retain(|entry| entry.sequence_number != old);
        self.retire_queue.push_back(old);
        true
    }

    /// Drains queued NEW/RETIRE_CONNECTION_ID frames
    pub fn collect_control_frames(&mut self, pending: &mut VecDeque<PendingFrame>) {
        while let Some(frame) = self.issue_queue.pop_front() {
            pending.push_back(frame.into());
        }
        while let Some(sequence) = self.retire_queue.pop_front() {
            pending.push_back(
                RetireConnectionId {
                    sequence_number: VarInt::new(sequence).unwrap_or(VarInt::MAX),
                }
                .into(),
            );
        }
    }
}

fn hash_cid(key: (u64, u64), id: &ConnectionId) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(key.0, key.1);
    hasher.write(id.as_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use quiver_quic_core::random::testing::Generator;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::try_from_bytes(bytes).unwrap()
    }

    fn coordinator() -> CidCoordinator {
        CidCoordinator::new(cid(&[1; 8]), cid(&[2; 8]), (7, 13))
    }

    #[test]
    fn replenish_respects_peer_limit_test() {
        let mut coordinator = coordinator();
        let mut random = Generator::default();
        let mut sink = RecordingSink::default();

        // default limit of 2: one spare at most
        coordinator.replenish_local(&mut random, &mut sink);
        assert_eq!(coordinator.local.len(), 2);

        coordinator.on_peer_cid_limit(VarInt::from_u8(8));
        coordinator.replenish_local(&mut random, &mut sink);
        assert_eq!(coordinator.local.len(), 8);
        assert_eq!(sink.issued_cids.len(), 7);

        let mut pending = VecDeque::new();
        coordinator.collect_control_frames(&mut pending);
        assert_eq!(pending.len(), 7);
    }

    #[test]
    fn retire_unissued_id_is_rejected_test() {
        let mut coordinator = coordinator();
        let mut random = Generator::default();
        let mut sink = RecordingSink::default();

        let err = coordinator
            .on_retire_connection_id(
                &RetireConnectionId {
                    sequence_number: VarInt::from_u8(9),
                },
                &[9; 8],
                &mut random,
                &mut sink,
            )
            .unwrap_err();
        assert_eq!(
            err.code,
            quiver_quic_core::transport::error::Code::PROTOCOL_VIOLATION
        );
    }

    #[test]
    fn retire_current_dcid_is_rejected_test() {
        let mut coordinator = coordinator();
        let mut random = Generator::default();
        let mut sink = RecordingSink::default();

        let err = coordinator
            .on_retire_connection_id(
                &RetireConnectionId {
                    sequence_number: VarInt::ZERO,
                },
                &[1; 8],
                &mut random,
                &mut sink,
            )
            .unwrap_err();
        assert_eq!(
            err.code,
            quiver_quic_core::transport::error::Code::PROTOCOL_VIOLATION
        );
    }

    #[test]
    fn rotation_after_migration_test() {
        let mut coordinator = coordinator();
        assert!(!coordinator.rotate_remote(), "no spare id yet");

        coordinator
            .on_new_connection_id(&NewConnectionId {
                sequence_number: VarInt::from_u8(1),
                retire_prior_to: VarInt::ZERO,
                connection_id: cid(&[3; 8]),
                stateless_reset_token: [0xee; 16],
            })
            .unwrap();

        assert!(coordinator.rotate_remote());
        assert_eq!(coordinator.current_remote(), cid(&[3; 8]));

        let mut pending = VecDeque::new();
        coordinator.collect_control_frames(&mut pending);
        assert!(pending.iter().any(|frame| matches!(
            frame,
            crate::PendingFrame::RetireConnectionId(retire)
                if retire.sequence_number == VarInt::ZERO
        )));
    }

    #[test]
    fn sequence_reuse_is_rejected_test() {
        let mut coordinator = coordinator();
        let frame = NewConnectionId {
            sequence_number: VarInt::from_u8(1),
            retire_prior_to: VarInt::ZERO,
            connection_id: cid(&[3; 8]),
            stateless_reset_token: [0; 16],
        };
        coordinator.on_new_connection_id(&frame).unwrap();
        // exact duplicate is fine
        coordinator.on_new_connection_id(&frame).unwrap();

        let conflicting = NewConnectionId {
            connection_id: cid(&[4; 8]),
            ..frame
        };
        assert!(coordinator.on_new_connection_id(&conflicting).is_err());
    }
}
