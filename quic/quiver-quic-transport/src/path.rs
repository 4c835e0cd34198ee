// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Peer address tracking, path validation and MTU discovery

use quiver_quic_core::{
    frame::{path_challenge, PathChallenge, PathResponse},
    random,
    time::{Timer, Timestamp},
};
use core::time::Duration;
use std::collections::VecDeque;
use std::net::SocketAddr;

//= https://www.rfc-editor.org/rfc/rfc9000#section-8.1
//# an endpoint MUST limit the amount of data it sends to the unvalidated
//# address to three times the amount of data received from that address.
const AMPLIFICATION_FACTOR: u64 = 3;

//= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
//# QUIC MUST NOT be used if the network path cannot support a maximum
//# datagram size of at least 1200 bytes.
pub const MINIMUM_MTU: u16 = 1200;

/// Ceiling for MTU probing; jumbo frames are out of scope
const MAX_MTU: u16 = 9000;

const MAX_PROBE_RETRIES: u32 = 5;
const INITIAL_PROBE_DELAY: Duration = Duration::from_millis(100);
const MAX_PROBE_DELAY: Duration = Duration::from_millis(2000);

/// An in-flight PATH_CHALLENGE toward a candidate address
#[derive(Debug)]
struct Challenge {
    data: [u8; path_challenge::DATA_LEN],
    target: SocketAddr,
    retries: u32,
    delay: Duration,
    retry_timer: Timer,
    needs_transmit: bool,
}

/// Datagram-size probing state (DPLPMTUD-style: probe with a padded
/// PING, raise the floor when it is acknowledged)
#[derive(Debug)]
pub struct Mtu {
    current: u16,
    ceiling: u16,
    /// A probe of this size is in flight
    probe_size: Option<u16>,
    probe_requested: bool,
}

impl Mtu {
    fn new(max_udp_payload: u16) -> Self {
        Self {
            current: MINIMUM_MTU,
            ceiling: max_udp_payload.clamp(MINIMUM_MTU, MAX_MTU),
            probe_size: None,
            probe_requested: false,
        }
    }

    #[inline]
    pub fn current(&self) -> u16 {
        self.current
    }

    /// The next size to probe: halfway between current and ceiling
    fn next_probe_size(&self) -> Option<u16> {
        let next = self.current as u32 + (self.ceiling as u32 - self.current as u32 + 1) / 2;
        let next = next as u16;
        (next > self.current).then_some(next)
    }

    /// Requests a probe transmission if there is ground to gain
    pub fn request_probe(&mut self) {
        if self.probe_size.is_none() && self.next_probe_size().is_some() {
            self.probe_requested = true;
        }
    }

    /// The probe size to transmit now, if one is requested
    pub fn take_probe(&mut self) -> Option<u16> {
        if !self.probe_requested {
            return None;
        }
        self.probe_requested = false;
        let size = self.next_probe_size()?;
        self.probe_size = Some(size);
        Some(size)
    }

    /// An MTU probe of `size` was acknowledged
    pub fn on_probe_acked(&mut self, size: u16) {
        if self.probe_size == Some(size) {
            self.probe_size = None;
            self.current = self.current.max(size);
            // keep climbing until the window closes
            self.request_probe();
        }
    }

    /// An MTU probe of `size` was lost; the path cannot carry it
    pub fn on_probe_lost(&mut self, size: u16) {
        if self.probe_size == Some(size) {
            self.probe_size = None;
            self.ceiling = self.ceiling.min(size.saturating_sub(1)).max(self.current);
        }
    }

    fn reset(&mut self, max_udp_payload: u16) {
        *self = Self::new(max_udp_payload);
    }
}

/// What `PathManager::on_datagram_received` observed about the source
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressObservation {
    /// The datagram came from the active peer address
    Active,
    /// The datagram came from a candidate under (or now entering)
    /// validation
    Candidate,
}

#[derive(Debug)]
pub struct PathManager {
    peer_address: SocketAddr,
    /// Cleared while the peer's ownership of `peer_address` is unproven
    validated: bool,
    /// Anti-amplification accounting for the unvalidated path
    bytes_received: u64,
    bytes_sent: u64,

    candidate_queue: VecDeque<SocketAddr>,
    /// With migration disabled, an address change must repeat before it
    /// is treated as a NAT rebinding worth validating
    suspected_rebind: Option<SocketAddr>,
    challenge: Option<Challenge>,
    /// A PATH_RESPONSE owed to the peer
    pending_response: Option<PathResponse>,

    mtu: Mtu,
    migration_disabled: bool,
    max_udp_payload: u16,
}

impl PathManager {
    pub fn new(peer_address: SocketAddr, validated: bool, max_udp_payload: u16) -> Self {
        Self {
            peer_address,
            validated,
            bytes_received: 0,
            bytes_sent: 0,
            candidate_queue: VecDeque::new(),
            suspected_rebind: None,
            challenge: None,
            pending_response: None,
            mtu: Mtu::new(max_udp_payload),
            migration_disabled: false,
            max_udp_payload,
        }
    }

    #[inline]
    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    #[inline]
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    #[inline]
    pub fn mtu(&self) -> &Mtu {
        &self.mtu
    }

    #[inline]
    pub fn mtu_mut(&mut self) -> &mut Mtu {
        &mut self.mtu
    }

    pub fn set_migration_disabled(&mut self, disabled: bool) {
        self.migration_disabled = disabled;
    }

    /// Marks the active path validated (e.g. handshake completion)
    pub fn on_validated(&mut self) {
        self.validated = true;
    }

    #[inline]
    pub fn is_probing(&self) -> bool {
        self.challenge.is_some()
    }

    /// The address outbound datagrams should go to: the candidate while
    /// probing, the active peer address otherwise
    pub fn transmission_address(&self) -> SocketAddr {
        match &self.challenge {
            Some(challenge) => challenge.target,
            None => self.peer_address,
        }
    }

    /// Bytes we may still send under the amplification limit;
    /// `u64::MAX` once the path is validated
    pub fn amplification_budget(&self) -> u64 {
        if self.validated && self.challenge.is_none() {
            return u64::MAX;
        }
        (self.bytes_received * AMPLIFICATION_FACTOR).saturating_sub(self.bytes_sent)
    }

    pub fn on_bytes_sent(&mut self, len: usize) {
        if !self.validated || self.challenge.is_some() {
            self.bytes_sent += len as u64;
        }
    }

    /// Records an inbound datagram and classifies its source address
    pub fn on_datagram_received(
        &mut self,
        source: SocketAddr,
        len: usize,
        random: &mut dyn random::Generator,
        now: Timestamp,
    ) -> AddressObservation {
        if source == self.peer_address {
            self.bytes_received += len as u64;
            return AddressObservation::Active;
        }

        self.bytes_received += len as u64;

        if let Some(challenge) = &self.challenge {
            if challenge.target == source {
                return AddressObservation::Candidate;
            }
        }

        // with migration disabled only a NAT rebinding is plausible, and
        // a single stray datagram is not enough evidence of one
        if self.migration_disabled && self.suspected_rebind != Some(source) {
            self.suspected_rebind = Some(source);
            return AddressObservation::Candidate;
        }
        self.suspected_rebind = None;

        if !self.candidate_queue.contains(&source) {
            self.candidate_queue.push_back(source);
        }
        if self.challenge.is_none() {
            self.start_next_probe(random, now);
        }

        AddressObservation::Candidate
    }

    /// Pops the next candidate and opens a challenge on it
    fn start_next_probe(&mut self, random: &mut dyn random::Generator, now: Timestamp) {
        let Some(target) = self.candidate_queue.pop_front() else {
            return;
        };

        let mut data = [0u8; path_challenge::DATA_LEN];
        random.fill(&mut data);

        let mut retry_timer = Timer::default();
        retry_timer.set(now + INITIAL_PROBE_DELAY);

        self.challenge = Some(Challenge {
            data,
            target,
            retries: 0,
            delay: INITIAL_PROBE_DELAY,
            retry_timer,
            needs_transmit: true,
        });
    }

    /// The PATH_CHALLENGE to transmit, if one is due
    pub fn take_challenge_transmission(&mut self) -> Option<PathChallenge> {
        let challenge = self.challenge.as_mut()?;
        if !challenge.needs_transmit {
            return None;
        }
        challenge.needs_transmit = false;
        Some(PathChallenge {
            data: challenge.data,
        })
    }

    /// A PATH_CHALLENGE from the peer; the response echoes its data
    pub fn on_path_challenge(&mut self, frame: &PathChallenge) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-8.2.2
        //# On receiving a PATH_CHALLENGE frame, an endpoint MUST respond by
        //# echoing the data contained in the PATH_CHALLENGE frame in a
        //# PATH_RESPONSE frame.
        self.pending_response = Some(PathResponse { data: frame.data });
    }

    pub fn take_response_transmission(&mut self) -> Option<PathResponse> {
        self.pending_response.take()
    }

    #[inline]
    pub fn has_pending_response(&self) -> bool {
        self.pending_response.is_some()
    }

    /// A PATH_RESPONSE arrived; on a match the candidate becomes the
    /// active path
    ///
    /// Returns `true` when the path switched, in which case the caller
    /// rotates the remote CID and resets congestion state.
    pub fn on_path_response(&mut self, frame: &PathResponse) -> bool {
        let matches = self
            .challenge
            .as_ref()
            .map_or(false, |challenge| challenge.data == frame.data);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-8.2.3
        //# A PATH_RESPONSE frame received on any network path validates the
        //# path on which the PATH_CHALLENGE was sent.
        if !matches {
            return false;
        }

        let challenge = self.challenge.take().expect("challenge matched");
        self.peer_address = challenge.target;
        self.validated = true;
        self.bytes_received = 0;
        self.bytes_sent = 0;
        self.mtu.reset(self.max_udp_payload);
        true
    }

    /// Drives the probe retry schedule
    ///
    /// Returns `true` when the candidate path was abandoned.
    pub fn on_timer(&mut self, now: Timestamp, random: &mut dyn random::Generator) -> bool {
        let Some(challenge) = self.challenge.as_mut() else {
            return false;
        };
        if !challenge.retry_timer.poll_expiration(now) {
            return false;
        }

        challenge.retries += 1;
        if challenge.retries >= MAX_PROBE_RETRIES {
            // abandon this candidate; try the next one if any
            self.challenge = None;
            self.start_next_probe(random, now);
            return true;
        }

        // exponential backoff: 100ms, 200, 400, 800, 1600
        challenge.delay = (challenge.delay * 2).min(MAX_PROBE_DELAY);
        challenge.retry_timer.set(now + challenge.delay);
        challenge.needs_transmit = true;
        false
    }

    pub fn timer_expiration(&self) -> Option<Timestamp> {
        self.challenge
            .as_ref()
            .and_then(|challenge| challenge.retry_timer.expiration())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_quic_core::random::testing::Generator;

    fn addr(port: u16) -> SocketAddr {
        format!("192.0.2.1:{port}").parse().unwrap()
    }

    fn now(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    #[test]
    fn amplification_budget_test() {
        let mut path = PathManager::new(addr(1111), false, 1500);
        assert_eq!(path.amplification_budget(), 0);

        let mut random = Generator::default();
        path.on_datagram_received(addr(1111), 1200, &mut random, now(1));
        assert_eq!(path.amplification_budget(), 3600);

        path.on_bytes_sent(1200);
        assert_eq!(path.amplification_budget(), 2400);

        path.on_validated();
        assert_eq!(path.amplification_budget(), u64::MAX);
    }

    #[test]
    fn migration_probe_lifecycle_test() {
        let mut path = PathManager::new(addr(1111), true, 1500);
        let mut random = Generator::default();

        // a datagram from a new address starts validation
        let observation = path.on_datagram_received(addr(2222), 1200, &mut random, now(0));
        assert_eq!(observation, AddressObservation::Candidate);
        assert!(path.is_probing());
        assert_eq!(path.transmission_address(), addr(2222));

        let challenge = path.take_challenge_transmission().unwrap();
        assert!(path.take_challenge_transmission().is_none());

        // a mismatched response changes nothing
        assert!(!path.on_path_response(&PathResponse { data: [0xff; 8] }));
        assert_eq!(path.peer_address(), addr(1111));

        // the matching response promotes the candidate
        assert!(path.on_path_response(&PathResponse {
            data: challenge.data
        }));
        assert_eq!(path.peer_address(), addr(2222));
        assert!(!path.is_probing());
        assert!(path.is_validated());
        assert_eq!(path.mtu().current(), MINIMUM_MTU);
    }

    #[test]
    fn probe_retry_backoff_test() {
        let mut path = PathManager::new(addr(1111), true, 1500);
        let mut random = Generator::default();
        path.on_datagram_received(addr(2222), 100, &mut random, now(0));
        let _ = path.take_challenge_transmission().unwrap();

        // retries at 100, 200, 400, 800ms, abandoned on the fifth expiry
        let mut clock = 0;
        for expected_delay in [100u64, 200, 400, 800] {
            clock += expected_delay;
            assert!(!path.on_timer(now(clock), &mut random));
            assert!(path.take_challenge_transmission().is_some());
        }
        clock += 1600;
        assert!(path.on_timer(now(clock), &mut random));
        assert!(!path.is_probing());
    }

    #[test]
    fn challenge_response_echo_test() {
        let mut path = PathManager::new(addr(1111), true, 1500);
        path.on_path_challenge(&PathChallenge { data: [7; 8] });
        assert_eq!(
            path.take_response_transmission(),
            Some(PathResponse { data: [7; 8] })
        );
        assert!(path.take_response_transmission().is_none());
    }

    #[test]
    fn mtu_probe_search_test() {
        let mut mtu = Mtu::new(1500);
        assert_eq!(mtu.current(), 1200);

        mtu.request_probe();
        let probe = mtu.take_probe().unwrap();
        assert_eq!(probe, 1350);

        mtu.on_probe_acked(1350);
        assert_eq!(mtu.current(), 1350);

        // climbing continues automatically
        let probe = mtu.take_probe().unwrap();
        assert!(probe > 1350);

        // a lost probe lowers the ceiling
        mtu.on_probe_lost(probe);
        assert!(mtu.current() >= 1350);
    }
}
