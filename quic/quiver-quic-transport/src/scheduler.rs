// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Picks the encryption level of the next outbound packet

use quiver_quic_core::crypto::EncryptionLevel;

/// The decision for one outbound packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendContext {
    pub level: EncryptionLevel,
    /// The chosen level's space owes the peer an ACK
    pub has_pending_ack: bool,
    /// The packet is a path-validation probe
    pub is_path_probe: bool,
}

/// Everything the decision depends on, snapshotted by the connection
#[derive(Clone, Copy, Debug)]
pub struct Inputs {
    pub current_level: EncryptionLevel,
    pub initial_keys_available: bool,
    pub handshake_keys_available: bool,
    pub early_data_keys_available: bool,
    pub application_keys_available: bool,
    pub initial_ack_pending: bool,
    pub handshake_ack_pending: bool,
    pub application_ack_pending: bool,
    pub path_probe_pending: bool,
    pub early_data_queued: bool,
    pub initial_packet_sent: bool,
}

/// Resolves the next send context, highest priority first:
///
/// 1. a cross-level pending ACK, while that level's keys still exist
/// 2. a path probe, once 1-RTT keys are ready
/// 3. queued 0-RTT data after the first Initial went out
/// 4. the current encryption level
pub fn next_send_context(inputs: Inputs) -> SendContext {
    // lower-level ACKs release the peer's loss-detection state and
    // outrank everything else
    if inputs.current_level > EncryptionLevel::Initial
        && inputs.initial_ack_pending
        && inputs.initial_keys_available
    {
        return SendContext {
            level: EncryptionLevel::Initial,
            has_pending_ack: true,
            is_path_probe: false,
        };
    }

    if inputs.current_level > EncryptionLevel::Handshake
        && inputs.handshake_ack_pending
        && inputs.handshake_keys_available
    {
        return SendContext {
            level: EncryptionLevel::Handshake,
            has_pending_ack: true,
            is_path_probe: false,
        };
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-9.1
    //# An endpoint MUST NOT delay transmission of a packet containing a
    //# PATH_RESPONSE frame unless constrained by congestion control.
    if inputs.path_probe_pending && inputs.application_keys_available {
        return SendContext {
            level: EncryptionLevel::Application,
            has_pending_ack: inputs.application_ack_pending,
            is_path_probe: true,
        };
    }

    //= https://www.rfc-editor.org/rfc/rfc9001#section-4.1.1
    //# 0-RTT keys... are available to a client when Early Data is accepted.
    //
    // 0-RTT may only follow the Initial carrying the ClientHello.
    if inputs.early_data_queued
        && inputs.current_level == EncryptionLevel::Initial
        && inputs.early_data_keys_available
        && inputs.initial_packet_sent
    {
        return SendContext {
            level: EncryptionLevel::EarlyData,
            has_pending_ack: false,
            is_path_probe: false,
        };
    }

    let has_pending_ack = match inputs.current_level {
        EncryptionLevel::Initial => inputs.initial_ack_pending,
        EncryptionLevel::Handshake => inputs.handshake_ack_pending,
        EncryptionLevel::EarlyData | EncryptionLevel::Application => {
            inputs.application_ack_pending
        }
    };

    SendContext {
        level: inputs.current_level,
        has_pending_ack,
        is_path_probe: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(current: EncryptionLevel) -> Inputs {
        Inputs {
            current_level: current,
            initial_keys_available: true,
            handshake_keys_available: true,
            early_data_keys_available: false,
            application_keys_available: false,
            initial_ack_pending: false,
            handshake_ack_pending: false,
            application_ack_pending: false,
            path_probe_pending: false,
            early_data_queued: false,
            initial_packet_sent: false,
        }
    }

    #[test]
    fn cross_level_initial_ack_wins_test() {
        let mut inputs = inputs(EncryptionLevel::Handshake);
        inputs.initial_ack_pending = true;

        let context = next_send_context(inputs);
        assert_eq!(context.level, EncryptionLevel::Initial);
        assert!(context.has_pending_ack);

        // discarded Initial keys cancel the priority
        inputs.initial_keys_available = false;
        let context = next_send_context(inputs);
        assert_eq!(context.level, EncryptionLevel::Handshake);
    }

    #[test]
    fn cross_level_handshake_ack_test() {
        let mut inputs = inputs(EncryptionLevel::Application);
        inputs.handshake_ack_pending = true;
        inputs.application_keys_available = true;

        let context = next_send_context(inputs);
        assert_eq!(context.level, EncryptionLevel::Handshake);
        assert!(context.has_pending_ack);
    }

    #[test]
    fn path_probe_needs_application_keys_test() {
        let mut inputs = inputs(EncryptionLevel::Application);
        inputs.path_probe_pending = true;

        // without 1-RTT keys the probe waits
        let context = next_send_context(inputs);
        assert!(!context.is_path_probe);

        inputs.application_keys_available = true;
        let context = next_send_context(inputs);
        assert!(context.is_path_probe);
        assert_eq!(context.level, EncryptionLevel::Application);
    }

    #[test]
    fn early_data_after_initial_test() {
        let mut inputs = inputs(EncryptionLevel::Initial);
        inputs.early_data_queued = true;
        inputs.early_data_keys_available = true;

        // the ClientHello Initial must go first
        let context = next_send_context(inputs);
        assert_eq!(context.level, EncryptionLevel::Initial);

        inputs.initial_packet_sent = true;
        let context = next_send_context(inputs);
        assert_eq!(context.level, EncryptionLevel::EarlyData);
    }

    #[test]
    fn default_is_current_level_test() {
        let mut inputs = inputs(EncryptionLevel::Initial);
        inputs.initial_ack_pending = true;
        let context = next_send_context(inputs);
        assert_eq!(context.level, EncryptionLevel::Initial);
        assert!(context.has_pending_ack);
        assert!(!context.is_path_probe);
    }
}
