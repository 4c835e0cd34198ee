// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream send and receive state machines (RFC 9000 §3.1, §3.2)
//!
//! Transitions return `Err(InvalidTransition)` when the event is not
//! valid in the current state and `Ok(false)` when the event is a
//! no-op because the machine is already at (or past) the target, which
//! is what makes duplicate frame delivery idempotent.

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current: &'static str,
    pub event: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid transition: {} in state {}", self.event, self.current)
    }
}

pub type Result = core::result::Result<bool, InvalidTransition>;

//= https://www.rfc-editor.org/rfc/rfc9000#section-3.1
//#        o
//#       | Create Stream (Sending)
//#       v
//#   +-------+
//#   | Ready | Send RESET_STREAM
//#   |       |-----------------------.
//#   +-------+                       |
//#       | Send STREAM /             |
//#       |      STREAM_DATA_BLOCKED  |
//#       v                           v
//#   +-------+                   +-------+
//#   | Send  |------------------>| Reset |
//#   +-------+  ...              +-------+

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Sender {
    #[default]
    Ready,
    Send,
    DataSent,
    DataRecvd,
    /// A RESET_STREAM has been queued but not yet transmitted
    ResetQueued,
    ResetSent,
    ResetRecvd,
}

impl Sender {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::DataRecvd | Self::ResetRecvd)
    }

    #[inline]
    pub fn is_reset(self) -> bool {
        matches!(self, Self::ResetQueued | Self::ResetSent | Self::ResetRecvd)
    }

    /// The application wrote data
    #[inline]
    pub fn on_send_stream(&mut self) -> Result {
        self.transition("send_stream", Self::Send, |state| {
            matches!(state, Self::Ready)
        })
    }

    /// A frame carrying FIN was emitted
    #[inline]
    pub fn on_send_fin(&mut self) -> Result {
        self.transition("send_fin", Self::DataSent, |state| {
            matches!(state, Self::Ready | Self::Send)
        })
    }

    /// Every byte up to the final size has been acknowledged
    #[inline]
    pub fn on_recv_all_acks(&mut self) -> Result {
        self.transition("recv_all_acks", Self::DataRecvd, |state| {
            matches!(state, Self::DataSent)
        })
    }

    /// The application requested a reset
    #[inline]
    pub fn on_queue_reset(&mut self) -> Result {
        self.transition("queue_reset", Self::ResetQueued, |state| {
            matches!(state, Self::Ready | Self::Send | Self::DataSent)
        })
    }

    /// The RESET_STREAM frame was transmitted
    #[inline]
    pub fn on_send_reset(&mut self) -> Result {
        self.transition("send_reset", Self::ResetSent, |state| {
            matches!(state, Self::Ready | Self::Send | Self::DataSent | Self::ResetQueued)
        })
    }

    /// The RESET_STREAM frame was acknowledged
    #[inline]
    pub fn on_recv_reset_ack(&mut self) -> Result {
        self.transition("recv_reset_ack", Self::ResetRecvd, |state| {
            matches!(state, Self::ResetSent)
        })
    }

    #[inline]
    fn transition(
        &mut self,
        event: &'static str,
        target: Self,
        valid: impl Fn(Self) -> bool,
    ) -> Result {
        transition(self, event, target, valid)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::Send => "Send",
            Self::DataSent => "DataSent",
            Self::DataRecvd => "DataRecvd",
            Self::ResetQueued => "ResetQueued",
            Self::ResetSent => "ResetSent",
            Self::ResetRecvd => "ResetRecvd",
        }
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-3.2
//#   +-------+
//#   | Recv  | Recv RESET_STREAM
//#   |       |-----------------------.
//#   +-------+                       |
//#       | Recv STREAM + FIN         |
//#       v                           v
//#   +-------+                   +-------+
//#   | Size  |------------------>| Reset |
//#   | Known |  ...              | Recvd |
//#   +-------+                   +-------+

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Receiver {
    #[default]
    Recv,
    SizeKnown,
    DataRecvd,
    DataRead,
    ResetRecvd,
    ResetRead,
}

impl Receiver {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::DataRead | Self::ResetRead)
    }

    #[inline]
    pub fn is_reset(self) -> bool {
        matches!(self, Self::ResetRecvd | Self::ResetRead)
    }

    /// A frame carrying FIN arrived, establishing the final size
    #[inline]
    pub fn on_receive_fin(&mut self) -> Result {
        self.transition("receive_fin", Self::SizeKnown, |state| {
            matches!(state, Self::Recv)
        })
    }

    /// All bytes up to the final size have been received
    #[inline]
    pub fn on_receive_all_data(&mut self) -> Result {
        self.transition("receive_all_data", Self::DataRecvd, |state| {
            matches!(state, Self::SizeKnown)
        })
    }

    /// The application consumed all data
    #[inline]
    pub fn on_app_read_all_data(&mut self) -> Result {
        self.transition("app_read_all_data", Self::DataRead, |state| {
            matches!(state, Self::DataRecvd)
        })
    }

    /// A RESET_STREAM arrived
    #[inline]
    pub fn on_reset(&mut self) -> Result {
        self.transition("reset", Self::ResetRecvd, |state| {
            matches!(state, Self::Recv | Self::SizeKnown)
        })
    }

    /// The application observed the reset
    #[inline]
    pub fn on_app_read_reset(&mut self) -> Result {
        self.transition("app_read_reset", Self::ResetRead, |state| {
            matches!(state, Self::ResetRecvd)
        })
    }

    #[inline]
    fn transition(
        &mut self,
        event: &'static str,
        target: Self,
        valid: impl Fn(Self) -> bool,
    ) -> Result {
        transition(self, event, target, valid)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Recv => "Recv",
            Self::SizeKnown => "SizeKnown",
            Self::DataRecvd => "DataRecvd",
            Self::DataRead => "DataRead",
            Self::ResetRecvd => "ResetRecvd",
            Self::ResetRead => "ResetRead",
        }
    }
}

trait Named: Copy + PartialEq {
    fn state_name(self) -> &'static str;
}

impl Named for Sender {
    fn state_name(self) -> &'static str {
        self.name()
    }
}

impl Named for Receiver {
    fn state_name(self) -> &'static str {
        self.name()
    }
}

#[inline]
fn transition<S: Named>(
    state: &mut S,
    event: &'static str,
    target: S,
    valid: impl Fn(S) -> bool,
) -> Result {
    if *state == target {
        return Ok(false);
    }
    if valid(*state) {
        *state = target;
        Ok(true)
    } else {
        Err(InvalidTransition {
            current: state.state_name(),
            event,
        })
    }
}
