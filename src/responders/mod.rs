//! Protocol responders for the emulated subscriber traffic.
//!
//! Each responder is a set of pure functions from a received frame to an
//! [`Exchange`]: the frame to transmit in reply (if any), the lifecycle event
//! the device should post once that reply is on the wire, and whether the
//! exchange is finished. Responders never touch device state themselves; the
//! dispatch loop transmits the reply and then decides whether to post the
//! event, which keeps sending and phase changes apart.
//!
//! Both peer roles are implemented for each protocol:
//!
//! - [`eapol`] supplicant (emulated ONU) and authenticator (bulk runner)
//! - [`dhcp`] client (emulated ONU) and server (bulk runner)

pub mod dhcp;
pub mod eapol;
pub mod packet;

use crate::devices::lifecycle::OnuEvent;
use bytes::Bytes;
use thiserror::Error;

/// Outcome of feeding one frame to a responder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exchange {
    /// Frame to transmit in reply
    pub reply: Option<Bytes>,
    /// Lifecycle event to post once the reply (if any) has been sent
    pub transition: Option<OnuEvent>,
    /// The exchange has reached its final step
    pub completed: bool,
}

impl Exchange {
    /// Reply without a phase change
    pub fn reply(frame: Bytes) -> Self {
        Self {
            reply: Some(frame),
            ..Default::default()
        }
    }

    /// Reply, then post `event`
    pub fn reply_then(frame: Bytes, event: OnuEvent) -> Self {
        Self {
            reply: Some(frame),
            transition: Some(event),
            completed: false,
        }
    }

    /// Post `event` with nothing to send
    pub fn transition(event: OnuEvent) -> Self {
        Self {
            transition: Some(event),
            ..Default::default()
        }
    }

    /// Mark the exchange as finished
    pub fn completed(mut self) -> Self {
        self.completed = true;
        self
    }
}

/// A frame a responder could not act on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponderError {
    /// The frame is too short or structurally invalid
    #[error("malformed {protocol} frame: {reason}")]
    Malformed {
        /// Protocol being parsed
        protocol: &'static str,
        /// What was wrong
        reason: &'static str,
    },

    /// A well-formed message this role does not expect
    #[error("unexpected {protocol} message: {message}")]
    Unexpected {
        /// Protocol being parsed
        protocol: &'static str,
        /// Message description
        message: String,
    },
}
