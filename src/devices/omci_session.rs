//! OMCI session driver used when a device is driven by the bulk runner.
//!
//! The driver walks a fixed provisioning sequence, choosing the next request
//! from the type of the last response received:
//!
//! ```text
//! start                 -> MIB reset
//! MIB reset response    -> MIB upload
//! MIB upload response   -> MIB upload next (sequence 0)
//! upload next response  -> sequence += 1; upload next while sequence <= 290,
//!                          then create GAL Ethernet profile
//! create response (1st) -> create GEM port network CTP
//! create response (2nd) -> push the EAPOL flow
//! ```
//!
//! Any other response means the remote responder broke the sequence; there is
//! no recovery from that.

use crate::omci::{self, MessageType, OmciFrame};
use thiserror::Error;

/// Last upload-next sequence number requested before provisioning starts
pub const MIB_UPLOAD_LAST_SEQUENCE: u16 = 290;

const TID_INITIAL: u16 = 0x0001;
const HIGH_PRIORITY_TID_INITIAL: u16 = 0x8000;

/// What the device must do after a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Send this request to the ONU
    Send {
        /// Request frame
        request: OmciFrame,
        /// Request name for logs
        name: &'static str,
    },
    /// Provisioning is done: post `send_eapol_flow`
    SendEapolFlow,
}

/// A response that does not fit the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unexpected frame of type {0}")]
pub struct UnexpectedResponse(pub MessageType);

/// Per-device session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OmciSession {
    tid: u16,
    hp_tid: u16,
    seq_number: u16,
    has_gem_port: bool,
}

impl Default for OmciSession {
    fn default() -> Self {
        Self::new()
    }
}

impl OmciSession {
    /// Fresh session: tid 1, high-priority tid 0x8000, sequence 0
    pub fn new() -> Self {
        Self {
            tid: TID_INITIAL,
            hp_tid: HIGH_PRIORITY_TID_INITIAL,
            seq_number: 0,
            has_gem_port: false,
        }
    }

    /// Take the next transaction id from the normal or high-priority range.
    ///
    /// Normal ids stay in `1..0x8000`, wrapping back to 1. High-priority ids
    /// never drop below 0x8000.
    pub fn next_tid(&mut self, high_priority: bool) -> u16 {
        if high_priority {
            let next = self.hp_tid;
            self.hp_tid = self.hp_tid.wrapping_add(1);
            if self.hp_tid < HIGH_PRIORITY_TID_INITIAL {
                self.hp_tid = HIGH_PRIORITY_TID_INITIAL;
            }
            next
        } else {
            let next = self.tid;
            self.tid += 1;
            if self.tid >= HIGH_PRIORITY_TID_INITIAL {
                self.tid = TID_INITIAL;
            }
            next
        }
    }

    /// Upload-next responses received so far
    pub fn seq_number(&self) -> u16 {
        self.seq_number
    }

    /// Whether the GEM port create has been issued
    pub fn has_gem_port(&self) -> bool {
        self.has_gem_port
    }

    /// First request of the session
    pub fn start(&mut self) -> SessionAction {
        SessionAction::Send {
            request: omci::mib_reset_request(self.next_tid(false)),
            name: "mibReset",
        }
    }

    /// Advance on a response of type `message_type`.
    pub fn on_response(
        &mut self,
        message_type: MessageType,
    ) -> Result<SessionAction, UnexpectedResponse> {
        let action = match message_type {
            MessageType::MibResetResponse => SessionAction::Send {
                request: omci::mib_upload_request(self.next_tid(false)),
                name: "mibUpload",
            },
            MessageType::MibUploadResponse => SessionAction::Send {
                request: omci::mib_upload_next_request(self.next_tid(false), self.seq_number),
                name: "mibUploadNext",
            },
            MessageType::MibUploadNextResponse => {
                self.seq_number = self.seq_number.saturating_add(1);
                if self.seq_number > MIB_UPLOAD_LAST_SEQUENCE {
                    SessionAction::Send {
                        request: omci::create_gal_ethernet_request(self.next_tid(false)),
                        name: "CreateGalEnetRequest",
                    }
                } else {
                    SessionAction::Send {
                        request: omci::mib_upload_next_request(
                            self.next_tid(false),
                            self.seq_number,
                        ),
                        name: "mibUploadNext",
                    }
                }
            }
            MessageType::CreateResponse if !self.has_gem_port => {
                self.has_gem_port = true;
                SessionAction::Send {
                    request: omci::create_gem_port_request(self.next_tid(false)),
                    name: "CreateGemPortRequest",
                }
            }
            MessageType::CreateResponse => SessionAction::SendEapolFlow,
            other => return Err(UnexpectedResponse(other)),
        };
        Ok(action)
    }
}
