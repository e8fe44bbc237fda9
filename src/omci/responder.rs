//! ONU-side OMCI responder.
//!
//! Answers every supported request with a successful response carrying the
//! request's transaction id. Creating a GEM port network CTP also reports a
//! [`OmciEvent::GemPortAdded`] so the device can advance its lifecycle.

use crate::omci::{
    OmciError, OmciFrame, MessageType, ME_GEM_PORT_NETWORK_CTP, ME_ONT_DATA, MIB_UPLOAD_COMMANDS,
};
use bytes::Bytes;

/// Result code of a successful command
const RESULT_OK: u8 = 0;

/// Device-level consequence of a handled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OmciEvent {
    /// A GEM port network CTP was created
    GemPortAdded {
        /// Instance of the created entity
        gem_port_id: u16,
    },
}

/// Response to send back plus any device event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OmciReply {
    /// Encoded response frame
    pub response: Bytes,
    /// Event the device must process after sending the response
    pub event: Option<OmciEvent>,
}

/// Produce the response to `request`.
pub fn respond(request: &OmciFrame) -> Result<OmciReply, OmciError> {
    if !request.message_type.is_request() {
        return Err(OmciError::NotARequest(request.message_type));
    }

    let mut response = OmciFrame::new(
        request.tid,
        request.message_type.response(),
        request.me_class,
        request.me_instance,
    );
    let mut event = None;

    match request.message_type {
        MessageType::MibResetRequest | MessageType::SetRequest => {
            response = response.with_contents(&[RESULT_OK]);
        }
        MessageType::MibUploadRequest => {
            response = response.with_contents(&MIB_UPLOAD_COMMANDS.to_be_bytes());
        }
        MessageType::MibUploadNextRequest => {
            let sequence = request.content_u16(0);
            if sequence < MIB_UPLOAD_COMMANDS {
                // one ONT data record per command, numbered by sequence
                let mut record = Vec::with_capacity(4);
                record.extend_from_slice(&ME_ONT_DATA.to_be_bytes());
                record.extend_from_slice(&sequence.to_be_bytes());
                response = response.with_contents(&record);
            }
        }
        MessageType::CreateRequest => {
            response = response.with_contents(&[RESULT_OK]);
            if request.me_class == ME_GEM_PORT_NETWORK_CTP {
                event = Some(OmciEvent::GemPortAdded {
                    gem_port_id: request.me_instance,
                });
            }
        }
        MessageType::GetRequest => {
            // result, then the requested attribute mask with no attributes
            let mask = request.content_u16(0).to_be_bytes();
            response = response.with_contents(&[RESULT_OK, mask[0], mask[1]]);
        }
        _ => return Err(OmciError::NotARequest(request.message_type)),
    }

    Ok(OmciReply {
        response: response.encode(),
        event,
    })
}
