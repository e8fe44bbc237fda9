//! OMCI baseline message codec.
//!
//! Only the subset of the management protocol needed to provision an emulated
//! ONU is modeled: MIB reset, MIB upload / upload-next, and create, set and get
//! of managed entities. Frames use the 48-byte baseline layout:
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 2    | transaction id                 |
//! | 2      | 1    | message type (DB, AR, AK, MT)  |
//! | 3      | 1    | device identifier (`0x0a`)     |
//! | 4      | 2    | managed entity class           |
//! | 6      | 2    | managed entity instance        |
//! | 8      | 32   | message contents               |
//! | 40     | 8    | trailer (CPCS-UU/CPI, length, CRC) |

pub mod responder;

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Size of a baseline frame
pub const FRAME_LEN: usize = 48;
/// Size of the contents field
pub const CONTENTS_LEN: usize = 32;
/// Baseline device identifier
pub const BASELINE_DEVICE_ID: u8 = 0x0a;

/// ONT data, target of MIB reset and upload
pub const ME_ONT_DATA: u16 = 2;
/// GEM port network CTP
pub const ME_GEM_PORT_NETWORK_CTP: u16 = 268;
/// GAL Ethernet profile
pub const ME_GAL_ETHERNET_PROFILE: u16 = 272;

/// Number of upload-next commands the emulated ONU advertises
pub const MIB_UPLOAD_COMMANDS: u16 = 291;

/// GEM port id created by the provisioning sequence
pub const GEM_PORT_ID: u16 = 1;

const AR: u8 = 0x40;
const AK: u8 = 0x20;
const MT_MASK: u8 = 0x1f;
const TRAILER: [u8; 8] = [0x00, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x00];

/// Supported message types, split by direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Create request
    CreateRequest,
    /// Create response
    CreateResponse,
    /// Set request
    SetRequest,
    /// Set response
    SetResponse,
    /// Get request
    GetRequest,
    /// Get response
    GetResponse,
    /// MIB upload request
    MibUploadRequest,
    /// MIB upload response
    MibUploadResponse,
    /// MIB upload next request
    MibUploadNextRequest,
    /// MIB upload next response
    MibUploadNextResponse,
    /// MIB reset request
    MibResetRequest,
    /// MIB reset response
    MibResetResponse,
}

impl MessageType {
    fn action(self) -> u8 {
        match self {
            MessageType::CreateRequest | MessageType::CreateResponse => 4,
            MessageType::SetRequest | MessageType::SetResponse => 8,
            MessageType::GetRequest | MessageType::GetResponse => 9,
            MessageType::MibUploadRequest | MessageType::MibUploadResponse => 13,
            MessageType::MibUploadNextRequest | MessageType::MibUploadNextResponse => 14,
            MessageType::MibResetRequest | MessageType::MibResetResponse => 15,
        }
    }

    /// Whether this is a request (AR set)
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::CreateRequest
                | MessageType::SetRequest
                | MessageType::GetRequest
                | MessageType::MibUploadRequest
                | MessageType::MibUploadNextRequest
                | MessageType::MibResetRequest
        )
    }

    /// The response type answering this request
    pub fn response(self) -> Self {
        match self {
            MessageType::CreateRequest => MessageType::CreateResponse,
            MessageType::SetRequest => MessageType::SetResponse,
            MessageType::GetRequest => MessageType::GetResponse,
            MessageType::MibUploadRequest => MessageType::MibUploadResponse,
            MessageType::MibUploadNextRequest => MessageType::MibUploadNextResponse,
            MessageType::MibResetRequest => MessageType::MibResetResponse,
            response => response,
        }
    }

    /// Encoded message-type octet
    pub fn to_byte(self) -> u8 {
        let flag = if self.is_request() { AR } else { AK };
        flag | self.action()
    }

    /// Decode a message-type octet; the DB bit is ignored.
    pub fn from_byte(byte: u8) -> Option<Self> {
        let request = match (byte & AR != 0, byte & AK != 0) {
            (true, false) => true,
            (false, true) => false,
            _ => return None,
        };
        let (req, resp) = match byte & MT_MASK {
            4 => (MessageType::CreateRequest, MessageType::CreateResponse),
            8 => (MessageType::SetRequest, MessageType::SetResponse),
            9 => (MessageType::GetRequest, MessageType::GetResponse),
            13 => (MessageType::MibUploadRequest, MessageType::MibUploadResponse),
            14 => (MessageType::MibUploadNextRequest, MessageType::MibUploadNextResponse),
            15 => (MessageType::MibResetRequest, MessageType::MibResetResponse),
            _ => return None,
        };
        Some(if request { req } else { resp })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OmciError {
    /// Fewer bytes than the baseline header and contents
    #[error("OMCI frame too short: {0} bytes")]
    TooShort(usize),

    /// Not a baseline frame
    #[error("unsupported OMCI device identifier {0:#04x}")]
    DeviceId(u8),

    /// Message type outside the supported subset
    #[error("unsupported OMCI message type {0:#04x}")]
    MessageType(u8),

    /// The hex encoding carried by the controller is invalid
    #[error("invalid hex encoded OMCI payload: {0}")]
    Hex(#[from] hex::FromHexError),

    /// A response was sent where a request was expected
    #[error("OMCI {0} is not a request")]
    NotARequest(MessageType),
}

/// A decoded baseline frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OmciFrame {
    /// Transaction id
    pub tid: u16,
    /// Message type
    pub message_type: MessageType,
    /// Managed entity class
    pub me_class: u16,
    /// Managed entity instance
    pub me_instance: u16,
    /// Message contents
    pub contents: [u8; CONTENTS_LEN],
}

impl OmciFrame {
    /// Frame with zeroed contents
    pub fn new(tid: u16, message_type: MessageType, me_class: u16, me_instance: u16) -> Self {
        Self {
            tid,
            message_type,
            me_class,
            me_instance,
            contents: [0; CONTENTS_LEN],
        }
    }

    /// Copy `data` to the start of the contents
    pub fn with_contents(mut self, data: &[u8]) -> Self {
        let len = data.len().min(CONTENTS_LEN);
        self.contents[..len].copy_from_slice(&data[..len]);
        self
    }

    /// Serialize to the 48-byte baseline layout
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_LEN);
        buf.put_u16(self.tid);
        buf.put_u8(self.message_type.to_byte());
        buf.put_u8(BASELINE_DEVICE_ID);
        buf.put_u16(self.me_class);
        buf.put_u16(self.me_instance);
        buf.put_slice(&self.contents);
        buf.put_slice(&TRAILER);
        buf.freeze()
    }

    /// Decode a raw frame; the trailer is not checked.
    pub fn decode(raw: &[u8]) -> Result<Self, OmciError> {
        if raw.len() < 8 + CONTENTS_LEN {
            return Err(OmciError::TooShort(raw.len()));
        }
        if raw[3] != BASELINE_DEVICE_ID {
            return Err(OmciError::DeviceId(raw[3]));
        }
        let message_type = MessageType::from_byte(raw[2]).ok_or(OmciError::MessageType(raw[2]))?;
        let mut contents = [0; CONTENTS_LEN];
        contents.copy_from_slice(&raw[8..8 + CONTENTS_LEN]);

        Ok(Self {
            tid: u16::from_be_bytes([raw[0], raw[1]]),
            message_type,
            me_class: u16::from_be_bytes([raw[4], raw[5]]),
            me_instance: u16::from_be_bytes([raw[6], raw[7]]),
            contents,
        })
    }

    /// Decode a hex-encoded frame as carried by `OmciMsgOut`
    pub fn decode_hex(encoded: &[u8]) -> Result<Self, OmciError> {
        Self::decode(&hex::decode(encoded)?)
    }

    /// Big-endian integer at `offset` in the contents
    pub fn content_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.contents[offset], self.contents[offset + 1]])
    }
}

/// Message type of a raw frame, without decoding the rest.
pub fn peek_message_type(raw: &[u8]) -> Result<MessageType, OmciError> {
    let byte = *raw.get(2).ok_or(OmciError::TooShort(raw.len()))?;
    MessageType::from_byte(byte).ok_or(OmciError::MessageType(byte))
}

/// MIB reset request
pub fn mib_reset_request(tid: u16) -> OmciFrame {
    OmciFrame::new(tid, MessageType::MibResetRequest, ME_ONT_DATA, 0)
}

/// MIB upload request
pub fn mib_upload_request(tid: u16) -> OmciFrame {
    OmciFrame::new(tid, MessageType::MibUploadRequest, ME_ONT_DATA, 0)
}

/// MIB upload next request for command `sequence`
pub fn mib_upload_next_request(tid: u16, sequence: u16) -> OmciFrame {
    OmciFrame::new(tid, MessageType::MibUploadNextRequest, ME_ONT_DATA, 0)
        .with_contents(&sequence.to_be_bytes())
}

/// Create the GAL Ethernet profile (max GEM payload 48 bytes)
pub fn create_gal_ethernet_request(tid: u16) -> OmciFrame {
    OmciFrame::new(tid, MessageType::CreateRequest, ME_GAL_ETHERNET_PROFILE, 1)
        .with_contents(&0x0030u16.to_be_bytes())
}

/// Create the GEM port network CTP carrying subscriber traffic
pub fn create_gem_port_request(tid: u16) -> OmciFrame {
    let mut contents = Vec::with_capacity(12);
    contents.extend_from_slice(&GEM_PORT_ID.to_be_bytes()); // port id
    contents.extend_from_slice(&0x8001u16.to_be_bytes()); // T-CONT pointer
    contents.push(0x03); // bidirectional
    contents.extend_from_slice(&0x8000u16.to_be_bytes()); // upstream traffic management pointer
    contents.extend_from_slice(&0u16.to_be_bytes()); // traffic descriptor profile
    contents.extend_from_slice(&0x8000u16.to_be_bytes()); // downstream priority queue pointer
    OmciFrame::new(tid, MessageType::CreateRequest, ME_GEM_PORT_NETWORK_CTP, GEM_PORT_ID)
        .with_contents(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_octets() {
        assert_eq!(MessageType::MibResetRequest.to_byte(), 0x4f);
        assert_eq!(MessageType::MibResetResponse.to_byte(), 0x2f);
        assert_eq!(MessageType::CreateRequest.to_byte(), 0x44);
        assert_eq!(MessageType::from_byte(0x2e), Some(MessageType::MibUploadNextResponse));
        // DB bit ignored
        assert_eq!(MessageType::from_byte(0xc4), Some(MessageType::CreateRequest));
        assert_eq!(MessageType::from_byte(0x60 | 4), None);
        assert_eq!(MessageType::from_byte(0x4b), None);
    }

    #[test]
    fn test_frame_layout() {
        let frame = mib_upload_next_request(0x0102, 7).encode();
        assert_eq!(frame.len(), FRAME_LEN);
        assert_eq!(&frame[..8], &[0x01, 0x02, 0x4e, 0x0a, 0x00, 0x02, 0x00, 0x00]);
        assert_eq!(&frame[8..10], &[0x00, 0x07]);
        assert_eq!(&frame[40..], &TRAILER);

        let decoded = OmciFrame::decode(&frame).unwrap();
        assert_eq!(decoded.tid, 0x0102);
        assert_eq!(decoded.content_u16(0), 7);
    }

    #[test]
    fn test_hex_payload() {
        let frame = create_gem_port_request(3);
        let encoded = hex::encode(frame.encode());
        assert_eq!(OmciFrame::decode_hex(encoded.as_bytes()).unwrap(), frame);
        assert!(matches!(OmciFrame::decode_hex(b"zz"), Err(OmciError::Hex(_))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(OmciFrame::decode(&[0; 4]), Err(OmciError::TooShort(4)));
        let mut frame = mib_reset_request(1).encode().to_vec();
        frame[3] = 0x0b;
        assert_eq!(OmciFrame::decode(&frame), Err(OmciError::DeviceId(0x0b)));
        assert_eq!(peek_message_type(&[0, 1]), Err(OmciError::TooShort(2)));
    }
}
