//! EAPOL (802.1X) exchange, supplicant and authenticator roles.
//!
//! The emulated ONU plays the supplicant: it opens with EAPOL-Start, answers
//! the identity request and the MD5 challenge, and waits for success or
//! failure. The bulk runner plays the authenticator towards a remote emulator.
//!
//! The challenge response is a SHA-256 digest truncated to the 16 bytes an
//! MD5-Challenge value carries. Both roles use the same derivation, so the
//! authenticator can check the answer.

use crate::devices::identity::MacAddress;
use crate::devices::lifecycle::OnuEvent;
use crate::responders::packet::{self, ETH_TYPE_EAPOL};
use crate::responders::{Exchange, ResponderError};
use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

const PROTOCOL: &str = "EAPOL";

/// PAE group address
pub const PAE_GROUP_ADDRESS: MacAddress = MacAddress([0x01, 0x80, 0xc2, 0x00, 0x00, 0x03]);
/// Source address used by the bulk-runner authenticator
pub const AUTHENTICATOR_ADDRESS: MacAddress = MacAddress([0x2e, 0x60, 0x70, 0x00, 0x00, 0x01]);
/// Identity the supplicant presents
pub const USER: &[u8] = b"user";
/// Shared secret
pub const PASSWORD: &[u8] = b"password";

const EAPOL_VERSION: u8 = 1;
const EAPOL_TYPE_EAP_PACKET: u8 = 0;
const EAPOL_TYPE_START: u8 = 1;

const EAP_CODE_REQUEST: u8 = 1;
const EAP_CODE_RESPONSE: u8 = 2;
const EAP_CODE_SUCCESS: u8 = 3;
const EAP_CODE_FAILURE: u8 = 4;

const EAP_TYPE_IDENTITY: u8 = 1;
const EAP_TYPE_MD5_CHALLENGE: u8 = 4;

const MD5_VALUE_LEN: usize = 16;

/// A decoded EAPOL frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapolMessage {
    /// EAPOL-Start
    Start,
    /// EAP Request/Identity
    RequestIdentity {
        /// EAP identifier
        id: u8,
    },
    /// EAP Request/MD5-Challenge
    RequestChallenge {
        /// EAP identifier
        id: u8,
        /// Challenge value
        challenge: Vec<u8>,
    },
    /// EAP Response/Identity
    ResponseIdentity {
        /// EAP identifier
        id: u8,
        /// Presented identity
        identity: Vec<u8>,
    },
    /// EAP Response/MD5-Challenge
    ResponseChallenge {
        /// EAP identifier
        id: u8,
        /// Response value
        value: Vec<u8>,
    },
    /// EAP Success
    Success {
        /// EAP identifier
        id: u8,
    },
    /// EAP Failure
    Failure {
        /// EAP identifier
        id: u8,
    },
}

fn malformed(reason: &'static str) -> ResponderError {
    ResponderError::Malformed {
        protocol: PROTOCOL,
        reason,
    }
}

fn unexpected(message: &EapolMessage, role: &str) -> ResponderError {
    ResponderError::Unexpected {
        protocol: PROTOCOL,
        message: format!("{message:?} received by {role}"),
    }
}

/// Decode an EAPOL frame.
pub fn parse(frame: &[u8]) -> Result<EapolMessage, ResponderError> {
    let eth = packet::parse_ethernet(frame).ok_or_else(|| malformed("short ethernet header"))?;
    if eth.eth_type != ETH_TYPE_EAPOL {
        return Err(malformed("not an EAPOL ethertype"));
    }
    let eapol = eth.payload;
    if eapol.len() < 4 {
        return Err(malformed("short EAPOL header"));
    }

    match eapol[1] {
        EAPOL_TYPE_START => Ok(EapolMessage::Start),
        EAPOL_TYPE_EAP_PACKET => parse_eap(&eapol[4..]),
        _ => Err(malformed("unsupported EAPOL packet type")),
    }
}

fn parse_eap(eap: &[u8]) -> Result<EapolMessage, ResponderError> {
    if eap.len() < 4 {
        return Err(malformed("short EAP header"));
    }
    let code = eap[0];
    let id = eap[1];
    let len = usize::from(u16::from_be_bytes([eap[2], eap[3]]));
    let body = eap.get(4..len).ok_or_else(|| malformed("EAP length exceeds frame"))?;

    match code {
        EAP_CODE_SUCCESS => return Ok(EapolMessage::Success { id }),
        EAP_CODE_FAILURE => return Ok(EapolMessage::Failure { id }),
        EAP_CODE_REQUEST | EAP_CODE_RESPONSE => {}
        _ => return Err(malformed("unknown EAP code")),
    }

    let (&eap_type, data) = body.split_first().ok_or_else(|| malformed("missing EAP type"))?;
    match (code, eap_type) {
        (EAP_CODE_REQUEST, EAP_TYPE_IDENTITY) => Ok(EapolMessage::RequestIdentity { id }),
        (EAP_CODE_RESPONSE, EAP_TYPE_IDENTITY) => Ok(EapolMessage::ResponseIdentity {
            id,
            identity: data.to_vec(),
        }),
        (code, EAP_TYPE_MD5_CHALLENGE) => {
            let (&value_len, rest) = data
                .split_first()
                .ok_or_else(|| malformed("missing MD5 value size"))?;
            let value = rest
                .get(..usize::from(value_len))
                .ok_or_else(|| malformed("MD5 value exceeds frame"))?
                .to_vec();
            if code == EAP_CODE_REQUEST {
                Ok(EapolMessage::RequestChallenge {
                    id,
                    challenge: value,
                })
            } else {
                Ok(EapolMessage::ResponseChallenge { id, value })
            }
        }
        _ => Err(malformed("unsupported EAP type")),
    }
}

/// Value a supplicant must answer `challenge` with.
pub fn challenge_response(id: u8, password: &[u8], challenge: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update([id]);
    hasher.update(password);
    hasher.update(challenge);
    hasher.finalize()[..MD5_VALUE_LEN].to_vec()
}

/// Challenge the authenticator sends to the device with address `mac`.
pub fn challenge_for(mac: MacAddress) -> Vec<u8> {
    Sha256::digest(mac.octets())[..MD5_VALUE_LEN].to_vec()
}

fn eapol_frame(dst: MacAddress, src: MacAddress, eapol_type: u8, body: &[u8]) -> Bytes {
    let header = packet::ethernet_header(dst, src, &[], ETH_TYPE_EAPOL);
    let mut eapol = BytesMut::with_capacity(4 + body.len());
    eapol.put_u8(EAPOL_VERSION);
    eapol.put_u8(eapol_type);
    eapol.put_u16(body.len() as u16);
    eapol.put_slice(body);
    packet::finish(header, &eapol)
}

fn eap_packet(dst: MacAddress, src: MacAddress, code: u8, id: u8, data: &[u8]) -> Bytes {
    let mut eap = BytesMut::with_capacity(4 + data.len());
    eap.put_u8(code);
    eap.put_u8(id);
    eap.put_u16((4 + data.len()) as u16);
    eap.put_slice(data);
    eapol_frame(dst, src, EAPOL_TYPE_EAP_PACKET, &eap)
}

fn typed(eap_type: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + data.len());
    out.push(eap_type);
    out.extend_from_slice(data);
    out
}

fn md5_data(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + value.len());
    out.push(EAP_TYPE_MD5_CHALLENGE);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
    out
}

/// EAPOL-Start from the device with address `mac`.
pub fn start_frame(mac: MacAddress) -> Bytes {
    eapol_frame(PAE_GROUP_ADDRESS, mac, EAPOL_TYPE_START, &[])
}

/// Open the exchange on the supplicant side.
pub fn start(mac: MacAddress) -> Exchange {
    Exchange::reply_then(start_frame(mac), OnuEvent::EapStartSent)
}

/// Supplicant step: answer a frame sent by the authenticator.
pub fn supplicant_next(mac: MacAddress, frame: &[u8]) -> Result<Exchange, ResponderError> {
    let message = parse(frame)?;
    match message {
        EapolMessage::RequestIdentity { id } => Ok(Exchange::reply_then(
            eap_packet(
                PAE_GROUP_ADDRESS,
                mac,
                EAP_CODE_RESPONSE,
                id,
                &typed(EAP_TYPE_IDENTITY, USER),
            ),
            OnuEvent::EapResponseIdentitySent,
        )),
        EapolMessage::RequestChallenge { id, ref challenge } => {
            let value = challenge_response(id, PASSWORD, challenge);
            Ok(Exchange::reply_then(
                eap_packet(PAE_GROUP_ADDRESS, mac, EAP_CODE_RESPONSE, id, &md5_data(&value)),
                OnuEvent::EapResponseChallengeSent,
            ))
        }
        EapolMessage::Success { .. } => {
            Ok(Exchange::transition(OnuEvent::EapResponseSuccessReceived).completed())
        }
        EapolMessage::Failure { .. } => Ok(Exchange::transition(OnuEvent::AuthFailed).completed()),
        other => Err(unexpected(&other, "supplicant")),
    }
}

/// Authenticator step: answer a frame sent by the device with address `mac`.
///
/// A correct challenge response completes the exchange and asks the device to
/// push its DHCP flow.
pub fn authenticator_next(mac: MacAddress, frame: &[u8]) -> Result<Exchange, ResponderError> {
    let message = parse(frame)?;
    match message {
        EapolMessage::Start => Ok(Exchange::reply(eap_packet(
            mac,
            AUTHENTICATOR_ADDRESS,
            EAP_CODE_REQUEST,
            1,
            &typed(EAP_TYPE_IDENTITY, &[]),
        ))),
        EapolMessage::ResponseIdentity { id, .. } => Ok(Exchange::reply(eap_packet(
            mac,
            AUTHENTICATOR_ADDRESS,
            EAP_CODE_REQUEST,
            id.wrapping_add(1),
            &md5_data(&challenge_for(mac)),
        ))),
        EapolMessage::ResponseChallenge { id, ref value } => {
            if *value == challenge_response(id, PASSWORD, &challenge_for(mac)) {
                Ok(Exchange::reply_then(
                    eap_packet(mac, AUTHENTICATOR_ADDRESS, EAP_CODE_SUCCESS, id, &[]),
                    OnuEvent::SendDhcpFlow,
                )
                .completed())
            } else {
                let failure = eap_packet(mac, AUTHENTICATOR_ADDRESS, EAP_CODE_FAILURE, id, &[]);
                Ok(Exchange::reply(failure).completed())
            }
        }
        other => Err(unexpected(&other, "authenticator")),
    }
}
