//! OMCI provisioning between the session driver and the ONU-side responder.

use rust_bbsim::devices::omci_session::{OmciSession, SessionAction, MIB_UPLOAD_LAST_SEQUENCE};
use rust_bbsim::omci::responder::{respond, OmciEvent};
use rust_bbsim::omci::{self, peek_message_type, MessageType, OmciFrame};

/// Run the session against the responder until it asks for the EAPOL flow.
fn provision() -> (Vec<OmciFrame>, Vec<OmciEvent>, OmciSession) {
    let mut session = OmciSession::new();
    let mut requests = Vec::new();
    let mut events = Vec::new();

    let mut action = session.start();
    while let SessionAction::Send { request, .. } = action {
        // requests travel hex encoded, as on OmciMsgOut
        let wire = hex::encode(request.encode());
        let decoded = OmciFrame::decode_hex(wire.as_bytes()).unwrap();
        let reply = respond(&decoded).unwrap();
        events.extend(reply.event);
        requests.push(request);

        let response_type = peek_message_type(&reply.response).unwrap();
        action = session.on_response(response_type).unwrap();
    }
    (requests, events, session)
}

#[test]
fn test_full_provisioning_sequence() {
    let (requests, events, session) = provision();

    // reset, upload, 291 upload-next, GAL profile, GEM port
    assert_eq!(requests.len(), 2 + 291 + 2);
    assert_eq!(requests[0].message_type, MessageType::MibResetRequest);
    assert_eq!(requests[1].message_type, MessageType::MibUploadRequest);

    let upload_next: Vec<_> = requests
        .iter()
        .filter(|r| r.message_type == MessageType::MibUploadNextRequest)
        .map(|r| r.content_u16(0))
        .collect();
    assert_eq!(upload_next.first(), Some(&0));
    assert_eq!(upload_next.last(), Some(&MIB_UPLOAD_LAST_SEQUENCE));

    let gal = &requests[requests.len() - 2];
    assert_eq!(gal.message_type, MessageType::CreateRequest);
    assert_eq!(gal.me_class, omci::ME_GAL_ETHERNET_PROFILE);
    let gem = &requests[requests.len() - 1];
    assert_eq!(gem.me_class, omci::ME_GEM_PORT_NETWORK_CTP);

    assert_eq!(session.seq_number(), 291);
    assert!(session.has_gem_port());
    assert_eq!(events, vec![OmciEvent::GemPortAdded { gem_port_id: omci::GEM_PORT_ID }]);
}

#[test]
fn test_transaction_ids_are_unique_and_normal_priority() {
    let (requests, _, _) = provision();
    let mut tids: Vec<_> = requests.iter().map(|r| r.tid).collect();
    assert!(tids.iter().all(|&tid| tid != 0 && tid < 0x8000));
    tids.dedup();
    assert_eq!(tids.len(), requests.len());
    assert_eq!(tids[0], 1);
}

#[test]
fn test_responses_echo_transaction_id() {
    let request = omci::mib_upload_next_request(42, 7);
    let reply = respond(&request).unwrap();
    let response = OmciFrame::decode(&reply.response).unwrap();
    assert_eq!(response.tid, 42);
    assert_eq!(response.message_type, MessageType::MibUploadNextResponse);
    assert_eq!(response.content_u16(0), omci::ME_ONT_DATA);
    assert_eq!(response.content_u16(2), 7);
}
