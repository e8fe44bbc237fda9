//! Device worker driven through a recording controller.
//!
//! The mock controller answers OMCI requests with the ONU-side responder and
//! feeds the responses back into the worker, so a mirror ONU runs the whole
//! provisioning sequence without a network.

use async_trait::async_trait;
use rust_bbsim::devices::controller::Controller;
use rust_bbsim::devices::flows::{self, FlowClass};
use rust_bbsim::devices::lifecycle::OnuState;
use rust_bbsim::devices::messages::OnuMessage;
use rust_bbsim::devices::{Onu, OnuConfig, OnuHandle, OnuTransport};
use rust_bbsim::grpc::openolt::{Flow, OmciMsg, OnuPacket};
use rust_bbsim::omci::{responder, MessageType, OmciFrame};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tonic::Status;

#[derive(Default)]
struct RecordingController {
    onu: OnceCell<OnuHandle>,
    omci_requests: Mutex<usize>,
    flows: Mutex<Vec<Flow>>,
    fail_flows: bool,
}

#[async_trait]
impl Controller for RecordingController {
    async fn flow_add(&self, flow: Flow) -> Result<(), Status> {
        if self.fail_flows {
            return Err(Status::unavailable("controller down"));
        }
        self.flows.lock().unwrap().push(flow);
        Ok(())
    }

    async fn omci_msg_out(&self, msg: OmciMsg) -> Result<(), Status> {
        *self.omci_requests.lock().unwrap() += 1;
        let request = OmciFrame::decode_hex(&msg.pkt)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let reply =
            responder::respond(&request).map_err(|e| Status::invalid_argument(e.to_string()))?;
        let onu = self.onu.get().ok_or_else(|| Status::internal("no ONU"))?;
        onu.send(OnuMessage::OmciIndication(reply.response))
            .await
            .map_err(|e| Status::unavailable(e.to_string()))
    }

    async fn onu_packet_out(&self, _packet: OnuPacket) -> Result<(), Status> {
        Ok(())
    }
}

fn spawn(
    controller: Arc<RecordingController>,
) -> (OnuHandle, CancellationToken, tokio::task::JoinHandle<()>) {
    let (onu, handle) = Onu::new(0, 1, 4, OnuConfig::default());
    controller.onu.set(handle.clone()).ok();
    let cancel = CancellationToken::new();
    let transport = OnuTransport::controller(controller);
    let worker = tokio::spawn(onu.run(transport, cancel.clone()));
    (handle, cancel, worker)
}

#[tokio::test]
async fn test_mirror_onu_provisions_and_pushes_eapol_flow() {
    let controller = Arc::new(RecordingController::default());
    let (onu, cancel, worker) = spawn(controller.clone());

    onu.send(OnuMessage::StartOmci).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(10),
        onu.watch().wait_for(|s| s.internal_state == OnuState::EapolFlowSent),
    )
    .await
    .expect("provisioning timed out")
    .unwrap();

    assert_eq!(*controller.omci_requests.lock().unwrap(), 2 + 291 + 2);

    // the flow is pushed by the entry side effect, after the transition
    tokio::time::timeout(Duration::from_secs(5), async {
        while controller.flows.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("flow not pushed");

    let flows = controller.flows.lock().unwrap().clone();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows::classify(&flows[0]), FlowClass::Eapol { port_no: 4 });
    assert_eq!(flows[0].access_intf_id, 1);
    assert_eq!(flows[0].onu_id, 4);

    cancel.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_flow_failure_stops_only_that_worker() {
    let failing = Arc::new(RecordingController {
        fail_flows: true,
        ..Default::default()
    });
    let (failing_onu, _cancel, failing_worker) = spawn(failing);

    let healthy = Arc::new(RecordingController::default());
    let (other, other_cancel, other_worker) = {
        let (onu, handle) = Onu::new(0, 2, 4, OnuConfig::default());
        healthy.onu.set(handle.clone()).ok();
        let cancel = CancellationToken::new();
        let transport = OnuTransport::controller(healthy.clone());
        let worker = tokio::spawn(onu.run(transport, cancel.clone()));
        (handle, cancel, worker)
    };

    failing_onu.send(OnuMessage::SendEapolFlow).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), failing_worker)
        .await
        .expect("worker kept running")
        .unwrap();
    assert!(!failing_onu.snapshot().running);
    assert!(failing_onu.send(OnuMessage::StartOmci).await.is_err());

    other.send(OnuMessage::SendEapolFlow).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while healthy.flows.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("healthy ONU stalled");
    assert!(other.snapshot().running);

    other_cancel.cancel();
    other_worker.await.unwrap();
}

#[tokio::test]
async fn test_unexpected_omci_response_stops_worker() {
    let controller = Arc::new(RecordingController::default());
    let (onu, _cancel, worker) = spawn(controller);

    let get_response = OmciFrame::new(9, MessageType::GetResponse, 2, 0).encode();
    onu.send(OnuMessage::OmciIndication(get_response)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker kept running")
        .unwrap();

    assert!(!onu.snapshot().running);
}
