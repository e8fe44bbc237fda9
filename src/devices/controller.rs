//! Outbound unary calls from a device to its controller.
//!
//! Only devices driven by the bulk runner call the controller directly; the
//! emulated ONUs answer through the indication stream instead. The trait keeps
//! the device worker independent of the gRPC client so tests can record calls.

use crate::grpc::openolt::{openolt_client::OpenoltClient, Flow, OmciMsg, OnuPacket};
use async_trait::async_trait;
use tonic::transport::Channel;
use tonic::Status;

/// Unary calls a device may place on the controller.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Install a forwarding rule
    async fn flow_add(&self, flow: Flow) -> Result<(), Status>;

    /// Send an OMCI request to an ONU; `pkt` is hex encoded
    async fn omci_msg_out(&self, msg: OmciMsg) -> Result<(), Status>;

    /// Send a frame down to an ONU
    async fn onu_packet_out(&self, packet: OnuPacket) -> Result<(), Status>;
}

#[async_trait]
impl Controller for OpenoltClient<Channel> {
    async fn flow_add(&self, flow: Flow) -> Result<(), Status> {
        let mut client = self.clone();
        OpenoltClient::flow_add(&mut client, flow).await.map(|_| ())
    }

    async fn omci_msg_out(&self, msg: OmciMsg) -> Result<(), Status> {
        let mut client = self.clone();
        OpenoltClient::omci_msg_out(&mut client, msg).await.map(|_| ())
    }

    async fn onu_packet_out(&self, packet: OnuPacket) -> Result<(), Status> {
        let mut client = self.clone();
        OpenoltClient::onu_packet_out(&mut client, packet).await.map(|_| ())
    }
}
