//! Controller-facing `Openolt` service.
//!
//! Handlers only locate the target ONU and enqueue a message for its worker;
//! no device state is touched here. Enqueueing waits while the device queue is
//! full.

use crate::devices::identity::SerialNumber;
use crate::devices::indications::{IndicationItem, IndicationStream};
use crate::devices::messages::{OnuMessage, PacketMessage};
use crate::devices::olt::OltDevice;
use crate::devices::onu::OnuHandle;
use crate::error::{SimError, SimResult};
use crate::grpc::openolt::{openolt_server::Openolt, Empty, Flow, OmciMsg, Onu, OnuPacket};
use crate::responders::packet;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

/// Default capacity of the indication stream buffer
pub const INDICATION_BUFFER: usize = 1024;

/// `Openolt` service backed by one emulated OLT.
#[derive(Debug, Clone)]
pub struct OpenoltService {
    olt: Arc<OltDevice>,
    buffer: usize,
}

impl OpenoltService {
    /// Serve `olt`
    pub fn new(olt: Arc<OltDevice>) -> Self {
        Self {
            olt,
            buffer: INDICATION_BUFFER,
        }
    }

    /// Override the indication stream buffer size
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Locate an ONU by serial number, falling back to `(intf_id, onu_id)`.
    fn locate(&self, onu: &Onu) -> SimResult<&OnuHandle> {
        match onu.serial_number.as_ref().and_then(SerialNumber::from_proto) {
            Some(sn) => self
                .olt
                .find_onu_by_serial(&sn)
                .or_else(|_| self.olt.find_onu(onu.intf_id, onu.onu_id)),
            None => self.olt.find_onu(onu.intf_id, onu.onu_id),
        }
    }

    fn flow_target(&self, flow: &Flow) -> SimResult<Option<&OnuHandle>> {
        // network-side flows carry no ONU
        let (Ok(intf_id), Ok(onu_id)) =
            (u32::try_from(flow.access_intf_id), u32::try_from(flow.onu_id))
        else {
            return Ok(None);
        };
        self.olt.find_onu(intf_id, onu_id).map(Some)
    }
}

#[tonic::async_trait]
impl Openolt for OpenoltService {
    type EnableIndicationStream = ReceiverStream<IndicationItem>;

    /// Open the indication stream and enable the OLT
    async fn enable_indication(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::EnableIndicationStream>, Status> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let _announcement = self.olt.enable(IndicationStream::new(tx)).await?;
        info!(olt_id = self.olt.id(), "Indication stream opened");
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn activate_onu(&self, request: Request<Onu>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let onu = self.locate(&req)?;
        info!(
            intf_id = onu.pon_port_id(),
            onu_id = onu.id(),
            onu_sn = %onu.serial_number(),
            "Received ActivateOnu call"
        );
        onu.send(OnuMessage::Activate).await?;
        Ok(Response::new(Empty {}))
    }

    async fn deactivate_onu(&self, request: Request<Onu>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let onu = self.locate(&req)?;
        info!(
            intf_id = onu.pon_port_id(),
            onu_id = onu.id(),
            onu_sn = %onu.serial_number(),
            "Received DeactivateOnu call"
        );
        onu.send(OnuMessage::Deactivate).await?;
        Ok(Response::new(Empty {}))
    }

    async fn omci_msg_out(&self, request: Request<OmciMsg>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let onu = self.olt.find_onu(req.intf_id, req.onu_id)?;
        debug!(intf_id = req.intf_id, onu_id = req.onu_id, "Received OmciMsgOut call");
        onu.send(OnuMessage::Omci(Bytes::from(req.pkt))).await?;
        Ok(Response::new(Empty {}))
    }

    async fn onu_packet_out(&self, request: Request<OnuPacket>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let onu = self.olt.find_onu(req.intf_id, req.onu_id)?;
        let packet_type = packet::classify(&req.pkt)
            .ok_or_else(|| {
                SimError::InvalidPacket(format!("unsupported frame of {} bytes", req.pkt.len()))
            })?;
        debug!(
            intf_id = req.intf_id,
            onu_id = req.onu_id,
            %packet_type,
            "Received OnuPacketOut call"
        );
        onu.send(OnuMessage::PacketOut(PacketMessage {
            packet_type,
            frame: Bytes::from(req.pkt),
        }))
        .await?;
        Ok(Response::new(Empty {}))
    }

    async fn flow_add(&self, request: Request<Flow>) -> Result<Response<Empty>, Status> {
        let flow = request.into_inner();
        match self.flow_target(&flow)? {
            Some(onu) => {
                debug!(flow_id = flow.flow_id, onu_id = flow.onu_id, "Received FlowAdd call");
                onu.send(OnuMessage::FlowUpdate(flow)).await?;
            }
            None => debug!(flow_id = flow.flow_id, "Ignoring network-side flow"),
        }
        Ok(Response::new(Empty {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OltConfig, ServerConfig};
    use crate::devices::flows;
    use crate::grpc::openolt::indication;
    use tokio_stream::StreamExt;
    use tokio_util::sync::CancellationToken;

    fn service() -> OpenoltService {
        let olt = OltDevice::new(
            &OltConfig {
                onus_per_pon: 2,
                ..Default::default()
            },
            &ServerConfig::default(),
            &CancellationToken::new(),
        );
        OpenoltService::new(Arc::new(olt))
    }

    #[tokio::test]
    async fn test_enable_twice_is_rejected() {
        let service = service();
        let mut stream = service
            .enable_indication(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first.data, Some(indication::Data::OltInd(_))));

        let err = service.enable_indication(Request::new(Empty {})).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_unknown_onu_is_not_found() {
        let service = service();
        let err = service
            .activate_onu(Request::new(Onu {
                intf_id: 0,
                onu_id: 42,
                serial_number: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);

        let err = service
            .omci_msg_out(Request::new(OmciMsg {
                intf_id: 3,
                onu_id: 1,
                pkt: vec![],
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_unclassified_packet_is_invalid() {
        let service = service();
        let err = service
            .onu_packet_out(Request::new(OnuPacket {
                intf_id: 0,
                onu_id: 1,
                port_no: 1,
                gemport_id: 1,
                pkt: vec![0u8; 20],
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_network_side_flow_is_ignored() {
        let service = service();
        let mut flow = flows::eapol_flow(0, 1);
        flow.onu_id = -1;
        assert!(service.flow_add(Request::new(flow)).await.is_ok());
    }

    #[test]
    fn test_locate_prefers_serial_number() {
        let service = service();
        let onu = Onu {
            intf_id: 0,
            onu_id: 1,
            serial_number: Some(SerialNumber::new(0, 0, 2).to_proto()),
        };
        assert_eq!(service.locate(&onu).unwrap().id(), 2);

        let unknown_serial = Onu {
            serial_number: Some(SerialNumber::new(0, 5, 5).to_proto()),
            ..onu
        };
        assert_eq!(service.locate(&unknown_serial).unwrap().id(), 1);
    }
}
