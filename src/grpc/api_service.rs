//! Administrative `Simulator` service.
//!
//! Device views are built from the snapshots each ONU worker publishes, so a
//! slow or stopped worker never blocks the API.

use crate::devices::messages::OnuMessage;
use crate::devices::olt::OltDevice;
use crate::devices::onu::OnuHandle;
use crate::devices::oper_state::OperState;
use crate::error::{SimError, SimResult};
use crate::grpc::admin::{
    simulator_server::Simulator, AckResponse, Empty, OltStatus, OnuList, OnuRequest, OnuStatus,
    PortStatus, VersionNumber,
};
use std::sync::Arc;
use tonic::{Code, Request, Response, Status};
use tracing::info;

/// `Simulator` service backed by one emulated OLT.
#[derive(Debug, Clone)]
pub struct ApiService {
    olt: Arc<OltDevice>,
}

impl ApiService {
    /// Serve `olt`
    pub fn new(olt: Arc<OltDevice>) -> Self {
        Self { olt }
    }

    fn onu_by_serial(&self, serial_number: &str) -> SimResult<&OnuHandle> {
        self.olt
            .onus()
            .find(|onu| onu.serial_number().to_string().eq_ignore_ascii_case(serial_number))
            .ok_or_else(|| SimError::UnknownSerial(serial_number.to_string()))
    }
}

fn onu_status(onu: &OnuHandle) -> OnuStatus {
    let snapshot = onu.snapshot();
    OnuStatus {
        id: onu.id(),
        pon_port_id: onu.pon_port_id(),
        serial_number: onu.serial_number().to_string(),
        hw_address: onu.hw_address().to_string(),
        oper_state: snapshot.oper_state.to_string(),
        internal_state: snapshot.internal_state.to_string(),
        port_no: snapshot.port_no,
        s_tag: u32::from(onu.s_tag()),
        c_tag: u32::from(onu.c_tag()),
    }
}

#[tonic::async_trait]
impl Simulator for ApiService {
    async fn version(&self, _request: Request<Empty>) -> Result<Response<VersionNumber>, Status> {
        Ok(Response::new(VersionNumber {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    async fn get_olt(&self, _request: Request<Empty>) -> Result<Response<OltStatus>, Status> {
        let oper_state = self.olt.oper_state();
        // NNI ports follow the OLT
        let nni_ports = (0..self.olt.nni_ports())
            .map(|id| PortStatus {
                id,
                kind: "nni".to_string(),
                oper_state: oper_state.to_string(),
            })
            .collect();
        let pon_ports = self
            .olt
            .pon_ports()
            .iter()
            .map(|pon| PortStatus {
                id: pon.id(),
                kind: "pon".to_string(),
                oper_state: pon.oper_state().to_string(),
            })
            .collect();

        Ok(Response::new(OltStatus {
            id: self.olt.id(),
            oper_state: oper_state.to_string(),
            nni_ports,
            pon_ports,
        }))
    }

    async fn get_onus(&self, _request: Request<Empty>) -> Result<Response<OnuList>, Status> {
        let items = self.olt.onus().map(onu_status).collect();
        Ok(Response::new(OnuList { items }))
    }

    async fn get_onu(&self, request: Request<OnuRequest>) -> Result<Response<OnuStatus>, Status> {
        let req = request.into_inner();
        let onu = self.onu_by_serial(&req.serial_number)?;
        Ok(Response::new(onu_status(onu)))
    }

    /// Send a dying gasp, then deactivate the ONU
    async fn shutdown_onu(
        &self,
        request: Request<OnuRequest>,
    ) -> Result<Response<AckResponse>, Status> {
        let req = request.into_inner();
        let onu = self.onu_by_serial(&req.serial_number)?;
        if self.olt.oper_state() != OperState::Up {
            return Err(SimError::NotEnabled(self.olt.id()).into());
        }

        info!(
            intf_id = onu.pon_port_id(),
            onu_id = onu.id(),
            onu_sn = %onu.serial_number(),
            "Shutting down ONU"
        );
        onu.send(OnuMessage::DyingGasp).await?;
        onu.send(OnuMessage::Deactivate).await?;

        Ok(Response::new(AckResponse {
            status_code: Code::Ok as i32,
            message: format!("Shutdown request received for ONU {}", onu.serial_number()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OltConfig, ServerConfig};
    use crate::devices::indications::IndicationStream;
    use crate::devices::lifecycle::OnuState;
    use crate::grpc::openolt::{alarm_indication, indication};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn olt() -> Arc<OltDevice> {
        let config = OltConfig {
            nni_ports: 2,
            pon_ports: 2,
            onus_per_pon: 2,
            ..Default::default()
        };
        Arc::new(OltDevice::new(&config, &ServerConfig::default(), &CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_get_olt_before_enable() {
        let api = ApiService::new(olt());
        let status = api.get_olt(Request::new(Empty {})).await.unwrap().into_inner();
        assert_eq!(status.oper_state, "down");
        assert_eq!(status.nni_ports.len(), 2);
        assert_eq!(status.pon_ports.len(), 2);
        assert!(status
            .pon_ports
            .iter()
            .all(|port| port.kind == "pon" && port.oper_state == "down"));
    }

    #[tokio::test]
    async fn test_get_onus() {
        let api = ApiService::new(olt());
        let list = api.get_onus(Request::new(Empty {})).await.unwrap().into_inner();
        assert_eq!(list.items.len(), 4);

        let last = &list.items[3];
        assert_eq!(last.serial_number, "BBSM00000102");
        assert_eq!(last.hw_address, "2e:60:70:13:01:02");
        assert_eq!(last.internal_state, "created");
        assert_eq!(last.oper_state, "down");
        assert_eq!(last.c_tag, 903);
        assert_eq!(last.s_tag, 900);
    }

    #[tokio::test]
    async fn test_get_unknown_onu() {
        let api = ApiService::new(olt());
        let err = api
            .get_onu(Request::new(OnuRequest {
                serial_number: "BBSM000000ff".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_shutdown_requires_enabled_olt() {
        let api = ApiService::new(olt());
        let err = api
            .shutdown_onu(Request::new(OnuRequest {
                serial_number: "BBSM00000001".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_shutdown_sends_dying_gasp() {
        let olt = olt();
        let api = ApiService::new(olt.clone());
        let (tx, mut rx) = mpsc::channel(64);
        olt.enable(IndicationStream::new(tx)).await.unwrap().await.unwrap();

        let onu = olt.find_onu(0, 1).unwrap();
        onu.watch()
            .wait_for(|s| s.internal_state == OnuState::Discovered)
            .await
            .unwrap();

        let ack = api
            .shutdown_onu(Request::new(OnuRequest {
                serial_number: "BBSM00000001".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(ack.status_code, 0);

        loop {
            let ind = rx.recv().await.unwrap().unwrap();
            if let Some(indication::Data::AlarmInd(alarm)) = ind.data {
                match alarm.data {
                    Some(alarm_indication::Data::DyingGaspInd(gasp)) => {
                        assert_eq!((gasp.intf_id, gasp.onu_id), (0, 1));
                        break;
                    }
                    None => panic!("empty alarm"),
                }
            }
        }
        olt.shutdown().await.unwrap();
    }
}
