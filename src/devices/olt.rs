//! The emulated OLT.
//!
//! Owns the PON ports and, until the controller enables it, the ONU devices
//! themselves. Enabling moves every ONU into its own worker task; from then on
//! the OLT only keeps handles.

use crate::config::{OltConfig, ServerConfig};
use crate::devices::identity::SerialNumber;
use crate::devices::indications::{self, IndicationStream};
use crate::devices::messages::OnuMessage;
use crate::devices::onu::{Onu, OnuConfig, OnuHandle, OnuTransport};
use crate::devices::oper_state::OperState;
use crate::devices::pon::PonPort;
use crate::error::{SimError, SimResult};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// First ONU id on every PON port
pub const FIRST_ONU_ID: u32 = 1;

/// The emulated OLT.
#[derive(Debug)]
pub struct OltDevice {
    id: u32,
    nni_ports: u32,
    pon_ports: Vec<PonPort>,
    oper_state: watch::Sender<OperState>,
    /// Devices waiting for the enable call
    devices: Mutex<Option<Vec<Onu>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
}

impl OltDevice {
    /// Build the topology described by `olt`.
    ///
    /// Subscriber VLANs are assigned sequentially from `c_tag_init` across
    /// all PON ports. Workers are children of `cancel`.
    pub fn new(olt: &OltConfig, server: &ServerConfig, cancel: &CancellationToken) -> Self {
        let mut devices = Vec::new();
        let mut pon_ports = Vec::new();
        let mut c_tag = olt.c_tag_init;

        for pon_id in 0..olt.pon_ports {
            let mut handles = Vec::new();
            for onu_id in FIRST_ONU_ID..FIRST_ONU_ID + olt.onus_per_pon {
                let config = OnuConfig {
                    s_tag: olt.s_tag,
                    c_tag,
                    auth: olt.auth,
                    dhcp: olt.dhcp,
                    queue_capacity: server.onu_queue_capacity,
                };
                let (onu, handle) = Onu::new(olt.id, pon_id, onu_id, config);
                devices.push(onu);
                handles.push(handle);
                c_tag = c_tag.wrapping_add(1);
            }
            pon_ports.push(PonPort::new(pon_id, handles));
        }

        info!(
            olt_id = olt.id,
            nni_ports = olt.nni_ports,
            pon_ports = olt.pon_ports,
            onus_per_pon = olt.onus_per_pon,
            "Created OLT"
        );

        let (oper_state, _) = watch::channel(OperState::Down);
        Self {
            id: olt.id,
            nni_ports: olt.nni_ports,
            pon_ports,
            oper_state,
            devices: Mutex::new(Some(devices)),
            workers: Mutex::new(Vec::new()),
            cancel: cancel.child_token(),
            shutdown_timeout: server.shutdown_timeout(),
        }
    }

    /// OLT id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of NNI ports
    pub fn nni_ports(&self) -> u32 {
        self.nni_ports
    }

    /// PON ports
    pub fn pon_ports(&self) -> &[PonPort] {
        &self.pon_ports
    }

    /// Current operational state
    pub fn oper_state(&self) -> OperState {
        *self.oper_state.borrow()
    }

    /// Every ONU, by PON port then id
    pub fn onus(&self) -> impl Iterator<Item = &OnuHandle> {
        self.pon_ports.iter().flat_map(|pon| pon.onus().iter())
    }

    /// PON port by id
    pub fn pon_port(&self, pon_id: u32) -> SimResult<&PonPort> {
        self.pon_ports
            .iter()
            .find(|pon| pon.id() == pon_id)
            .ok_or(SimError::UnknownPonPort(pon_id))
    }

    /// ONU by interface and ONU id
    pub fn find_onu(&self, intf_id: u32, onu_id: u32) -> SimResult<&OnuHandle> {
        self.pon_port(intf_id)
            .ok()
            .and_then(|pon| pon.onu(onu_id))
            .ok_or(SimError::UnknownOnu { intf_id, onu_id })
    }

    /// ONU by serial number
    pub fn find_onu_by_serial(&self, serial_number: &SerialNumber) -> SimResult<&OnuHandle> {
        self.pon_ports
            .iter()
            .find_map(|pon| pon.onu_by_serial(serial_number))
            .ok_or_else(|| SimError::UnknownSerial(serial_number.to_string()))
    }

    /// Whether the controller has enabled the OLT
    pub async fn is_enabled(&self) -> bool {
        self.devices.lock().await.is_none()
    }

    /// Enable the OLT on `stream`.
    ///
    /// Starts one worker per ONU right away, then spawns the announcement:
    /// OLT indication, NNI and PON port indications, and a discovery event
    /// for every ONU, in that order. The returned task finishes once every
    /// announcement has been queued. Fails if the OLT was already enabled.
    pub async fn enable(&self, stream: IndicationStream) -> SimResult<JoinHandle<()>> {
        let devices = self
            .devices
            .lock()
            .await
            .take()
            .ok_or(SimError::AlreadyEnabled(self.id))?;

        info!(olt_id = self.id, onus = devices.len(), "Enabling OLT");
        {
            let mut workers = self.workers.lock().await;
            for onu in devices {
                let transport = OnuTransport::stream(stream.clone());
                workers.push(tokio::spawn(onu.run(transport, self.cancel.child_token())));
            }
        }

        self.oper_state.send_replace(OperState::Up);
        for pon in &self.pon_ports {
            pon.set_oper_state(OperState::Up);
        }

        let announcement = Announcement {
            olt_id: self.id,
            nni_ports: self.nni_ports,
            pon_ids: self.pon_ports.iter().map(PonPort::id).collect(),
            onus: self.onus().cloned().collect(),
        };
        let cancel = self.cancel.clone();
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!("OLT enable interrupted"),
                _ = announcement.run(stream) => {}
            }
        }))
    }

    /// Cancel every worker and wait for them to stop.
    pub async fn shutdown(&self) -> SimResult<()> {
        self.cancel.cancel();
        self.oper_state.send_replace(OperState::Down);

        let mut workers = std::mem::take(&mut *self.workers.lock().await);
        let joined = tokio::time::timeout(self.shutdown_timeout, async {
            for worker in workers.iter_mut() {
                if let Err(err) = worker.await {
                    warn!(error = %err, "ONU worker did not stop cleanly");
                }
            }
        })
        .await;

        if joined.is_err() {
            let pending = workers.iter().filter(|worker| !worker.is_finished()).count();
            for worker in &workers {
                worker.abort();
            }
            return Err(SimError::ShutdownTimeout { pending });
        }
        info!(olt_id = self.id, "OLT stopped");
        Ok(())
    }
}

/// Indications and discovery events sent on enable.
struct Announcement {
    olt_id: u32,
    nni_ports: u32,
    pon_ids: Vec<u32>,
    onus: Vec<OnuHandle>,
}

impl Announcement {
    async fn send(stream: &IndicationStream, indication: crate::grpc::openolt::Indication) {
        let kind = indications::kind(&indication);
        match stream.send(indication).await {
            Ok(()) => debug!("Sent {kind}"),
            Err(_) => error!("Failed to send {kind}: stream closed"),
        }
    }

    async fn run(self, stream: IndicationStream) {
        Self::send(&stream, indications::olt_indication(OperState::Up)).await;
        for nni_id in 0..self.nni_ports {
            let indication = indications::intf_oper_indication("nni", nni_id, OperState::Up);
            Self::send(&stream, indication).await;
        }
        for pon_id in &self.pon_ids {
            Self::send(&stream, indications::intf_indication(*pon_id, OperState::Up)).await;
            let indication = indications::intf_oper_indication("pon", *pon_id, OperState::Up);
            Self::send(&stream, indication).await;
        }

        for onu in &self.onus {
            if let Err(err) = onu.send(OnuMessage::DiscoveryIndication).await {
                error!(error = %err, "Failed to queue discovery");
            }
        }
        info!(olt_id = self.olt_id, onus = self.onus.len(), "OLT enabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::lifecycle::OnuState;
    use crate::grpc::openolt::indication;
    use tokio::sync::mpsc;

    fn olt(pon_ports: u32, onus_per_pon: u32) -> OltDevice {
        let config = OltConfig {
            pon_ports,
            onus_per_pon,
            ..Default::default()
        };
        OltDevice::new(&config, &ServerConfig::default(), &CancellationToken::new())
    }

    #[test]
    fn test_topology_and_c_tags() {
        let olt = olt(2, 3);
        assert_eq!(olt.onus().count(), 6);
        let c_tags: Vec<_> = olt.onus().map(OnuHandle::c_tag).collect();
        assert_eq!(c_tags, vec![900, 901, 902, 903, 904, 905]);
        assert!(olt.onus().all(|onu| onu.s_tag() == 900));

        let onu = olt.find_onu(1, 2).unwrap();
        assert_eq!(onu.serial_number().to_string(), "BBSM00000102");
        assert!(matches!(
            olt.find_onu(1, 9),
            Err(SimError::UnknownOnu { intf_id: 1, onu_id: 9 })
        ));
        assert!(matches!(olt.find_onu(7, 1), Err(SimError::UnknownOnu { .. })));

        let sn = SerialNumber::new(0, 0, 3);
        assert_eq!(olt.find_onu_by_serial(&sn).unwrap().id(), 3);
    }

    #[tokio::test]
    async fn test_enable_sequence() {
        let olt = olt(2, 1);
        let (tx, mut rx) = mpsc::channel(64);
        olt.enable(IndicationStream::new(tx.clone())).await.unwrap().await.unwrap();
        assert_eq!(olt.oper_state(), OperState::Up);
        assert!(olt.is_enabled().await);

        let mut kinds = Vec::new();
        for _ in 0..8 {
            let ind = rx.recv().await.unwrap().unwrap();
            kinds.push(indications::kind(&ind));
            if let Some(indication::Data::IntfOperInd(oper)) = &ind.data {
                assert_eq!(oper.oper_state, "up");
            }
        }
        assert_eq!(
            kinds,
            vec![
                "OltIndication",
                "IntfOperIndication",
                "IntfIndication",
                "IntfOperIndication",
                "IntfIndication",
                "IntfOperIndication",
                "OnuDiscIndication",
                "OnuDiscIndication",
            ]
        );

        let mut status = olt.find_onu(0, 1).unwrap().watch();
        status
            .wait_for(|s| s.internal_state == OnuState::Discovered)
            .await
            .unwrap();

        assert!(matches!(
            olt.enable(IndicationStream::new(tx)).await,
            Err(SimError::AlreadyEnabled(0))
        ));
        olt.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let olt = olt(1, 2);
        let (tx, _rx) = mpsc::channel(64);
        olt.enable(IndicationStream::new(tx)).await.unwrap();
        olt.shutdown().await.unwrap();

        for onu in olt.onus() {
            let mut status = onu.watch();
            status.wait_for(|s| !s.running).await.unwrap();
        }
        assert_eq!(olt.oper_state(), OperState::Down);
    }
}
