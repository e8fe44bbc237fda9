//! Bulk test runner.
//!
//! Connects to a running emulator as its controller and pushes every ONU
//! through OMCI provisioning, EAPOL and DHCP as fast as the emulator allows.
//! The runner mirrors the remote topology locally, deriving the same
//! identities and VLANs, and plays the controller side of every exchange:
//!
//! ```text
//! OnuDiscIndication     -> ActivateOnu
//! OnuIndication (up)    -> start the OMCI session
//! OmciIndication        -> next OMCI request, then the EAPOL flow
//! PacketIndication      -> authenticator / DHCP server reply, then the DHCP flow
//! ```
//!
//! An ONU is done when its DHCP exchange completes.

use crate::config::SimConfig;
use crate::devices::controller::Controller;
use crate::devices::identity::SerialNumber;
use crate::devices::messages::{OnuMessage, PacketMessage};
use crate::devices::olt::FIRST_ONU_ID;
use crate::devices::onu::{Onu, OnuConfig, OnuHandle, OnuTransport};
use crate::error::{SimError, SimResult};
use crate::grpc::openolt::{self, indication, Indication};
use crate::grpc::OpenoltClient;
use crate::responders::packet;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, error, info, warn};

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbrReport {
    /// ONUs that completed DHCP
    pub completed: usize,
    /// ONUs driven
    pub total: usize,
    /// Time from enable to the last completion or the timeout
    pub elapsed: Duration,
}

impl BbrReport {
    /// Whether every ONU completed
    pub fn is_complete(&self) -> bool {
        self.completed == self.total
    }
}

impl fmt::Display for BbrReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ONUs completed in {:.3}s",
            self.completed,
            self.total,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Local mirror of the remote ONUs.
#[derive(Debug, Default)]
struct Mirror {
    by_id: HashMap<(u32, u32), OnuHandle>,
    by_serial: HashMap<SerialNumber, OnuHandle>,
}

impl Mirror {
    fn insert(&mut self, handle: OnuHandle) {
        self.by_serial.insert(handle.serial_number(), handle.clone());
        self.by_id.insert((handle.pon_port_id(), handle.id()), handle);
    }

    fn get(&self, intf_id: u32, onu_id: u32) -> SimResult<&OnuHandle> {
        self.by_id
            .get(&(intf_id, onu_id))
            .ok_or(SimError::UnknownOnu { intf_id, onu_id })
    }

    fn get_by_serial(&self, serial_number: &SerialNumber) -> SimResult<&OnuHandle> {
        self.by_serial
            .get(serial_number)
            .ok_or_else(|| SimError::UnknownSerial(serial_number.to_string()))
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

/// Drive the emulator at `config.bbr.olt_address` until every ONU completes,
/// the timeout elapses or `cancel` fires.
pub async fn run(config: &SimConfig, cancel: CancellationToken) -> SimResult<BbrReport> {
    info!(address = %config.bbr.olt_address, "Connecting to OLT");
    let client = OpenoltClient::connect(config.bbr.olt_address.clone()).await?;
    run_with_client(config, client, cancel).await
}

/// [`run`] on an established connection.
pub async fn run_with_client(
    config: &SimConfig,
    client: OpenoltClient<Channel>,
    cancel: CancellationToken,
) -> SimResult<BbrReport> {
    let cancel = cancel.child_token();
    let controller: Arc<dyn Controller> = Arc::new(client.clone());

    let (mirror, done, workers) = spawn_mirror(config, controller, &cancel);
    let mirror = Arc::new(mirror);
    let total = mirror.len();
    info!(onus = total, "Created mirror ONUs");

    let mut stream_client = client.clone();
    let indications = stream_client
        .enable_indication(openolt::Empty {})
        .await?
        .into_inner();
    let started = Instant::now();

    let router = tokio::spawn(route_indications(indications, client, mirror, cancel.clone()));
    let completed = wait_for_completion(done, config.bbr.timeout(), &cancel).await;
    let report = BbrReport {
        completed,
        total,
        elapsed: started.elapsed(),
    };

    cancel.cancel();
    router.abort();
    for worker in workers {
        if let Err(err) = worker.await {
            warn!(error = %err, "Mirror ONU worker did not stop cleanly");
        }
    }

    if report.is_complete() {
        info!(%report, "Bulk run finished");
    } else {
        warn!(%report, "Bulk run finished with incomplete ONUs");
    }
    Ok(report)
}

type Spawned = (Mirror, Vec<oneshot::Receiver<()>>, Vec<JoinHandle<()>>);

fn spawn_mirror(
    config: &SimConfig,
    controller: Arc<dyn Controller>,
    cancel: &CancellationToken,
) -> Spawned {
    let mut mirror = Mirror::default();
    let mut done = Vec::new();
    let mut workers = Vec::new();
    let mut index = 0;

    for pon_id in 0..config.olt.pon_ports {
        for onu_id in FIRST_ONU_ID..FIRST_ONU_ID + config.olt.onus_per_pon {
            let onu_config = OnuConfig {
                s_tag: config.olt.s_tag,
                c_tag: config.c_tag_for(index),
                auth: false,
                dhcp: false,
                queue_capacity: config.server.onu_queue_capacity,
            };
            index += 1;

            let (mut onu, handle) = Onu::new(config.olt.id, pon_id, onu_id, onu_config);
            done.push(onu.done_signal());
            let transport = OnuTransport::controller(controller.clone());
            workers.push(tokio::spawn(onu.run(transport, cancel.child_token())));
            mirror.insert(handle);
        }
    }
    (mirror, done, workers)
}

async fn wait_for_completion(
    done: Vec<oneshot::Receiver<()>>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> usize {
    let mut pending: FuturesUnordered<_> = done.into_iter().collect();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut completed = 0;
    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!(completed, remaining = pending.len(), "Timed out waiting for ONUs");
                break;
            }
            _ = cancel.cancelled() => break,
            next = pending.next() => match next {
                Some(Ok(())) => {
                    completed += 1;
                    debug!(completed, "ONU completed");
                }
                // the worker stopped without completing
                Some(Err(_)) => {}
                None => break,
            },
        }
    }
    completed
}

async fn route_indications(
    mut indications: tonic::Streaming<Indication>,
    client: OpenoltClient<Channel>,
    mirror: Arc<Mirror>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = indications.message() => next,
        };
        match next {
            Ok(Some(indication)) => {
                if let Err(err) = route(indication, &client, &mirror).await {
                    error!(error = %err, "Failed to handle indication");
                }
            }
            Ok(None) => {
                info!("Indication stream closed");
                break;
            }
            Err(status) => {
                error!(error = %status, "Indication stream failed");
                break;
            }
        }
    }
}

async fn route(
    indication: Indication,
    client: &OpenoltClient<Channel>,
    mirror: &Mirror,
) -> SimResult<()> {
    match indication.data {
        Some(indication::Data::OnuDiscInd(disc)) => {
            let serial_number = disc
                .serial_number
                .as_ref()
                .and_then(SerialNumber::from_proto)
                .ok_or_else(|| {
                    SimError::InvalidPacket("discovery without serial number".to_string())
                })?;
            let onu = mirror.get_by_serial(&serial_number)?;
            debug!(intf_id = disc.intf_id, onu_sn = %serial_number, "Activating ONU");
            client
                .clone()
                .activate_onu(openolt::Onu {
                    intf_id: onu.pon_port_id(),
                    onu_id: onu.id(),
                    serial_number: disc.serial_number,
                })
                .await?;
        }
        Some(indication::Data::OnuInd(ind)) if ind.oper_state == "up" => {
            mirror.get(ind.intf_id, ind.onu_id)?.send(OnuMessage::StartOmci).await?;
        }
        Some(indication::Data::OmciInd(omci)) => {
            mirror
                .get(omci.intf_id, omci.onu_id)?
                .send(OnuMessage::OmciIndication(Bytes::from(omci.pkt)))
                .await?;
        }
        Some(indication::Data::PktInd(pkt)) => {
            let onu = mirror.get(pkt.intf_id, pkt.onu_id)?;
            let packet_type = packet::classify(&pkt.pkt)
                .ok_or_else(|| {
                    SimError::InvalidPacket(format!(
                        "unsupported packet from {}",
                        onu.serial_number()
                    ))
                })?;
            onu.send(OnuMessage::PacketIn(PacketMessage {
                packet_type,
                frame: Bytes::from(pkt.pkt),
            }))
            .await?;
        }
        other => debug!(indication = ?other, "Ignoring indication"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_display() {
        let report = BbrReport {
            completed: 3,
            total: 4,
            elapsed: Duration::from_millis(1500),
        };
        assert!(!report.is_complete());
        assert_eq!(report.to_string(), "3/4 ONUs completed in 1.500s");
    }

    #[tokio::test]
    async fn test_completion_counts_signals() {
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let (_tx3, rx3) = oneshot::channel::<()>();
        tx1.send(()).unwrap();
        drop(tx2);

        let cancel = CancellationToken::new();
        let completed =
            wait_for_completion(vec![rx1, rx2, rx3], Duration::from_millis(50), &cancel).await;
        assert_eq!(completed, 1);
    }

    #[test]
    fn test_mirror_lookup() {
        let mut mirror = Mirror::default();
        let (_, handle) = Onu::new(0, 1, 2, OnuConfig::default());
        mirror.insert(handle);

        assert_eq!(mirror.get(1, 2).unwrap().id(), 2);
        assert!(matches!(mirror.get(0, 2), Err(SimError::UnknownOnu { .. })));
        let sn = SerialNumber::new(0, 1, 2);
        assert_eq!(mirror.get_by_serial(&sn).unwrap().pon_port_id(), 1);
    }
}
