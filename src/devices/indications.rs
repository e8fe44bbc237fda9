//! Indication emitter.
//!
//! Turns device and port events into `openolt::Indication` messages and writes
//! them to the controller stream. The stream has a single writer: every device
//! holds a clone of one bounded sender that feeds the gRPC response stream, so
//! each indication is framed as one message regardless of how many devices
//! send concurrently.

use crate::devices::identity::SerialNumber;
use crate::devices::oper_state::OperState;
use crate::grpc::openolt::{
    self, alarm_indication, indication, AlarmIndication, DyingGaspIndication, Indication,
    IntfIndication, IntfOperIndication, OltIndication, OmciIndication, OnuDiscIndication,
    OnuIndication, PacketIndication,
};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tonic::Status;

/// Item type of the `EnableIndication` response stream
pub type IndicationItem = Result<Indication, Status>;

/// The receiving end of the stream has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("indication stream closed")]
pub struct StreamClosed;

/// Shared writer for the controller's indication stream.
#[derive(Debug, Clone)]
pub struct IndicationStream {
    tx: mpsc::Sender<IndicationItem>,
}

impl IndicationStream {
    /// Wrap the sending half of the response stream
    pub fn new(tx: mpsc::Sender<IndicationItem>) -> Self {
        Self { tx }
    }

    /// Queue one indication, waiting while the stream buffer is full.
    pub async fn send(&self, indication: Indication) -> Result<(), StreamClosed> {
        self.tx.send(Ok(indication)).await.map_err(|_| StreamClosed)
    }

    /// Whether the controller has dropped the stream
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn wrap(data: indication::Data) -> Indication {
    Indication { data: Some(data) }
}

/// OLT-level state
pub fn olt_indication(oper_state: OperState) -> Indication {
    wrap(indication::Data::OltInd(OltIndication {
        oper_state: oper_state.to_string(),
    }))
}

/// Interface (PON) state
pub fn intf_indication(intf_id: u32, oper_state: OperState) -> Indication {
    wrap(indication::Data::IntfInd(IntfIndication {
        intf_id,
        oper_state: oper_state.to_string(),
    }))
}

/// Interface operational state, `kind` is `"nni"` or `"pon"`
pub fn intf_oper_indication(kind: &str, intf_id: u32, oper_state: OperState) -> Indication {
    wrap(indication::Data::IntfOperInd(IntfOperIndication {
        r#type: kind.to_string(),
        intf_id,
        oper_state: oper_state.to_string(),
    }))
}

/// An ONU appeared on a PON port
pub fn onu_disc_indication(intf_id: u32, serial_number: &SerialNumber) -> Indication {
    wrap(indication::Data::OnuDiscInd(OnuDiscIndication {
        intf_id,
        serial_number: Some(serial_number.to_proto()),
    }))
}

/// ONU operational and administrative state
pub fn onu_indication(
    intf_id: u32,
    onu_id: u32,
    oper_state: OperState,
    admin_state: OperState,
    serial_number: &SerialNumber,
) -> Indication {
    wrap(indication::Data::OnuInd(OnuIndication {
        intf_id,
        onu_id,
        oper_state: oper_state.to_string(),
        admin_state: admin_state.to_string(),
        serial_number: Some(serial_number.to_proto()),
    }))
}

/// OMCI response from an ONU, raw bytes
pub fn omci_indication(intf_id: u32, onu_id: u32, pkt: Bytes) -> Indication {
    wrap(indication::Data::OmciInd(OmciIndication {
        intf_id,
        onu_id,
        pkt: pkt.to_vec(),
    }))
}

/// Upstream frame from an ONU
pub fn packet_indication(
    intf_id: u32,
    onu_id: u32,
    gemport_id: u32,
    port_no: u32,
    pkt: Bytes,
) -> Indication {
    wrap(indication::Data::PktInd(PacketIndication {
        intf_type: "pon".to_string(),
        intf_id,
        onu_id,
        uni_id: 0,
        gemport_id,
        flow_id: 0,
        port_no,
        cookie: 0,
        pkt: pkt.to_vec(),
    }))
}

/// Dying-gasp alarm
pub fn dying_gasp_indication(intf_id: u32, onu_id: u32) -> Indication {
    wrap(indication::Data::AlarmInd(AlarmIndication {
        data: Some(alarm_indication::Data::DyingGaspInd(DyingGaspIndication {
            intf_id,
            onu_id,
            status: "on".to_string(),
        })),
    }))
}

/// Short name of an indication, for logs
pub fn kind(ind: &openolt::Indication) -> &'static str {
    match ind.data {
        Some(indication::Data::OltInd(_)) => "OltIndication",
        Some(indication::Data::IntfInd(_)) => "IntfIndication",
        Some(indication::Data::IntfOperInd(_)) => "IntfOperIndication",
        Some(indication::Data::OnuDiscInd(_)) => "OnuDiscIndication",
        Some(indication::Data::OnuInd(_)) => "OnuIndication",
        Some(indication::Data::OmciInd(_)) => "OmciIndication",
        Some(indication::Data::PktInd(_)) => "PacketIndication",
        Some(indication::Data::AlarmInd(_)) => "AlarmIndication",
        None => "EmptyIndication",
    }
}
