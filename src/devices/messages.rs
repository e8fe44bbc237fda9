//! Events consumed by a device's dispatch loop.
//!
//! Everything that happens to an ONU arrives as an [`OnuMessage`] on its
//! inbound queue: controller commands translated by the OLT, indications the
//! device must emit, and internal events posted by lifecycle entry callbacks.
//! Each variant carries its own immutable payload, so the dispatch loop is an
//! exhaustive `match` with no runtime type checks.

use crate::devices::oper_state::OperState;
use crate::grpc::openolt;
use crate::responders::packet::PacketType;
use bytes::Bytes;

/// A frame moving between the controller and an emulated ONU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMessage {
    /// Protocol the frame belongs to
    pub packet_type: PacketType,
    /// Raw Ethernet frame
    pub frame: Bytes,
}

/// Inbound event for a single ONU.
#[derive(Debug, Clone, PartialEq)]
pub enum OnuMessage {
    /// Emit the discovery indication for this ONU
    DiscoveryIndication,
    /// Controller activated the ONU
    Activate,
    /// Controller deactivated the ONU
    Deactivate,
    /// Emit an ONU up/down indication
    OnuIndication(OperState),
    /// OMCI request from the controller, hex-encoded
    Omci(Bytes),
    /// Controller installed a forwarding rule
    FlowUpdate(openolt::Flow),
    /// Begin the EAPOL exchange
    StartEapol,
    /// Begin the DHCP exchange
    StartDhcp,
    /// Frame sent by the controller towards the ONU
    PacketOut(PacketMessage),
    /// Frame received from a remote ONU (bulk-runner mode)
    PacketIn(PacketMessage),
    /// Emit a dying-gasp alarm
    DyingGasp,
    /// OMCI response from a remote ONU, raw bytes (bulk-runner mode)
    OmciIndication(Bytes),
    /// Begin the MIB reset/upload session (bulk-runner mode)
    StartOmci,
    /// Install the EAPOL flow on the controller (bulk-runner mode)
    SendEapolFlow,
    /// Install the DHCP flow on the controller (bulk-runner mode)
    SendDhcpFlow,
}

impl OnuMessage {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            OnuMessage::DiscoveryIndication => "OnuDiscIndication",
            OnuMessage::Activate => "Activate",
            OnuMessage::Deactivate => "Deactivate",
            OnuMessage::OnuIndication(_) => "OnuIndication",
            OnuMessage::Omci(_) => "OMCI",
            OnuMessage::FlowUpdate(_) => "FlowUpdate",
            OnuMessage::StartEapol => "StartEAPOL",
            OnuMessage::StartDhcp => "StartDHCP",
            OnuMessage::PacketOut(_) => "OnuPacketOut",
            OnuMessage::PacketIn(_) => "OnuPacketIn",
            OnuMessage::DyingGasp => "DyingGaspIndication",
            OnuMessage::OmciIndication(_) => "OmciIndication",
            OnuMessage::StartOmci => "StartOmci",
            OnuMessage::SendEapolFlow => "SendEapolFlow",
            OnuMessage::SendDhcpFlow => "SendDhcpFlow",
        }
    }
}
