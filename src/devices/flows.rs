//! Flow classification and bulk-runner flow construction.
//!
//! Controller-installed forwarding rules tell an ONU which protocol phase it
//! may enter next: the EAPOL trap flow (EtherType 0x888e on the reserved VLAN
//! 4091) opens authentication, the DHCP trap flow (IPv4 UDP 68 -> 67) opens
//! address assignment. Only the first UNI is supported.

use crate::grpc::openolt::{Action, Classifier, Flow};
use crate::omci::GEM_PORT_ID;
use crate::responders::packet::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT, ETH_TYPE_EAPOL, ETH_TYPE_IPV4};

/// Outer VLAN of the EAPOL trap flow
pub const EAPOL_VLAN: u32 = 4091;
/// Priority of the flows pushed by the bulk runner
pub const FLOW_PRIORITY: i32 = 100;
/// Flow type of the flows pushed by the bulk runner
pub const FLOW_TYPE_DOWNSTREAM: &str = "downstream";

/// What a forwarding rule means to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowClass {
    /// Targets a UNI other than the first one
    OtherUni,
    /// EAPOL trap flow
    Eapol {
        /// Port number carried by the flow
        port_no: u32,
    },
    /// DHCP trap flow
    Dhcp,
    /// Any other rule
    Other,
}

/// Classify a forwarding rule.
pub fn classify(flow: &Flow) -> FlowClass {
    if flow.uni_id != 0 {
        return FlowClass::OtherUni;
    }
    let Some(classifier) = flow.classifier.as_ref() else {
        return FlowClass::Other;
    };

    if classifier.eth_type == u32::from(ETH_TYPE_EAPOL) && classifier.o_vid == EAPOL_VLAN {
        FlowClass::Eapol {
            port_no: flow.port_no,
        }
    } else if classifier.eth_type == u32::from(ETH_TYPE_IPV4)
        && classifier.src_port == u32::from(DHCP_CLIENT_PORT)
        && classifier.dst_port == u32::from(DHCP_SERVER_PORT)
    {
        FlowClass::Dhcp
    } else {
        FlowClass::Other
    }
}

fn downstream_flow(pon_port_id: u32, onu_id: u32, classifier: Classifier) -> Flow {
    Flow {
        access_intf_id: pon_port_id as i32,
        onu_id: onu_id as i32,
        uni_id: 0,
        flow_id: onu_id,
        flow_type: FLOW_TYPE_DOWNSTREAM.to_string(),
        alloc_id: 0,
        network_intf_id: 0,
        gemport_id: i32::from(GEM_PORT_ID),
        classifier: Some(classifier),
        action: Some(Action::default()),
        priority: FLOW_PRIORITY,
        cookie: u64::from(onu_id),
        // maps packet indications back to the ONU
        port_no: onu_id,
    }
}

/// EAPOL trap flow for ONU `onu_id` on PON `pon_port_id`
pub fn eapol_flow(pon_port_id: u32, onu_id: u32) -> Flow {
    downstream_flow(
        pon_port_id,
        onu_id,
        Classifier {
            eth_type: u32::from(ETH_TYPE_EAPOL),
            o_vid: EAPOL_VLAN,
            ..Default::default()
        },
    )
}

/// DHCP trap flow for ONU `onu_id` on PON `pon_port_id`
pub fn dhcp_flow(pon_port_id: u32, onu_id: u32) -> Flow {
    downstream_flow(
        pon_port_id,
        onu_id,
        Classifier {
            eth_type: u32::from(ETH_TYPE_IPV4),
            src_port: u32::from(DHCP_CLIENT_PORT),
            dst_port: u32::from(DHCP_SERVER_PORT),
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_built_flows() {
        assert_eq!(classify(&eapol_flow(2, 5)), FlowClass::Eapol { port_no: 5 });
        assert_eq!(classify(&dhcp_flow(2, 5)), FlowClass::Dhcp);
    }

    #[test]
    fn test_classify_requires_every_field() {
        let mut eapol_wrong_vlan = eapol_flow(0, 1);
        if let Some(c) = eapol_wrong_vlan.classifier.as_mut() {
            c.o_vid = 900;
        }
        assert_eq!(classify(&eapol_wrong_vlan), FlowClass::Other);

        let mut dhcp_reversed = dhcp_flow(0, 1);
        if let Some(c) = dhcp_reversed.classifier.as_mut() {
            c.src_port = 67;
            c.dst_port = 68;
        }
        assert_eq!(classify(&dhcp_reversed), FlowClass::Other);

        let no_classifier = Flow::default();
        assert_eq!(classify(&no_classifier), FlowClass::Other);
    }

    #[test]
    fn test_other_uni_ignored() {
        let mut flow = eapol_flow(0, 1);
        flow.uni_id = 1;
        assert_eq!(classify(&flow), FlowClass::OtherUni);
    }

    #[test]
    fn test_bulk_flow_fields() {
        let flow = dhcp_flow(3, 7);
        assert_eq!(flow.access_intf_id, 3);
        assert_eq!(flow.onu_id, 7);
        assert_eq!(flow.flow_id, 7);
        assert_eq!(flow.cookie, 7);
        assert_eq!(flow.port_no, 7);
        assert_eq!(flow.priority, 100);
        assert_eq!(flow.gemport_id, 1);
        assert_eq!(flow.flow_type, "downstream");
    }
}
