//! Stable device identity derived from topology coordinates.
//!
//! Every emulated ONU gets a serial number and hardware address computed from
//! `(olt id, pon port id, onu id)`, so restarting the emulator (or mirroring its
//! topology in the bulk runner) always yields the same identities.

use crate::grpc::openolt;
use std::fmt;

/// Vendor id carried by every emulated ONU serial number.
pub const VENDOR_ID: [u8; 4] = *b"BBSM";

/// Fixed OUI prefix of emulated ONU MAC addresses.
const HW_ADDRESS_PREFIX: [u8; 4] = [0x2e, 0x60, 0x70, 0x13];

/// ONU serial number: 4-byte vendor id plus 4 vendor-specific bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SerialNumber {
    /// ASCII vendor id
    pub vendor_id: [u8; 4],
    /// Vendor-specific part
    pub vendor_specific: [u8; 4],
}

impl SerialNumber {
    /// Derive the serial number of ONU `onu_id` on PON `pon_id` of OLT `olt_id`.
    pub fn new(olt_id: u32, pon_id: u32, onu_id: u32) -> Self {
        Self {
            vendor_id: VENDOR_ID,
            vendor_specific: [0, (olt_id % 256) as u8, pon_id as u8, onu_id as u8],
        }
    }

    /// Protobuf representation
    pub fn to_proto(&self) -> openolt::SerialNumber {
        openolt::SerialNumber {
            vendor_id: self.vendor_id.to_vec(),
            vendor_specific: self.vendor_specific.to_vec(),
        }
    }

    /// Parse the protobuf representation; `None` if either part is not 4 bytes.
    pub fn from_proto(sn: &openolt::SerialNumber) -> Option<Self> {
        Some(Self {
            vendor_id: sn.vendor_id.as_slice().try_into().ok()?,
            vendor_specific: sn.vendor_specific.as_slice().try_into().ok()?,
        })
    }
}

impl fmt::Display for SerialNumber {
    /// Vendor id as text followed by the vendor-specific bytes in hex,
    /// e.g. `BBSM00000205`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            String::from_utf8_lossy(&self.vendor_id),
            hex::encode(self.vendor_specific)
        )
    }
}

/// 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Broadcast address
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    /// Derive the hardware address of ONU `onu_id` on PON `pon_id`.
    pub fn for_onu(pon_id: u32, onu_id: u32) -> Self {
        let [a, b, c, d] = HW_ADDRESS_PREFIX;
        MacAddress([a, b, c, d, pon_id as u8, onu_id as u8])
    }

    /// Raw octets
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Identity fields attached to every log line and error about a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnuIdentity {
    /// ONU id, unique within its PON port
    pub onu_id: u32,
    /// Owning PON port id
    pub pon_port_id: u32,
    /// Serial number
    pub serial_number: SerialNumber,
}

impl fmt::Display for OnuIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "intf_id={} onu_id={} onu_sn={}",
            self.pon_port_id, self.onu_id, self.serial_number
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_number_derivation() {
        let sn = SerialNumber::new(0, 2, 5);
        assert_eq!(sn.vendor_id, *b"BBSM");
        assert_eq!(sn.vendor_specific, [0, 0, 2, 5]);
        assert_eq!(sn.to_string(), "BBSM00000205");
    }

    #[test]
    fn test_serial_number_wraps_olt_id() {
        let sn = SerialNumber::new(257, 0, 1);
        assert_eq!(sn.vendor_specific, [0, 1, 0, 1]);
    }

    #[test]
    fn test_serial_number_proto_roundtrip() {
        let sn = SerialNumber::new(1, 3, 7);
        assert_eq!(SerialNumber::from_proto(&sn.to_proto()), Some(sn));

        let short = openolt::SerialNumber {
            vendor_id: b"BBS".to_vec(),
            vendor_specific: vec![0; 4],
        };
        assert_eq!(SerialNumber::from_proto(&short), None);
    }

    #[test]
    fn test_hw_address() {
        let mac = MacAddress::for_onu(2, 5);
        assert_eq!(mac.octets(), [0x2e, 0x60, 0x70, 0x13, 2, 5]);
        assert_eq!(mac.to_string(), "2e:60:70:13:02:05");
    }
}
