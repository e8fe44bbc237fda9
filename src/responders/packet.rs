//! Ethernet/IPv4/UDP frame helpers shared by the responders.
//!
//! Frames travel as raw Ethernet bytes. Upstream frames carry the subscriber
//! c-tag, downstream frames from the bulk runner may be double tagged, so every
//! parser here skips any number of 802.1Q / 802.1ad tags before looking at the
//! payload.

use crate::devices::identity::MacAddress;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::Ipv4Addr;

/// EtherType of EAPOL frames
pub const ETH_TYPE_EAPOL: u16 = 0x888e;
/// EtherType of IPv4 frames
pub const ETH_TYPE_IPV4: u16 = 0x0800;
/// C-tag TPID
pub const TPID_8021Q: u16 = 0x8100;
/// S-tag TPID
pub const TPID_8021AD: u16 = 0x88a8;
/// UDP protocol number
pub const IP_PROTO_UDP: u8 = 17;
/// DHCP server port
pub const DHCP_SERVER_PORT: u16 = 67;
/// DHCP client port
pub const DHCP_CLIENT_PORT: u16 = 68;

const ETH_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Protocols the emulated devices understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// 802.1X authentication
    Eapol,
    /// DHCP address assignment
    Dhcp,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PacketType::Eapol => "EAPOL",
            PacketType::Dhcp => "DHCP",
        })
    }
}

/// A parsed Ethernet frame with its VLAN stack removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame<'a> {
    /// Destination address
    pub dst: MacAddress,
    /// Source address
    pub src: MacAddress,
    /// VLAN ids, outermost first
    pub vlans: Vec<u16>,
    /// EtherType of the payload
    pub eth_type: u16,
    /// Bytes after the EtherType
    pub payload: &'a [u8],
}

/// Parse the Ethernet header, skipping every VLAN tag.
pub fn parse_ethernet(frame: &[u8]) -> Option<EthernetFrame<'_>> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }
    let dst = MacAddress(frame[0..6].try_into().ok()?);
    let src = MacAddress(frame[6..12].try_into().ok()?);

    let mut offset = 12;
    let mut vlans = Vec::new();
    loop {
        let eth_type = read_u16(frame, offset)?;
        if eth_type == TPID_8021Q || eth_type == TPID_8021AD {
            vlans.push(read_u16(frame, offset + 2)? & 0x0fff);
            offset += VLAN_TAG_LEN;
            continue;
        }
        return Some(EthernetFrame {
            dst,
            src,
            vlans,
            eth_type,
            payload: frame.get(offset + 2..)?,
        });
    }
}

/// Serialize an Ethernet header with `vlans` (outermost first).
///
/// The outer tag of a double-tagged frame uses the 802.1ad TPID.
pub fn ethernet_header(dst: MacAddress, src: MacAddress, vlans: &[u16], eth_type: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(ETH_HEADER_LEN + vlans.len() * VLAN_TAG_LEN);
    buf.put_slice(&dst.octets());
    buf.put_slice(&src.octets());
    for (idx, vid) in vlans.iter().enumerate() {
        let tpid = if vlans.len() > 1 && idx == 0 {
            TPID_8021AD
        } else {
            TPID_8021Q
        };
        buf.put_u16(tpid);
        buf.put_u16(vid & 0x0fff);
    }
    buf.put_u16(eth_type);
    buf
}

/// UDP datagram carried in an IPv4 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    /// IPv4 source
    pub src_ip: Ipv4Addr,
    /// IPv4 destination
    pub dst_ip: Ipv4Addr,
    /// UDP source port
    pub src_port: u16,
    /// UDP destination port
    pub dst_port: u16,
    /// UDP payload
    pub payload: &'a [u8],
}

/// Extract the UDP datagram from an IPv4 payload.
pub fn parse_udp(ip: &[u8]) -> Option<UdpDatagram<'_>> {
    let version_ihl = *ip.first()?;
    if version_ihl >> 4 != 4 {
        return None;
    }
    let header_len = usize::from(version_ihl & 0x0f) * 4;
    if ip.len() < IPV4_HEADER_LEN || header_len < IPV4_HEADER_LEN || ip[9] != IP_PROTO_UDP {
        return None;
    }
    let src_ip = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let dst_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);

    let udp = ip.get(header_len..)?;
    let udp_len = usize::from(read_u16(udp, 4)?);
    if udp_len < UDP_HEADER_LEN {
        return None;
    }
    Some(UdpDatagram {
        src_ip,
        dst_ip,
        src_port: read_u16(udp, 0)?,
        dst_port: read_u16(udp, 2)?,
        payload: udp.get(UDP_HEADER_LEN..udp_len.min(udp.len()))?,
    })
}

/// Build an IPv4 + UDP packet around `payload`; the UDP checksum is left at 0.
pub fn ipv4_udp(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> BytesMut {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;

    let mut buf = BytesMut::with_capacity(total_len);
    buf.put_u8(0x45);
    buf.put_u8(0);
    buf.put_u16(total_len as u16);
    buf.put_u16(0); // identification
    buf.put_u16(0); // flags, fragment offset
    buf.put_u8(64);
    buf.put_u8(IP_PROTO_UDP);
    buf.put_u16(0);
    buf.put_slice(&src_ip.octets());
    buf.put_slice(&dst_ip.octets());
    let checksum = ipv4_checksum(&buf[..IPV4_HEADER_LEN]);
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());

    buf.put_u16(src_port);
    buf.put_u16(dst_port);
    buf.put_u16(udp_len as u16);
    buf.put_u16(0);
    buf.put_slice(payload);
    buf
}

/// Internet checksum over an IPv4 header.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| {
            let hi = u32::from(pair[0]) << 8;
            let lo = pair.get(1).copied().map_or(0, u32::from);
            hi | lo
        })
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Decide whether a frame is EAPOL or DHCP.
pub fn classify(frame: &[u8]) -> Option<PacketType> {
    let eth = parse_ethernet(frame)?;
    match eth.eth_type {
        ETH_TYPE_EAPOL => Some(PacketType::Eapol),
        ETH_TYPE_IPV4 => {
            let udp = parse_udp(eth.payload)?;
            let ports = [udp.src_port, udp.dst_port];
            if ports.contains(&DHCP_SERVER_PORT) && ports.contains(&DHCP_CLIENT_PORT) {
                Some(PacketType::Dhcp)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Freeze a finished buffer.
pub fn finish(header: BytesMut, payload: &[u8]) -> Bytes {
    let mut buf = header;
    buf.put_slice(payload);
    buf.freeze()
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dhcp_like(vlans: &[u16], src_port: u16, dst_port: u16) -> Bytes {
        let header = ethernet_header(
            MacAddress::BROADCAST,
            MacAddress::for_onu(0, 1),
            vlans,
            ETH_TYPE_IPV4,
        );
        let ip = ipv4_udp(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::BROADCAST,
            src_port,
            dst_port,
            &[1, 2, 3],
        );
        finish(header, &ip)
    }

    #[test]
    fn test_classify_skips_vlan_tags() {
        assert_eq!(classify(&dhcp_like(&[], 68, 67)), Some(PacketType::Dhcp));
        assert_eq!(classify(&dhcp_like(&[900], 68, 67)), Some(PacketType::Dhcp));
        assert_eq!(classify(&dhcp_like(&[900, 901], 67, 68)), Some(PacketType::Dhcp));
        assert_eq!(classify(&dhcp_like(&[900], 53, 53)), None);

        let eapol = finish(
            ethernet_header(
                MacAddress::BROADCAST,
                MacAddress::for_onu(0, 1),
                &[4091],
                ETH_TYPE_EAPOL,
            ),
            &[1, 1, 0, 0],
        );
        assert_eq!(classify(&eapol), Some(PacketType::Eapol));
        assert_eq!(classify(&[0u8; 6]), None);
    }

    #[test]
    fn test_double_tag_uses_service_tpid() {
        let frame = dhcp_like(&[900, 901], 68, 67);
        assert_eq!(read_u16(&frame, 12), Some(TPID_8021AD));
        assert_eq!(read_u16(&frame, 16), Some(TPID_8021Q));

        let eth = parse_ethernet(&frame).unwrap();
        assert_eq!(eth.vlans, vec![900, 901]);
        assert_eq!(eth.eth_type, ETH_TYPE_IPV4);
    }

    #[test]
    fn test_ipv4_header_checksum_verifies() {
        let ip = ipv4_udp(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            68,
            67,
            &[0xaa; 10],
        );
        assert_eq!(ipv4_checksum(&ip[..IPV4_HEADER_LEN]), 0);

        let udp = parse_udp(&ip).unwrap();
        assert_eq!(udp.src_port, 68);
        assert_eq!(udp.payload, &[0xaa; 10]);
    }
}
