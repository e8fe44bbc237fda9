//! DHCP exchange, client and server roles.
//!
//! The emulated ONU is the client: Discover, then Request for the offered
//! address, then Ack (or Nak). Client frames carry the subscriber c-tag. The
//! bulk runner is the server and answers double tagged (s-tag, c-tag), the way
//! traffic arrives from the network side.

use crate::devices::identity::MacAddress;
use crate::devices::lifecycle::OnuEvent;
use crate::responders::packet::{self, DHCP_CLIENT_PORT, DHCP_SERVER_PORT, ETH_TYPE_IPV4};
use crate::responders::{Exchange, ResponderError};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

const PROTOCOL: &str = "DHCP";

/// Address the bulk-runner server answers from
pub const SERVER_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 255, 255, 254);
/// Hardware address of the bulk-runner server
pub const SERVER_HW_ADDRESS: MacAddress = MacAddress([0x2e, 0x60, 0x70, 0x00, 0x00, 0x02]);
/// Lease handed out by the server, in seconds
pub const LEASE_TIME_SECS: u32 = 3600;

const BOOTP_REQUEST: u8 = 1;
const BOOTP_REPLY: u8 = 2;
const BOOTP_LEN: usize = 236;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const FLAG_BROADCAST: u16 = 0x8000;

const OPT_SUBNET_MASK: u8 = 1;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PAD: u8 = 0;
const OPT_END: u8 = 255;

/// DHCP message types used by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMessageType {
    /// Client looks for servers
    Discover,
    /// Server offers an address
    Offer,
    /// Client requests the offered address
    Request,
    /// Server confirms
    Ack,
    /// Server refuses
    Nak,
}

impl DhcpMessageType {
    fn code(self) -> u8 {
        match self {
            DhcpMessageType::Discover => 1,
            DhcpMessageType::Offer => 2,
            DhcpMessageType::Request => 3,
            DhcpMessageType::Ack => 5,
            DhcpMessageType::Nak => 6,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DhcpMessageType::Discover),
            2 => Some(DhcpMessageType::Offer),
            3 => Some(DhcpMessageType::Request),
            5 => Some(DhcpMessageType::Ack),
            6 => Some(DhcpMessageType::Nak),
            _ => None,
        }
    }
}

/// The fields of a DHCP message the responders look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    /// Message type option
    pub message_type: DhcpMessageType,
    /// Transaction id
    pub xid: u32,
    /// Client hardware address
    pub chaddr: MacAddress,
    /// Offered / assigned address
    pub yiaddr: Ipv4Addr,
    /// Server identifier option
    pub server_id: Option<Ipv4Addr>,
    /// Requested address option
    pub requested_ip: Option<Ipv4Addr>,
    /// VLAN ids of the carrying frame, outermost first
    pub vlans: Vec<u16>,
}

fn malformed(reason: &'static str) -> ResponderError {
    ResponderError::Malformed {
        protocol: PROTOCOL,
        reason,
    }
}

fn unexpected(message_type: DhcpMessageType, role: &str) -> ResponderError {
    ResponderError::Unexpected {
        protocol: PROTOCOL,
        message: format!("{message_type:?} received by {role}"),
    }
}

fn ipv4_at(buf: &[u8], offset: usize) -> Option<Ipv4Addr> {
    let b = buf.get(offset..offset + 4)?;
    Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
}

/// Decode a DHCP frame.
pub fn parse(frame: &[u8]) -> Result<DhcpPacket, ResponderError> {
    let eth = packet::parse_ethernet(frame).ok_or_else(|| malformed("short ethernet header"))?;
    if eth.eth_type != ETH_TYPE_IPV4 {
        return Err(malformed("not an IPv4 ethertype"));
    }
    let udp = packet::parse_udp(eth.payload).ok_or_else(|| malformed("not a UDP datagram"))?;
    let bootp = udp.payload;
    if bootp.len() < BOOTP_LEN + MAGIC_COOKIE.len()
        || bootp[BOOTP_LEN..BOOTP_LEN + 4] != MAGIC_COOKIE
    {
        return Err(malformed("missing BOOTP header or magic cookie"));
    }

    let xid = u32::from_be_bytes([bootp[4], bootp[5], bootp[6], bootp[7]]);
    let yiaddr = ipv4_at(bootp, 16).ok_or_else(|| malformed("short BOOTP header"))?;
    let chaddr = MacAddress(
        bootp[28..34]
            .try_into()
            .map_err(|_| malformed("short client hardware address"))?,
    );

    let mut message_type = None;
    let mut server_id = None;
    let mut requested_ip = None;
    let mut options = &bootp[BOOTP_LEN + 4..];
    while let Some((&code, rest)) = options.split_first() {
        match code {
            OPT_END => break,
            OPT_PAD => {
                options = rest;
                continue;
            }
            _ => {}
        }
        let (&len, rest) = rest.split_first().ok_or_else(|| malformed("truncated option"))?;
        let value = rest
            .get(..usize::from(len))
            .ok_or_else(|| malformed("option exceeds frame"))?;
        match code {
            OPT_MESSAGE_TYPE => {
                message_type = value.first().copied().and_then(DhcpMessageType::from_code)
            }
            OPT_SERVER_ID => server_id = ipv4_at(value, 0),
            OPT_REQUESTED_IP => requested_ip = ipv4_at(value, 0),
            _ => {}
        }
        options = &rest[usize::from(len)..];
    }

    Ok(DhcpPacket {
        message_type: message_type.ok_or_else(|| malformed("missing message type option"))?,
        xid,
        chaddr,
        yiaddr,
        server_id,
        requested_ip,
        vlans: eth.vlans,
    })
}

/// Transaction id a device uses, derived from its hardware address.
pub fn xid_for(mac: MacAddress) -> u32 {
    let o = mac.octets();
    u32::from_be_bytes([o[2], o[3], o[4], o[5]])
}

/// Address the bulk-runner server assigns to the device with address `mac`.
pub fn address_for(mac: MacAddress) -> Ipv4Addr {
    let o = mac.octets();
    Ipv4Addr::new(10, 0, o[4], o[5])
}

struct Message {
    op: u8,
    message_type: DhcpMessageType,
    xid: u32,
    chaddr: MacAddress,
    yiaddr: Ipv4Addr,
    options: Vec<(u8, Vec<u8>)>,
}

impl Message {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(BOOTP_LEN + 64);
        buf.put_u8(self.op);
        buf.put_u8(1); // htype ethernet
        buf.put_u8(6); // hlen
        buf.put_u8(0); // hops
        buf.put_u32(self.xid);
        buf.put_u16(0); // secs
        buf.put_u16(FLAG_BROADCAST);
        buf.put_slice(&Ipv4Addr::UNSPECIFIED.octets()); // ciaddr
        buf.put_slice(&self.yiaddr.octets());
        let siaddr = if self.op == BOOTP_REPLY {
            SERVER_ADDRESS
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        buf.put_slice(&siaddr.octets());
        buf.put_slice(&Ipv4Addr::UNSPECIFIED.octets()); // giaddr
        buf.put_slice(&self.chaddr.octets());
        buf.put_bytes(0, 10 + 64 + 128); // chaddr padding, sname, file

        buf.put_slice(&MAGIC_COOKIE);
        buf.put_slice(&[OPT_MESSAGE_TYPE, 1, self.message_type.code()]);
        for (code, value) in &self.options {
            buf.put_u8(*code);
            buf.put_u8(value.len() as u8);
            buf.put_slice(value);
        }
        buf.put_u8(OPT_END);
        buf
    }
}

fn client_frame(mac: MacAddress, c_tag: u16, message: &Message) -> Bytes {
    let header = packet::ethernet_header(MacAddress::BROADCAST, mac, &[c_tag], ETH_TYPE_IPV4);
    let ip = packet::ipv4_udp(
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::BROADCAST,
        DHCP_CLIENT_PORT,
        DHCP_SERVER_PORT,
        &message.encode(),
    );
    packet::finish(header, &ip)
}

fn server_frame(mac: MacAddress, s_tag: u16, c_tag: u16, message: &Message) -> Bytes {
    let header = packet::ethernet_header(mac, SERVER_HW_ADDRESS, &[s_tag, c_tag], ETH_TYPE_IPV4);
    let ip = packet::ipv4_udp(
        SERVER_ADDRESS,
        Ipv4Addr::BROADCAST,
        DHCP_SERVER_PORT,
        DHCP_CLIENT_PORT,
        &message.encode(),
    );
    packet::finish(header, &ip)
}

/// Open the exchange on the client side.
pub fn discover(mac: MacAddress, c_tag: u16) -> Exchange {
    let message = Message {
        op: BOOTP_REQUEST,
        message_type: DhcpMessageType::Discover,
        xid: xid_for(mac),
        chaddr: mac,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        options: Vec::new(),
    };
    Exchange::reply_then(client_frame(mac, c_tag, &message), OnuEvent::DhcpDiscoverySent)
}

/// Client step: answer a frame sent by the server.
pub fn client_next(mac: MacAddress, c_tag: u16, frame: &[u8]) -> Result<Exchange, ResponderError> {
    let packet = parse(frame)?;
    if packet.chaddr != mac {
        return Err(ResponderError::Unexpected {
            protocol: PROTOCOL,
            message: format!("reply for {} received by {mac}", packet.chaddr),
        });
    }

    match packet.message_type {
        DhcpMessageType::Offer => {
            let mut options = vec![(OPT_REQUESTED_IP, packet.yiaddr.octets().to_vec())];
            if let Some(server) = packet.server_id {
                options.push((OPT_SERVER_ID, server.octets().to_vec()));
            }
            let request = Message {
                op: BOOTP_REQUEST,
                message_type: DhcpMessageType::Request,
                xid: packet.xid,
                chaddr: mac,
                yiaddr: Ipv4Addr::UNSPECIFIED,
                options,
            };
            Ok(Exchange::reply_then(
                client_frame(mac, c_tag, &request),
                OnuEvent::DhcpRequestSent,
            ))
        }
        DhcpMessageType::Ack => Ok(Exchange::transition(OnuEvent::DhcpAckReceived).completed()),
        DhcpMessageType::Nak => Ok(Exchange::transition(OnuEvent::DhcpFailed).completed()),
        other => Err(unexpected(other, "client")),
    }
}

/// Server step: answer a frame sent by the device with address `mac`.
///
/// The Ack completes the exchange.
pub fn server_next(
    mac: MacAddress,
    s_tag: u16,
    c_tag: u16,
    frame: &[u8],
) -> Result<Exchange, ResponderError> {
    let packet = parse(frame)?;
    let assigned = address_for(mac);
    let lease_options = vec![
        (OPT_SERVER_ID, SERVER_ADDRESS.octets().to_vec()),
        (OPT_SUBNET_MASK, vec![255, 255, 255, 0]),
        (OPT_LEASE_TIME, LEASE_TIME_SECS.to_be_bytes().to_vec()),
    ];

    let message_type = match packet.message_type {
        DhcpMessageType::Discover => DhcpMessageType::Offer,
        DhcpMessageType::Request => DhcpMessageType::Ack,
        other => return Err(unexpected(other, "server")),
    };
    let reply = Message {
        op: BOOTP_REPLY,
        message_type,
        xid: packet.xid,
        chaddr: packet.chaddr,
        yiaddr: assigned,
        options: lease_options,
    };
    let exchange = Exchange::reply(server_frame(mac, s_tag, c_tag, &reply));
    if message_type == DhcpMessageType::Ack {
        Ok(exchange.completed())
    } else {
        Ok(exchange)
    }
}
