//! Packet classification for the firewall.
//!
//! This module decodes a raw network-layer buffer, as delivered by the kernel
//! packet queue, into a normalized [`PacketDescriptor`] used by the DoS
//! detector and the rule engine.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// IPv4 "more fragments" flag
const IPV4_MORE_FRAGMENTS: u8 = 0b001;

/// Errors that can occur while classifying a packet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
}

impl ClassifyError {
    fn malformed(reason: impl Into<String>) -> Self {
        ClassifyError::MalformedPacket(reason.into())
    }
}

/// Transport protocol of a classified packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Other => "other",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            "other" => Ok(Protocol::Other),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// Normalized view of one queued packet
///
/// Ports are only present for TCP and UDP packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketDescriptor {
    /// Transport protocol
    pub protocol: Protocol,
    /// Source address
    pub source: IpAddr,
    /// Destination address
    pub destination: IpAddr,
    /// Source port (TCP/UDP only)
    pub source_port: Option<u16>,
    /// Destination port (TCP/UDP only)
    pub destination_port: Option<u16>,
}

impl PacketDescriptor {
    fn without_ports(protocol: Protocol, source: IpAddr, destination: IpAddr) -> Self {
        Self {
            protocol,
            source,
            destination,
            source_port: None,
            destination_port: None,
        }
    }
}

/// Classify a raw network-layer buffer
///
/// # Arguments
///
/// * `buf` - The IPv4 or IPv6 packet, starting at the IP header
///
/// # Returns
///
/// * `Ok(PacketDescriptor)` for any well-formed IP packet; fragmented or
///   unrecognized packets classify as [`Protocol::Other`]
/// * `Err(ClassifyError::MalformedPacket)` if the buffer cannot be parsed
pub fn classify(buf: &[u8]) -> Result<PacketDescriptor, ClassifyError> {
    let version = buf
        .first()
        .map(|b| b >> 4)
        .ok_or_else(|| ClassifyError::malformed("empty buffer"))?;

    match version {
        4 => classify_ipv4(buf),
        6 => classify_ipv6(buf),
        v => Err(ClassifyError::malformed(format!("unsupported IP version {}", v))),
    }
}

fn classify_ipv4(buf: &[u8]) -> Result<PacketDescriptor, ClassifyError> {
    let ip = Ipv4Packet::new(buf).ok_or_else(|| ClassifyError::malformed("truncated IPv4 header"))?;

    let header_len = usize::from(ip.get_header_length()) * 4;
    let total_len = usize::from(ip.get_total_length());
    if header_len < Ipv4Packet::minimum_packet_size() || header_len > buf.len() {
        return Err(ClassifyError::malformed(format!(
            "invalid IPv4 header length {}",
            header_len
        )));
    }
    if total_len < header_len {
        return Err(ClassifyError::malformed(format!(
            "IPv4 total length {} shorter than header",
            total_len
        )));
    }

    let source = IpAddr::V4(ip.get_source());
    let destination = IpAddr::V4(ip.get_destination());

    let fragmented =
        ip.get_fragment_offset() != 0 || ip.get_flags() & IPV4_MORE_FRAGMENTS != 0;
    if fragmented {
        return Ok(PacketDescriptor::without_ports(Protocol::Other, source, destination));
    }

    let end = total_len.min(buf.len());
    classify_transport(ip.get_next_level_protocol(), &buf[header_len..end], source, destination)
}

fn classify_ipv6(buf: &[u8]) -> Result<PacketDescriptor, ClassifyError> {
    let ip = Ipv6Packet::new(buf).ok_or_else(|| ClassifyError::malformed("truncated IPv6 header"))?;

    let source = IpAddr::V6(ip.get_source());
    let destination = IpAddr::V6(ip.get_destination());

    // Extension headers are not walked; such packets classify as Other.
    classify_transport(ip.get_next_header(), ip.payload(), source, destination)
}

fn classify_transport(
    next: IpNextHeaderProtocol,
    payload: &[u8],
    source: IpAddr,
    destination: IpAddr,
) -> Result<PacketDescriptor, ClassifyError> {
    let (protocol, ports) = match next {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(payload)
                .ok_or_else(|| ClassifyError::malformed("truncated TCP header"))?;
            (Protocol::Tcp, Some((tcp.get_source(), tcp.get_destination())))
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(payload)
                .ok_or_else(|| ClassifyError::malformed("truncated UDP header"))?;
            (Protocol::Udp, Some((udp.get_source(), udp.get_destination())))
        }
        IpNextHeaderProtocols::Icmp | IpNextHeaderProtocols::Icmpv6 => (Protocol::Icmp, None),
        _ => (Protocol::Other, None),
    };

    Ok(PacketDescriptor {
        protocol,
        source,
        destination,
        source_port: ports.map(|(s, _)| s),
        destination_port: ports.map(|(_, d)| d),
    })
}

/// Helpers for building raw packets in tests and benchmarks.
#[doc(hidden)]
pub mod build {
    use std::net::{Ipv4Addr, Ipv6Addr};

    /// Build an IPv4 packet with the given protocol number and transport bytes.
    pub fn ipv4(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, transport: &[u8]) -> Vec<u8> {
        let total = 20 + transport.len();
        let mut buf = vec![0u8; 20];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        buf[8] = 64;
        buf[9] = protocol;
        buf[12..16].copy_from_slice(&src.octets());
        buf[16..20].copy_from_slice(&dst.octets());
        buf.extend_from_slice(transport);
        buf
    }

    /// Build an IPv6 packet with the given next-header number and payload.
    pub fn ipv6(next_header: u8, src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 40];
        buf[0] = 0x60;
        buf[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        buf[6] = next_header;
        buf[7] = 64;
        buf[8..24].copy_from_slice(&src.octets());
        buf[24..40].copy_from_slice(&dst.octets());
        buf.extend_from_slice(payload);
        buf
    }

    /// Minimal 20-byte TCP header.
    pub fn tcp(sport: u16, dport: u16) -> Vec<u8> {
        let mut hdr = vec![0u8; 20];
        hdr[0..2].copy_from_slice(&sport.to_be_bytes());
        hdr[2..4].copy_from_slice(&dport.to_be_bytes());
        hdr[12] = 5 << 4;
        hdr[13] = 0x02;
        hdr
    }

    /// 8-byte UDP header.
    pub fn udp(sport: u16, dport: u16) -> Vec<u8> {
        let mut hdr = vec![0u8; 8];
        hdr[0..2].copy_from_slice(&sport.to_be_bytes());
        hdr[2..4].copy_from_slice(&dport.to_be_bytes());
        hdr[4..6].copy_from_slice(&8u16.to_be_bytes());
        hdr
    }

    /// ICMP echo request header.
    pub fn icmp_echo() -> Vec<u8> {
        vec![8, 0, 0, 0, 0, 1, 0, 1]
    }
}
