//! The normalized dissection-info record
//!
//! Shrike does not parse packets. The caller runs whatever header parser it
//! likes and hands the engine one of these per packet, together with the
//! application payload slice. Everything the flow table and the classifiers
//! need from L3/L4 lives here.

use std::net::IpAddr;

use bitflags::bitflags;

/// Transport protocol carried in the 5-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Proto {
    /// TCP (protocol number 6)
    Tcp,
    /// UDP (protocol number 17)
    Udp,
    /// Any other transport, kept by protocol number
    Other(u8),
}

impl L4Proto {
    /// IANA protocol number.
    #[inline(always)]
    pub const fn number(self) -> u8 {
        match self {
            L4Proto::Tcp => 6,
            L4Proto::Udp => 17,
            L4Proto::Other(n) => n,
        }
    }
}

impl From<u8> for L4Proto {
    fn from(n: u8) -> Self {
        match n {
            6 => L4Proto::Tcp,
            17 => L4Proto::Udp,
            other => L4Proto::Other(other),
        }
    }
}

bitflags! {
    /// TCP control flags observed on a single segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TcpHeaderFlags: u8 {
        /// FIN
        const FIN = 0x01;
        /// SYN
        const SYN = 0x02;
        /// RST
        const RST = 0x04;
        /// PSH
        const PSH = 0x08;
        /// ACK
        const ACK = 0x10;
    }
}

/// L4 metadata for a TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegmentMeta {
    /// Sequence number (host byte order).
    pub seq: u32,
    /// Acknowledgment number (host byte order, meaningful when ACK is set).
    pub ack: u32,
    /// Control flags on this segment.
    pub flags: TcpHeaderFlags,
}

/// Parsed-header record for one packet, supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DissectionInfo {
    /// Source address as seen on the wire.
    pub addr_src: IpAddr,
    /// Destination address as seen on the wire.
    pub addr_dst: IpAddr,
    /// Source port.
    pub port_src: u16,
    /// Destination port.
    pub port_dst: u16,
    /// Transport protocol.
    pub l4_proto: L4Proto,
    /// TCP segment metadata, present only for TCP packets.
    pub tcp: Option<TcpSegmentMeta>,
}

impl DissectionInfo {
    /// Dissection record for a UDP datagram.
    pub fn udp(addr_src: IpAddr, port_src: u16, addr_dst: IpAddr, port_dst: u16) -> Self {
        Self {
            addr_src,
            addr_dst,
            port_src,
            port_dst,
            l4_proto: L4Proto::Udp,
            tcp: None,
        }
    }

    /// Dissection record for a TCP segment.
    pub fn tcp(
        addr_src: IpAddr,
        port_src: u16,
        addr_dst: IpAddr,
        port_dst: u16,
        meta: TcpSegmentMeta,
    ) -> Self {
        Self {
            addr_src,
            addr_dst,
            port_src,
            port_dst,
            l4_proto: L4Proto::Tcp,
            tcp: Some(meta),
        }
    }

    /// True when both addresses are IPv4.
    #[inline(always)]
    pub fn is_v4(&self) -> bool {
        self.addr_src.is_ipv4() && self.addr_dst.is_ipv4()
    }

    /// True when both addresses are IPv6.
    #[inline(always)]
    pub fn is_v6(&self) -> bool {
        self.addr_src.is_ipv6() && self.addr_dst.is_ipv6()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l4_proto_roundtrip() {
        assert_eq!(L4Proto::from(6), L4Proto::Tcp);
        assert_eq!(L4Proto::from(17), L4Proto::Udp);
        assert_eq!(L4Proto::from(47).number(), 47);
    }

    #[test]
    fn udp_record_has_no_tcp_meta() {
        let info = DissectionInfo::udp(
            "10.0.0.1".parse().unwrap(),
            17500,
            "10.0.0.2".parse().unwrap(),
            17500,
        );
        assert!(info.tcp.is_none());
        assert!(info.is_v4());
    }
}
