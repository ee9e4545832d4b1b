// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Extraction of the TCP 4-tuple from a raw IPv4 packet.

use etherparse::{IpNumber, Ipv4HeaderSlice, TcpHeaderSlice};
use std::net::{Ipv4Addr, SocketAddrV4};

/// The addresses of a TCP segment, as carried in its IPv4 and TCP headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFlow {
    /// Source address and port.
    pub src: SocketAddrV4,
    /// Destination address and port.
    pub dst: SocketAddrV4,
}

/// Parse the IPv4 and TCP headers of `packet` and return its 4-tuple.
///
/// Returns `None` for anything which is not a well-formed IPv4/TCP packet:
/// truncated headers, a version other than 4, or a non-TCP protocol. Such
/// packets are of no interest to the classifier and are silently dropped.
#[must_use]
pub fn tcp_flow(packet: &[u8]) -> Option<TcpFlow> {
    let ip = Ipv4HeaderSlice::from_slice(packet).ok()?;
    if ip.protocol() != IpNumber::TCP {
        return None;
    }
    let tcp = TcpHeaderSlice::from_slice(&packet[ip.slice().len()..]).ok()?;
    Some(TcpFlow {
        src: SocketAddrV4::new(Ipv4Addr::from(ip.source()), tcp.source_port()),
        dst: SocketAddrV4::new(Ipv4Addr::from(ip.destination()), tcp.destination_port()),
    })
}

#[cfg(test)]
mod test {
    use super::tcp_flow;
    use etherparse::PacketBuilder;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn tcp_packet(src: SocketAddrV4, dst: SocketAddrV4) -> Vec<u8> {
        let mut packet = Vec::new();
        PacketBuilder::ipv4(src.ip().octets(), dst.ip().octets(), 64)
            .tcp(src.port(), dst.port(), 1, 4096)
            .write(&mut packet, &[])
            .unwrap();
        packet
    }

    #[test]
    fn extracts_four_tuple() {
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 49152);
        let dst = SocketAddrV4::new(Ipv4Addr::new(169, 254, 169, 254), 80);
        let flow = tcp_flow(&tcp_packet(src, dst)).unwrap();
        assert_eq!(flow.src, src);
        assert_eq!(flow.dst, dst);
    }

    #[test]
    fn rejects_udp() {
        let mut packet = Vec::new();
        PacketBuilder::ipv4([10, 0, 0, 7], [169, 254, 169, 254], 64)
            .udp(49152, 80)
            .write(&mut packet, &[])
            .unwrap();
        assert_eq!(tcp_flow(&packet), None);
    }

    #[test]
    fn rejects_truncated() {
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 49152);
        let dst = SocketAddrV4::new(Ipv4Addr::new(169, 254, 169, 254), 80);
        let packet = tcp_packet(src, dst);
        for len in 0..packet.len().min(40) {
            assert_eq!(tcp_flow(&packet[..len]), None, "length {len}");
        }
    }

    #[test]
    fn rejects_non_v4() {
        let mut packet = Vec::new();
        PacketBuilder::ipv6([1; 16], [2; 16], 64)
            .tcp(49152, 80, 1, 4096)
            .write(&mut packet, &[])
            .unwrap();
        assert_eq!(tcp_flow(&packet), None);
    }
}
