// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The per-packet classification paths between the host tunnel, the
//! compartment tunnel, and the external interface.
//!
//! Packets surfacing on the host tunnel are either the proxy's own upstream
//! traffic (recognizable because the connection table learned the source
//! port before the SYN existed) or tenant traffic to be steered into the
//! compartment. The reverse path is an unconditional copy.

use crate::conns::ConnTable;
use crate::errors::FilterdError;
use afpacket::sync::RawPacketStream;
use net::eth::frame_header;
use net::flow::tcp_flow;
use routing::RouteDecision;
use std::io::{self, Write};
use std::net::SocketAddrV4;
use tracing::trace;
use tunnel::TunDevice;

/* Maximum length of an IPv4 packet. */
const MAX_PACKET: usize = 65535;

/* Room for an Ethernet header in front of the packet. */
const ETH_HDR: usize = 14;

/// Which way the outward path sent (or did not send) a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Steer {
    /// One of our own upstream packets: out the external interface.
    External,
    /// Tenant traffic: into the compartment.
    Compartment,
    /// Not an IPv4/TCP packet; silently dropped.
    Drop,
}

/// Decide where a packet read off the host tunnel belongs.
///
/// Our own flows are exactly those whose source the connection table vouches
/// for and whose destination is the metadata endpoint.
fn classify(packet: &[u8], conns: &ConnTable, target: SocketAddrV4) -> Steer {
    match tcp_flow(packet) {
        None => Steer::Drop,
        Some(flow) => {
            if conns.owns(flow.src) && flow.dst == target {
                Steer::External
            } else {
                Steer::Compartment
            }
        }
    }
}

/// The host-tunnel to external/compartment packet path.
pub struct OutPath {
    ext: RawPacketStream,
    target: SocketAddrV4,
    /// Prestaged Ethernet header followed by the packet read buffer.
    frame: Box<[u8; ETH_HDR + MAX_PACKET]>,
}

impl OutPath {
    /// Open the raw send path on the external interface and prestage the
    /// Ethernet header `[gw_mac][src_mac][0x08 0x00]`.
    pub fn new(decision: &RouteDecision, target: SocketAddrV4) -> Result<OutPath, FilterdError> {
        let mut ext = RawPacketStream::new().map_err(FilterdError::Io)?;
        ext.bind(decision.if_name.as_ref())
            .map_err(FilterdError::Io)?;
        let mut frame = Box::new([0u8; ETH_HDR + MAX_PACKET]);
        frame[..ETH_HDR].copy_from_slice(&frame_header(decision.gw_mac, decision.src_mac));
        Ok(OutPath {
            ext,
            target,
            frame,
        })
    }

    /// Drain the host tunnel: classify each packet and forward it out the
    /// external interface or into the compartment tunnel.
    ///
    /// # Errors
    ///
    /// EOF on the tunnel and any read or write error are fatal.
    pub fn ready(
        &mut self,
        host_tun: &TunDevice,
        jail_tun: &TunDevice,
        conns: &ConnTable,
    ) -> Result<(), FilterdError> {
        loop {
            let len = match host_tun.read(&mut self.frame[ETH_HDR..]) {
                Ok(0) => return Err(FilterdError::TunnelEof),
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FilterdError::TunnelRead(e)),
            };
            match classify(&self.frame[ETH_HDR..ETH_HDR + len], conns, self.target) {
                Steer::External => {
                    trace!("frame of {len} bytes out the external interface");
                    self.ext
                        .write_all(&self.frame[..ETH_HDR + len])
                        .map_err(FilterdError::ExternalWrite)?;
                }
                Steer::Compartment => {
                    jail_tun
                        .write_all(&self.frame[ETH_HDR..ETH_HDR + len])
                        .map_err(FilterdError::TunnelWrite)?;
                }
                Steer::Drop => {}
            }
        }
    }
}

/// The compartment-tunnel to host-tunnel packet path: an unconditional copy.
pub struct InPath {
    buf: Box<[u8; MAX_PACKET]>,
}

impl Default for InPath {
    fn default() -> InPath {
        InPath::new()
    }
}

impl InPath {
    pub fn new() -> InPath {
        InPath {
            buf: Box::new([0u8; MAX_PACKET]),
        }
    }

    /// Drain the compartment tunnel into the host tunnel.
    ///
    /// # Errors
    ///
    /// EOF on the tunnel and any read or write error are fatal.
    pub fn ready(&mut self, host_tun: &TunDevice, jail_tun: &TunDevice) -> Result<(), FilterdError> {
        loop {
            let len = match jail_tun.read(&mut self.buf[..]) {
                Ok(0) => return Err(FilterdError::TunnelEof),
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FilterdError::TunnelRead(e)),
            };
            host_tun
                .write_all(&self.buf[..len])
                .map_err(FilterdError::TunnelWrite)?;
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Steer, classify};
    use crate::conns::ConnTable;
    use etherparse::PacketBuilder;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};

    const TARGET: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(169, 254, 169, 254), 80);

    fn tcp_packet(src: SocketAddrV4, dst: SocketAddrV4) -> Vec<u8> {
        let mut packet = Vec::new();
        PacketBuilder::ipv4(src.ip().octets(), dst.ip().octets(), 64)
            .tcp(src.port(), dst.port(), 1, 4096)
            .write(&mut packet, &[])
            .unwrap();
        packet
    }

    fn local_v4(stream: &TcpStream) -> SocketAddrV4 {
        match stream.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => panic!("loopback socket is not IPv4"),
        }
    }

    #[test]
    fn our_flows_go_external() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let ours = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let src = local_v4(&ours);

        let mut conns = ConnTable::new();
        conns.insert(&ours).unwrap();

        let packet = tcp_packet(src, TARGET);
        assert_eq!(classify(&packet, &conns, TARGET), Steer::External);

        // Same source, but aimed somewhere other than the metadata service.
        let elsewhere = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443);
        let packet = tcp_packet(src, elsewhere);
        assert_eq!(classify(&packet, &conns, TARGET), Steer::Compartment);
    }

    #[test]
    fn tenant_flows_go_to_the_compartment() {
        let conns = ConnTable::new();
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 49152);
        let packet = tcp_packet(src, TARGET);
        assert_eq!(classify(&packet, &conns, TARGET), Steer::Compartment);
    }

    #[test]
    fn non_tcp_is_dropped() {
        let conns = ConnTable::new();
        let mut packet = Vec::new();
        PacketBuilder::ipv4([10, 0, 0, 7], [169, 254, 169, 254], 64)
            .udp(49152, 80)
            .write(&mut packet, &[])
            .unwrap();
        assert_eq!(classify(&packet, &conns, TARGET), Steer::Drop);
        assert_eq!(classify(&[0u8; 12], &conns, TARGET), Steer::Drop);
    }
}
